//! Bridge between the consensus library and the metastore.
//!
//! Leader election and log replication are provided by the embedding
//! process through [`RaftHandle`]. This module adds what the metastore needs
//! on top: command proposals with leader hints, and the read-index protocol
//! that lets any replica serve linearizable reads.

mod read;
pub use read::*;

#[cfg(test)]
mod raftnode_test;
#[cfg(test)]
mod read_test;

use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;

#[cfg(test)]
use mockall::automock;
use tonic::async_trait;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::raft_log::Command;
use crate::ConsensusError;
use crate::Error;
use crate::Metrics;
use crate::RaftConfig;
use crate::Result;

/// Lower bound of the state a read must observe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReadIndex {
    /// Last index the leader knows to be committed on a quorum.
    pub commit_index: u64,
    /// Term in which the leader observed the commit index.
    pub term: u64,
}

/// Consensus library as seen by the metastore.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait RaftHandle: Send + Sync + 'static {
    fn is_leader(&self) -> bool;

    /// Address of the current leader, if known.
    fn leader_addr(&self) -> Option<String>;

    fn current_term(&self) -> u64;

    fn commit_index(&self) -> u64;

    /// Index of the last entry in the local log.
    fn last_index(&self) -> u64;

    /// Confirms leadership with a round of heartbeats.
    async fn verify_leader(&self) -> Result<()>;

    /// Appends the entry and resolves once it has been applied locally,
    /// with the state machine's response.
    async fn apply(
        &self,
        entry: Vec<u8>,
        timeout: Duration,
    ) -> Result<Vec<u8>>;

    async fn transfer_leadership(&self) -> Result<()>;
}

/// Source of read indices: the local node when it leads, or a client of the
/// leader on followers.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Leader: Send + Sync + 'static {
    async fn read_index(&self) -> Result<ReadIndex>;
}

/// Submits commands to the replicated log.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Proposer: Send + Sync + 'static {
    async fn propose(
        &self,
        command: Command,
    ) -> Result<Vec<u8>>;
}

pub struct RaftNode<R: RaftHandle> {
    config: RaftConfig,
    raft: Arc<R>,
    metrics: Arc<Metrics>,
}

impl<R: RaftHandle> std::fmt::Debug for RaftNode<R> {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("RaftNode").field("config", &self.config).finish()
    }
}

impl<R: RaftHandle> RaftNode<R> {
    pub fn new(
        config: RaftConfig,
        raft: Arc<R>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            config,
            raft,
            metrics,
        }
    }

    pub fn config(&self) -> &RaftConfig {
        &self.config
    }

    pub fn is_leader(&self) -> bool {
        self.raft.is_leader()
    }

    /// Fails with a "not leader" error pointing at the current leader unless
    /// this node leads.
    pub fn ensure_leader(&self) -> Result<()> {
        if self.raft.is_leader() {
            return Ok(());
        }
        Err(Error::not_leader(self.raft.leader_addr()))
    }

    /// Fills in the leader address on "not leader" errors that lack one.
    fn with_leader_hint(
        &self,
        err: Error,
    ) -> Error {
        match err {
            Error::Consensus(ConsensusError::NotLeader { leader_hint: None }) => {
                Error::not_leader(self.raft.leader_addr())
            }
            e => e,
        }
    }

    async fn leader_read_index(&self) -> Result<ReadIndex> {
        // A new leader only knows which entries are committed once an entry
        // of its own term is: wait for the commit index to reach the end of
        // the log before trusting it.
        let term = self.raft.current_term();
        let raft = self.raft.clone();
        let wait = wait_index_reached(
            move || raft.commit_index(),
            self.raft.last_index(),
            self.config.log_index_check_interval(),
            self.config.read_index_max_distance,
        );
        match tokio::time::timeout(self.config.apply_timeout(), wait).await {
            Ok(result) => result?,
            Err(_) => return Err(ConsensusError::Timeout.into()),
        }

        let commit_index = self.raft.commit_index();
        self.raft.verify_leader().await?;
        // Commit index and heartbeats must belong to the same term.
        if self.raft.current_term() != term {
            return Err(ConsensusError::LeadershipLost.into());
        }
        Ok(ReadIndex { commit_index, term })
    }

    /// Best effort: hands leadership over before the node stops. Returns
    /// whether leadership was transferred.
    pub async fn transfer_leadership(&self) -> bool {
        match self.raft.transfer_leadership().await {
            Ok(()) => {
                info!("leadership transferred");
                true
            }
            Err(e) if e.is_not_leader() => {
                debug!("not the leader; nothing to transfer");
                false
            }
            Err(e) => {
                warn!(%e, "failed to transfer leadership");
                false
            }
        }
    }
}

#[async_trait]
impl<R: RaftHandle> Leader for RaftNode<R> {
    async fn read_index(&self) -> Result<ReadIndex> {
        let started = Instant::now();
        let result = self.leader_read_index().await.map_err(|e| self.with_leader_hint(e));
        self.metrics
            .read_index_duration
            .with_label_values(&["leader"])
            .observe(started.elapsed().as_secs_f64());
        result
    }
}

#[async_trait]
impl<R: RaftHandle> Proposer for RaftNode<R> {
    async fn propose(
        &self,
        command: Command,
    ) -> Result<Vec<u8>> {
        let command_type = command.command_type();
        debug!(command = command_type.as_str(), "proposing command");
        self.raft
            .apply(command.encode(), self.config.apply_timeout())
            .await
            .map_err(|e| self.with_leader_hint(e))
    }
}

//! Metastore service.
//!
//! [`Metastore`] is what the RPC layer talks to. Writes are proposed through
//! the replicated log; compaction polls are planned on the leader and the
//! resulting plan is proposed as a single command; metadata queries are
//! served from local state once the consistent-read gate has passed.

mod state;
pub use state::*;

#[cfg(test)]
mod metastore_test;

use std::sync::Arc;

use prost::Message;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tonic_health::server::HealthReporter;
use tonic_health::ServingStatus;
use tracing::debug;
use tracing::info;

use crate::cleaner::ObjectBucket;
use crate::constants::HEALTH_SERVICE_NAME;
use crate::fsm::Fsm;
use crate::proto::AddBlockRequest;
use crate::proto::AddBlockResponse;
use crate::proto::CompactionPlanResult;
use crate::proto::PollCompactionJobsRequest;
use crate::proto::PollCompactionJobsResponse;
use crate::proto::QueryMetadataRequest;
use crate::proto::QueryMetadataResponse;
use crate::proto::ReadIndexResponse;
use crate::raft_log::Command;
use crate::raftnode::Leader;
use crate::raftnode::Proposer;
use crate::raftnode::RaftHandle;
use crate::raftnode::RaftNode;
use crate::raftnode::StateReader;
use crate::utils::time::now_nanos;
use crate::ConsensusError;
use crate::MetastoreConfig;
use crate::Metrics;
use crate::Result;

pub struct Metastore<R: RaftHandle> {
    config: MetastoreConfig,
    node: Arc<RaftNode<R>>,
    fsm: Arc<Fsm>,
    state: Arc<MetastoreState>,
    reader: StateReader,
    /// Plans are computed from a copy of the state: one at a time.
    poll_lock: Mutex<()>,
    health: HealthReporter,
    shutdown: CancellationToken,
}

impl<R: RaftHandle> std::fmt::Debug for Metastore<R> {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("Metastore")
            .field("node", &self.node)
            .field("fsm", &self.fsm)
            .finish()
    }
}

impl<R: RaftHandle> Metastore<R> {
    /// `leader` serves read indices: the local node when this replica can
    /// only be read through itself, or a client of the remote leader.
    pub fn new(
        config: MetastoreConfig,
        node: Arc<RaftNode<R>>,
        leader: Arc<dyn Leader>,
        fsm: Arc<Fsm>,
        state: Arc<MetastoreState>,
        health: HealthReporter,
        metrics: Arc<Metrics>,
    ) -> Self {
        let reader = StateReader::new(leader, fsm.clone(), &config.raft, metrics);
        Self {
            config,
            node,
            fsm,
            state,
            reader,
            poll_lock: Mutex::new(()),
            health,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn fsm(&self) -> &Arc<Fsm> {
        &self.fsm
    }

    pub fn state(&self) -> &Arc<MetastoreState> {
        &self.state
    }

    pub async fn add_block(
        &self,
        request: AddBlockRequest,
    ) -> Result<AddBlockResponse> {
        self.ensure_running()?;
        let response = self.node.propose(Command::AddBlock(request)).await?;
        Ok(AddBlockResponse::decode(response.as_slice())?)
    }

    /// Reports the worker's job statuses and hands out up to
    /// `job_capacity` jobs. Leader only.
    pub async fn poll_compaction_jobs(
        &self,
        request: PollCompactionJobsRequest,
    ) -> Result<PollCompactionJobsResponse> {
        self.ensure_running()?;
        self.node.ensure_leader()?;
        let _guard = self.poll_lock.lock().await;

        let plan = self.state.compactor().prepare(&request, now_nanos())?;
        let noop = plan.is_noop();
        let mut cancelled = plan.cancelled;
        let mut assigned = Vec::new();
        if noop {
            debug!(cancelled = cancelled.len(), "nothing to plan");
        } else {
            let update = plan.update;
            debug!(
                completed = update.completed.len(),
                renewed = update.renewed.len(),
                failed = update.failed.len(),
                new_jobs = update.new_jobs.len(),
                assigned = update.assigned.len(),
                "proposing compaction plan"
            );
            let response = self.node.propose(Command::UpdateCompactionPlan(update)).await?;
            let result = CompactionPlanResult::decode(response.as_slice())?;
            cancelled.extend(result.cancelled);
            assigned = result.assigned;
        }

        cancelled.sort();
        cancelled.dedup();
        Ok(PollCompactionJobsResponse {
            compaction_jobs: assigned,
            cancelled_jobs: cancelled,
        })
    }

    /// Blocks matching the request, as of a state at least as recent as any
    /// write acknowledged before the call.
    pub async fn query_metadata(
        &self,
        request: QueryMetadataRequest,
    ) -> Result<QueryMetadataResponse> {
        let index = self.state.index();
        let blocks = self
            .reader
            .consistent_read(|tx, _| index.query(tx, &request))
            .await?;
        Ok(QueryMetadataResponse { blocks })
    }

    /// Leader only.
    pub async fn read_index(&self) -> Result<ReadIndexResponse> {
        let read_index = self.node.read_index().await?;
        Ok(ReadIndexResponse {
            commit_index: read_index.commit_index,
            term: read_index.term,
        })
    }

    /// Reports the node as serving once it has caught up with the leader.
    pub async fn check_ready(&self) -> Result<()> {
        let read_index = self.reader.wait_leader_commit_index_applied().await?;
        self.set_serving_status(ServingStatus::Serving).await;
        debug!(commit_index = read_index.commit_index, "node is ready");
        Ok(())
    }

    /// Starts the clean-up loop; it stops on [`Metastore::shutdown`].
    pub fn run_cleaner(
        &self,
        bucket: Arc<dyn ObjectBucket>,
    ) -> JoinHandle<()> {
        let cleaner = self.state.cleaner().clone();
        let proposer: Arc<dyn Proposer> = self.node.clone();
        let shutdown = self.shutdown.child_token();
        tokio::spawn(async move { cleaner.run(proposer, bucket, shutdown).await })
    }

    /// Stops background tasks and hands leadership over. The node keeps
    /// answering requests for the grace period after a transfer.
    pub async fn shutdown(&self) {
        info!("shutting down metastore");
        self.shutdown.cancel();
        self.set_serving_status(ServingStatus::NotServing).await;
        if self.node.transfer_leadership().await {
            info!("waiting for leadership transfer to complete");
            tokio::time::sleep(self.config.raft.shutdown_grace_period()).await;
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Writes are refused once shutdown has begun.
    fn ensure_running(&self) -> Result<()> {
        if self.is_shutting_down() {
            return Err(ConsensusError::ShuttingDown.into());
        }
        Ok(())
    }

    async fn set_serving_status(
        &self,
        status: ServingStatus,
    ) {
        let mut health = self.health.clone();
        health.set_service_status(HEALTH_SERVICE_NAME, status).await;
        info!(service = HEALTH_SERVICE_NAME, ?status, "health status changed");
    }
}

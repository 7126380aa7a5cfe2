//! Deferred deletion of compacted blocks.
//!
//! The leader periodically proposes a `CleanBlocks` command. Every replica
//! applying it drops its expired deletion markers, but only the node that
//! proposed that very request (recognised by its request id) deletes the
//! objects, so each object is deleted at most once per clean-up round even
//! across leadership changes.


use std::sync::Arc;

use futures::stream;
use futures::TryStreamExt;
#[cfg(test)]
use mockall::automock;
use nanoid::nanoid;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tonic::async_trait;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::markers::ExpiredBlock;
use crate::proto::CleanBlocksRequest;
use crate::raft_log::Command;
use crate::raftnode::Proposer;
use crate::CleanerConfig;
use crate::Metrics;

#[derive(Debug, thiserror::Error)]
pub enum BucketError {
    #[error("object not found")]
    NotFound,

    #[error("bucket operation failed: {0}")]
    Other(String),
}

/// Object storage holding the block files.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ObjectBucket: Send + Sync + 'static {
    async fn delete(
        &self,
        path: &str,
    ) -> std::result::Result<(), BucketError>;
}

pub struct Cleaner {
    config: CleanerConfig,
    last_request_id: Mutex<Option<String>>,
    expired_tx: mpsc::UnboundedSender<Vec<ExpiredBlock>>,
    expired_rx: Mutex<Option<mpsc::UnboundedReceiver<Vec<ExpiredBlock>>>>,
    metrics: Arc<Metrics>,
}

impl std::fmt::Debug for Cleaner {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("Cleaner")
            .field("last_request_id", &*self.last_request_id.lock())
            .finish()
    }
}

impl Cleaner {
    pub fn new(
        config: CleanerConfig,
        metrics: Arc<Metrics>,
    ) -> Self {
        let (expired_tx, expired_rx) = mpsc::unbounded_channel();
        Self {
            config,
            last_request_id: Mutex::new(None),
            expired_tx,
            expired_rx: Mutex::new(Some(expired_rx)),
            metrics,
        }
    }

    /// Called while a `CleanBlocks` command is applied. Hands the expired
    /// blocks over for deletion if this node issued the request, and returns
    /// whether it did.
    pub fn on_clean_applied(
        &self,
        request_id: &str,
        expired: Vec<ExpiredBlock>,
    ) -> bool {
        let issued_here = self.last_request_id.lock().as_deref() == Some(request_id);
        if !issued_here {
            debug!(request_id, expired = expired.len(), "clean-up issued by another node");
            return false;
        }
        if !expired.is_empty() && self.expired_tx.send(expired).is_err() {
            warn!(request_id, "cleaner is not running; expired blocks are not deleted");
        }
        true
    }

    /// Proposes one clean-up round.
    pub async fn propose_cleanup(
        &self,
        proposer: &dyn Proposer,
    ) {
        let request_id = nanoid!();
        *self.last_request_id.lock() = Some(request_id.clone());
        let command = Command::CleanBlocks(CleanBlocksRequest {
            request_id: request_id.clone(),
        });
        match proposer.propose(command).await {
            Ok(_) => debug!(%request_id, "clean-up applied"),
            Err(e) if e.is_not_leader() => debug!("not the leader; skipping clean-up"),
            Err(e) => warn!(%request_id, %e, "failed to propose clean-up"),
        }
    }

    /// Deletes the objects of the given blocks. Missing objects count as
    /// deleted; the first other failure stops the round.
    pub async fn delete_blocks(
        &self,
        bucket: &dyn ObjectBucket,
        blocks: Vec<ExpiredBlock>,
    ) -> std::result::Result<(), BucketError> {
        let metrics = &self.metrics;
        stream::iter(blocks.into_iter().map(Ok))
            .try_for_each_concurrent(self.config.cleanup_max_concurrency, |block| async move {
                let path = block.object_path();
                match bucket.delete(&path).await {
                    Ok(()) => {
                        metrics.blocks_deleted.with_label_values(&["deleted"]).inc();
                        Ok(())
                    }
                    Err(BucketError::NotFound) => {
                        metrics.blocks_deleted.with_label_values(&["not_found"]).inc();
                        Ok(())
                    }
                    Err(e) => {
                        metrics.blocks_deleted.with_label_values(&["failed"]).inc();
                        warn!(%path, %e, "failed to delete block");
                        Err(e)
                    }
                }
            })
            .await
    }

    /// Runs the clean-up loop until `shutdown` is cancelled.
    pub async fn run(
        &self,
        proposer: Arc<dyn Proposer>,
        bucket: Arc<dyn ObjectBucket>,
        shutdown: CancellationToken,
    ) {
        let Some(mut expired_rx) = self.expired_rx.lock().take() else {
            warn!("cleaner is already running");
            return;
        };
        let mut interval = tokio::time::interval(self.config.cleanup_interval());
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(interval_ms = self.config.cleanup_interval_ms, "cleaner started");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("cleaner stopped");
                    break;
                }
                _ = interval.tick() => {
                    self.propose_cleanup(proposer.as_ref()).await;
                }
                Some(blocks) = expired_rx.recv() => {
                    let count = blocks.len();
                    match self.delete_blocks(bucket.as_ref(), blocks).await {
                        Ok(()) => info!(count, "expired blocks deleted"),
                        Err(e) => warn!(%e, "clean-up round aborted"),
                    }
                }
            }
        }
        *self.expired_rx.lock() = Some(expired_rx);
    }
}

//! Linearizable reads from any replica.
//!
//! The reader obtains a read index from the leader, waits until the local
//! state machine has applied at least that far, and only then runs the read
//! against local state. The same path serves leader reads (the local node is
//! the [`Leader`]) and follower reads (a remote leader is).

use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;

use redb::ReadTransaction;
use tokio::time::interval_at;
use tokio::time::MissedTickBehavior;
use tracing::debug;

use super::Leader;
use super::ReadIndex;
use crate::fsm::Fsm;
use crate::ConsistentReadError;
use crate::Error;
use crate::Metrics;
use crate::RaftConfig;
use crate::Result;

fn compare_index(
    cur: u64,
    dst: u64,
    max_distance: u64,
) -> std::result::Result<bool, ConsistentReadError> {
    if max_distance > 0 && dst.saturating_sub(cur) > max_distance {
        return Err(ConsistentReadError::LagBehind {
            applied: cur,
            required: dst,
        });
    }
    Ok(cur >= dst)
}

/// Resolves once `src() >= dst`, polling every `interval`.
///
/// Fails with `LagBehind` as soon as `dst` is more than `max_distance` ahead
/// of `src()`. A `max_distance` of zero disables the check.
pub async fn wait_index_reached<F>(
    src: F,
    dst: u64,
    interval: Duration,
    max_distance: u64,
) -> std::result::Result<(), ConsistentReadError>
where
    F: Fn() -> u64,
{
    if compare_index(src(), dst, max_distance)? {
        return Ok(());
    }
    let mut ticker = interval_at(tokio::time::Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        if compare_index(src(), dst, max_distance)? {
            return Ok(());
        }
    }
}

pub struct StateReader {
    leader: Arc<dyn Leader>,
    fsm: Arc<Fsm>,
    check_interval: Duration,
    max_distance: u64,
    timeout: Duration,
    metrics: Arc<Metrics>,
}

impl std::fmt::Debug for StateReader {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("StateReader")
            .field("check_interval", &self.check_interval)
            .field("max_distance", &self.max_distance)
            .finish()
    }
}

impl StateReader {
    pub fn new(
        leader: Arc<dyn Leader>,
        fsm: Arc<Fsm>,
        config: &RaftConfig,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            leader,
            fsm,
            check_interval: config.log_index_check_interval(),
            max_distance: config.read_index_max_distance,
            timeout: config.apply_timeout(),
            metrics,
        }
    }

    /// Blocks until the local applied index reaches the leader's commit index.
    pub async fn wait_leader_commit_index_applied(&self) -> Result<ReadIndex> {
        let read_index = self
            .leader
            .read_index()
            .await
            .map_err(|e| ConsistentReadError::Leader(Box::new(e)))?;
        let fsm = self.fsm.clone();
        let wait = wait_index_reached(
            move || fsm.applied_index(),
            read_index.commit_index,
            self.check_interval,
            self.max_distance,
        );
        match tokio::time::timeout(self.timeout, wait).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(ConsistentReadError::Timeout {
                    required: read_index.commit_index,
                }
                .into())
            }
        }
        Ok(read_index)
    }

    /// Runs `read` against local state that reflects every write committed
    /// before the call.
    ///
    /// Failures to reach that state are reported as
    /// [`Error::ConsistentRead`] and never reach `read`; they can be retried
    /// on another replica. Errors returned by `read` are passed through.
    pub async fn consistent_read<F, T>(
        &self,
        read: F,
    ) -> Result<T>
    where
        F: FnOnce(&ReadTransaction, ReadIndex) -> Result<T>,
    {
        let started = Instant::now();
        let result = self.try_consistent_read(read).await;
        self.metrics
            .read_index_duration
            .with_label_values(&["reader"])
            .observe(started.elapsed().as_secs_f64());
        if let Err(Error::ConsistentRead(e)) = &result {
            let reason = match e {
                ConsistentReadError::LagBehind { .. } => "lag_behind",
                ConsistentReadError::Aborted { .. } => "aborted",
                ConsistentReadError::Leader(_) => "leader",
                ConsistentReadError::Timeout { .. } => "timeout",
            };
            debug!(%e, "consistent read failed");
            self.metrics.consistent_read_failures.with_label_values(&[reason]).inc();
        }
        result
    }

    async fn try_consistent_read<F, T>(
        &self,
        read: F,
    ) -> Result<T>
    where
        F: FnOnce(&ReadTransaction, ReadIndex) -> Result<T>,
    {
        let read_index = self.wait_leader_commit_index_applied().await?;
        self.fsm.read(|tx, applied| {
            // A snapshot restore may have replaced the state after the wait.
            if applied < read_index.commit_index {
                return Err(ConsistentReadError::Aborted {
                    expected: read_index.commit_index,
                    actual: applied,
                }
                .into());
            }
            read(tx, read_index)
        })
    }
}

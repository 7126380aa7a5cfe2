//! Compaction scheduling.
//!
//! Blocks are queued per `(tenant, shard, level)` as they are added. The
//! leader periodically turns full queues into jobs and leases jobs to
//! workers ([`planner`]); every decision is proposed as a
//! [`CompactionPlanUpdate`] and applied here, identically on all replicas.

mod block_queue;
mod job_queue;
pub mod planner;

pub use block_queue::*;
pub use job_queue::*;
pub use planner::PreparedPlan;


use std::sync::Arc;

use parking_lot::Mutex;
use prost::Message;
use redb::ReadTransaction;
use redb::ReadableTable;
use redb::WriteTransaction;
use sha2::Digest;
use sha2::Sha256;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::fsm::StateRestorer;
use crate::index::validate_block;
use crate::index::BlockIndex;
use crate::markers::DeletionMarkers;
use crate::proto::AssignedJob;
use crate::proto::BlockMeta;
use crate::proto::CompactionJob;
use crate::proto::CompactionJobStatus;
use crate::proto::CompactionPlanResult;
use crate::proto::CompactionPlanUpdate;
use crate::proto::PollCompactionJobsRequest;
use crate::raft_log::RaftLog;
use crate::storage::keys::JobKey;
use crate::storage::COMPACTION_JOBS;
use crate::storage::PARTITIONS;
use crate::CompactionConfig;
use crate::Metrics;
use crate::Result;
use crate::ValidationError;

/// Job queue and block queues, always changed together.
#[derive(Debug, Clone)]
pub struct CompactionState {
    pub jobs: JobQueue,
    pub blocks: BlockQueues,
}

/// Deterministic job name: the same block list always yields the same name.
/// Each id is length-prefixed so that distinct lists never hash alike.
pub fn job_name(
    level: u32,
    shard: u32,
    blocks: &[String],
) -> String {
    let mut hasher = Sha256::new();
    for block in blocks {
        hasher.update((block.len() as u64).to_be_bytes());
        hasher.update(block.as_bytes());
    }
    let digest = hasher.finalize();
    let hash: String = digest[..8].iter().map(|b| format!("{:02x}", b)).collect();
    format!("L{}-S{}-{}", level, shard, hash)
}

fn job_key(job: &CompactionJob) -> JobKey {
    JobKey {
        shard: job.shard,
        tenant: job.tenant_id.clone(),
        name: job.name.clone(),
    }
}

fn store_job(
    tx: &WriteTransaction,
    job: &CompactionJob,
) -> Result<()> {
    let mut table = tx.open_table(COMPACTION_JOBS)?;
    table.insert(job_key(job).encode().as_slice(), job.encode_to_vec().as_slice())?;
    Ok(())
}

fn delete_job(
    tx: &WriteTransaction,
    job: &CompactionJob,
) -> Result<()> {
    let mut table = tx.open_table(COMPACTION_JOBS)?;
    table.remove(job_key(job).encode().as_slice())?;
    Ok(())
}

pub(crate) fn status_of(job: &CompactionJob) -> CompactionJobStatus {
    CompactionJobStatus::try_from(job.status).unwrap_or(CompactionJobStatus::Unspecified)
}

/// Rejects a plan that would fail half-way through being applied.
pub fn validate_plan(plan: &CompactionPlanUpdate) -> std::result::Result<(), ValidationError> {
    for done in &plan.completed {
        for block in &done.compacted_blocks {
            validate_block(block)?;
        }
    }
    for job in &plan.new_jobs {
        if job.name.is_empty() || job.blocks.is_empty() {
            return Err(ValidationError::InvalidBlock(format!(
                "compaction job {:?} has no name or no blocks",
                job.name
            )));
        }
    }
    Ok(())
}

pub struct Compactor {
    config: CompactionConfig,
    state: Mutex<CompactionState>,
    metrics: Arc<Metrics>,
}

impl std::fmt::Debug for Compactor {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("Compactor").field("jobs", &self.state.lock().jobs.len()).finish()
    }
}

impl Compactor {
    pub fn new(
        config: CompactionConfig,
        metrics: Arc<Metrics>,
    ) -> Self {
        let jobs = JobQueue::new(config.lease_duration().as_nanos() as i64);
        Self {
            config,
            state: Mutex::new(CompactionState {
                jobs,
                blocks: BlockQueues::default(),
            }),
            metrics,
        }
    }

    pub fn config(&self) -> &CompactionConfig {
        &self.config
    }

    /// Copy of the current state, for planning outside the log.
    pub fn state(&self) -> CompactionState {
        self.state.lock().clone()
    }

    /// All jobs sorted by name.
    pub fn jobs(&self) -> Vec<CompactionJob> {
        let state = self.state.lock();
        let mut jobs: Vec<CompactionJob> = state.jobs.jobs().cloned().collect();
        jobs.sort_by(|a, b| a.name.cmp(&b.name));
        jobs
    }

    pub fn block_queues(&self) -> BlockQueues {
        self.state.lock().blocks.clone()
    }

    /// Computes the plan answering a worker's poll. Leader only.
    pub fn prepare(
        &self,
        request: &PollCompactionJobsRequest,
        now: i64,
    ) -> std::result::Result<PreparedPlan, ValidationError> {
        planner::prepare(&self.config, self.state(), request, now)
    }

    /// Queues a freshly indexed block for compaction.
    pub fn add_block(
        &self,
        tx: &WriteTransaction,
        log: &RaftLog,
        block: &BlockMeta,
    ) -> Result<()> {
        let mut state = self.state.lock();
        self.queue_block(&mut state, tx, log, block)
    }

    fn queue_block(
        &self,
        state: &mut CompactionState,
        tx: &WriteTransaction,
        log: &RaftLog,
        block: &BlockMeta,
    ) -> Result<()> {
        if block.compaction_level >= self.config.max_level {
            return Ok(());
        }
        let key = QueueKey {
            level: block.compaction_level,
            tenant: block.tenant_id.clone(),
            shard: block.shard,
        };
        state.blocks.push(key.clone(), block.id.clone(), log.appended_at);
        state.blocks.persist(tx, &key)
    }

    /// Applies a plan computed by the leader.
    ///
    /// Every step re-checks ownership against the current state: the plan
    /// was computed on a copy that may be stale by the time it is applied.
    pub fn apply_plan(
        &self,
        tx: &WriteTransaction,
        log: &RaftLog,
        plan: CompactionPlanUpdate,
        index: &BlockIndex,
        markers: &DeletionMarkers,
    ) -> Result<CompactionPlanResult> {
        validate_plan(&plan)?;

        let mut state = self.state.lock();
        let mut result = CompactionPlanResult::default();
        let now = log.appended_at;

        for done in plan.completed {
            if !state.jobs.is_owner(&done.name, done.raft_log_index) {
                debug!(job = %done.name, token = done.raft_log_index, "ignoring completion from a stale owner");
                continue;
            }
            let Some(job) = state.jobs.evict(&done.name, done.raft_log_index) else {
                continue;
            };
            delete_job(tx, &job)?;
            let removed = index.remove(tx, &job.blocks)?;
            markers.mark(tx, &removed, log.appended_at_millis())?;
            for block in &done.compacted_blocks {
                if index.insert(tx, block)? {
                    self.queue_block(&mut state, tx, log, block)?;
                }
            }
            info!(
                job = %job.name,
                sources = job.blocks.len(),
                outputs = done.compacted_blocks.len(),
                "compaction job completed"
            );
            self.metrics.compaction_jobs.with_label_values(&["completed"]).inc();
        }

        for renewed in plan.renewed {
            if !state.jobs.is_owner(&renewed.name, renewed.raft_log_index) {
                debug!(job = %renewed.name, token = renewed.raft_log_index, "ignoring renewal from a stale owner");
                continue;
            }
            if state.jobs.update(&renewed.name, now, renewed.raft_log_index) {
                if let Some(job) = state.jobs.get(&renewed.name) {
                    store_job(tx, job)?;
                }
                self.metrics.compaction_jobs.with_label_values(&["renewed"]).inc();
            } else {
                debug!(job = %renewed.name, token = renewed.raft_log_index, "lease renewal rejected");
            }
        }

        for failed in plan.failed {
            if !state.jobs.is_owner(&failed.name, failed.raft_log_index) {
                debug!(job = %failed.name, token = failed.raft_log_index, "ignoring failure from a stale owner");
                continue;
            }
            let outcome = state.jobs.fail(&failed.name, self.config.max_failures);
            if let Some(job) = state.jobs.get(&failed.name) {
                store_job(tx, job)?;
            }
            match outcome {
                Some(FailureOutcome::Cancelled) => {
                    warn!(job = %failed.name, "compaction job cancelled after repeated failures");
                    self.metrics.compaction_jobs.with_label_values(&["cancelled"]).inc();
                    result.cancelled.push(failed.name);
                }
                Some(FailureOutcome::Requeued) => {
                    self.metrics.compaction_jobs.with_label_values(&["failed"]).inc();
                }
                None => {}
            }
        }

        for evicted in plan.evicted {
            let cancelled = state
                .jobs
                .get(&evicted.name)
                .is_some_and(|j| status_of(j) == CompactionJobStatus::Cancelled);
            if !cancelled {
                continue;
            }
            if let Some(job) = state.jobs.evict(&evicted.name, evicted.raft_log_index) {
                delete_job(tx, &job)?;
                self.metrics.compaction_jobs.with_label_values(&["evicted"]).inc();
            }
        }

        for mut job in plan.new_jobs {
            let key = QueueKey {
                level: job.compaction_level,
                tenant: job.tenant_id.clone(),
                shard: job.shard,
            };
            if !state.blocks.is_ready_batch(&key, &job.blocks, &self.config, now) {
                warn!(job = %job.name, "planned blocks no longer form a batch; dropping job");
                continue;
            }
            state.blocks.take_prefix(&key, &job.blocks);
            state.blocks.persist(tx, &key)?;
            job.status = CompactionJobStatus::Unspecified as i32;
            job.lease_expires_at = 0;
            job.raft_log_index = log.index;
            job.failures = 0;
            if state.jobs.enqueue(job.clone()) {
                store_job(tx, &job)?;
                debug!(job = %job.name, level = job.compaction_level, "compaction job created");
                self.metrics.compaction_jobs.with_label_values(&["created"]).inc();
            }
        }

        if !plan.assigned.is_empty() {
            let mut leased = Vec::with_capacity(plan.assigned.len());
            for name in &plan.assigned {
                if let Some(job) = state.jobs.assign(name, now, log.index) {
                    store_job(tx, &job)?;
                    leased.push(job);
                } else {
                    debug!(job = %name, "job is no longer assignable");
                }
            }
            let table = tx.open_table(PARTITIONS)?;
            for job in leased {
                let blocks = index.get_blocks(&table, &job.blocks)?;
                self.metrics.compaction_jobs.with_label_values(&["assigned"]).inc();
                result.assigned.push(AssignedJob {
                    name: job.name,
                    blocks,
                    shard: job.shard,
                    tenant_id: job.tenant_id,
                    compaction_level: job.compaction_level,
                    raft_log_index: job.raft_log_index,
                    lease_expires_at: job.lease_expires_at,
                });
            }
        }

        self.update_gauges(&state);
        Ok(result)
    }

    fn update_gauges(
        &self,
        state: &CompactionState,
    ) {
        for level in 0..=self.config.max_level {
            self.metrics
                .job_queue_size
                .with_label_values(&[&level.to_string()])
                .set(state.jobs.level_len(level) as i64);
        }
    }
}

impl StateRestorer for Compactor {
    fn name(&self) -> &'static str {
        "compaction"
    }

    fn restore(
        &self,
        tx: &ReadTransaction,
    ) -> Result<()> {
        let mut jobs = JobQueue::new(self.config.lease_duration().as_nanos() as i64);
        let table = tx.open_table(COMPACTION_JOBS)?;
        for item in table.iter()? {
            let (_, v) = item?;
            jobs.enqueue(CompactionJob::decode(v.value())?);
        }
        let blocks = BlockQueues::load(tx)?;
        let state = CompactionState { jobs, blocks };
        self.update_gauges(&state);
        *self.state.lock() = state;
        Ok(())
    }
}

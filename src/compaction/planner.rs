//! Leader-side half of the compaction protocol.
//!
//! [`prepare`] turns a worker's status report into a [`CompactionPlanUpdate`]
//! by simulating the outcome on a copy of the scheduler state. Nothing here
//! touches the replicated state: the plan only takes effect once it has been
//! committed to the log and applied by [`super::Compactor::apply_plan`].

use tracing::debug;

use super::job_name;
use super::status_of;
use super::validate_plan;
use super::CompactionState;
use crate::proto::CompactionJob;
use crate::proto::CompactionJobStatus;
use crate::proto::CompactionPlanUpdate;
use crate::proto::CompletedJob;
use crate::proto::JobRef;
use crate::proto::PollCompactionJobsRequest;
use crate::CompactionConfig;
use crate::ValidationError;

/// Token used while leasing on the copy. The real token is the index of the
/// log entry that carries the plan, unknown until it is appended.
const PLANNING_TOKEN: u64 = 0;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PreparedPlan {
    pub update: CompactionPlanUpdate,
    /// Jobs the reporting worker must abandon right away.
    pub cancelled: Vec<String>,
}

impl PreparedPlan {
    /// True if applying the update would change nothing.
    pub fn is_noop(&self) -> bool {
        let u = &self.update;
        u.completed.is_empty()
            && u.renewed.is_empty()
            && u.failed.is_empty()
            && u.evicted.is_empty()
            && u.new_jobs.is_empty()
            && u.assigned.is_empty()
    }
}

pub fn prepare(
    config: &CompactionConfig,
    mut state: CompactionState,
    request: &PollCompactionJobsRequest,
    now: i64,
) -> Result<PreparedPlan, ValidationError> {
    let mut plan = PreparedPlan::default();
    let mut revoked = 0usize;

    for report in &request.status_updates {
        let token = report.raft_log_index;
        let Some(job) = state.jobs.get(&report.name).cloned() else {
            debug!(job = %report.name, "status report for unknown job");
            plan.cancelled.push(report.name.clone());
            revoked += 1;
            continue;
        };
        if status_of(&job) == CompactionJobStatus::Cancelled {
            if token >= job.raft_log_index {
                plan.update.evicted.push(JobRef {
                    name: job.name.clone(),
                    raft_log_index: token,
                });
                state.jobs.evict(&job.name, token);
            }
            plan.cancelled.push(job.name);
            revoked += 1;
            continue;
        }
        if !state.jobs.is_owner(&report.name, token) {
            debug!(job = %report.name, token, owner = job.raft_log_index, "worker no longer owns job");
            plan.cancelled.push(report.name.clone());
            revoked += 1;
            continue;
        }

        let job_ref = JobRef {
            name: report.name.clone(),
            raft_log_index: token,
        };
        match CompactionJobStatus::try_from(report.status) {
            Ok(CompactionJobStatus::Success) => {
                state.jobs.evict(&report.name, token);
                plan.update.completed.push(CompletedJob {
                    name: job_ref.name,
                    raft_log_index: token,
                    compacted_blocks: report.compacted_blocks.clone(),
                });
            }
            Ok(CompactionJobStatus::InProgress) => {
                state.jobs.update(&report.name, now, token);
                plan.update.renewed.push(job_ref);
            }
            Ok(CompactionJobStatus::Failure) => {
                state.jobs.fail(&report.name, config.max_failures);
                plan.update.failed.push(job_ref);
            }
            _ => {
                debug!(job = %report.name, status = report.status, "ignoring status report");
            }
        }
    }

    let capacity = request.job_capacity as usize + revoked;

    // Existing jobs first, so a stream of new work cannot starve the backlog.
    while plan.update.assigned.len() < capacity {
        let Some(job) = state.jobs.dequeue(now, PLANNING_TOKEN) else {
            break;
        };
        plan.update.assigned.push(job.name);
    }

    loop {
        let ready = state.blocks.ready(config, now);
        if ready.is_empty() {
            break;
        }
        for (key, blocks) in ready {
            state.blocks.take_prefix(&key, &blocks);
            let job = CompactionJob {
                name: job_name(key.level, key.shard, &blocks),
                blocks,
                shard: key.shard,
                tenant_id: key.tenant.clone(),
                compaction_level: key.level,
                ..Default::default()
            };
            if state.jobs.enqueue(job.clone()) {
                plan.update.new_jobs.push(job);
            }
        }
    }

    while plan.update.assigned.len() < capacity {
        let Some(job) = state.jobs.dequeue(now, PLANNING_TOKEN) else {
            break;
        };
        plan.update.assigned.push(job.name);
    }

    validate_plan(&plan.update)?;
    Ok(plan)
}

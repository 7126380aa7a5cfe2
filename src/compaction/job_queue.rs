//! Lease-based priority queue of compaction jobs.
//!
//! One binary heap per compaction level; lower levels are served first.
//! Within a level jobs are ordered by `(status, lease_expires_at, name)`, so
//! jobs that were never leased come before leased ones and the oldest lease
//! surfaces first. Every job remembers its heap slot, which makes renewal
//! and eviction `O(log n)`.
//!
//! Ownership is fenced by `raft_log_index`: a caller presenting a token lower
//! than the one recorded on the job is a stale owner and is rejected.

use std::cmp::Ordering;
use std::collections::HashMap;

use super::status_of;
use crate::proto::CompactionJob;
use crate::proto::CompactionJobStatus;

#[derive(Debug, Clone)]
struct Entry {
    job: CompactionJob,
    slot: usize,
}

/// Outcome of reporting a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureOutcome {
    /// The job was reset and waits to be leased again.
    Requeued,
    /// Too many failures; the job will not be scheduled again.
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct JobQueue {
    lease_duration: i64,
    jobs: HashMap<String, Entry>,
    levels: Vec<Vec<String>>,
}

fn compare(
    a: &CompactionJob,
    b: &CompactionJob,
) -> Ordering {
    status_of(a)
        .cmp(&status_of(b))
        .then(a.lease_expires_at.cmp(&b.lease_expires_at))
        .then_with(|| a.name.cmp(&b.name))
}

impl JobQueue {
    /// `lease_duration` is in nanoseconds, the unit of every timestamp here.
    pub fn new(lease_duration: i64) -> Self {
        Self {
            lease_duration,
            jobs: HashMap::new(),
            levels: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    pub fn level_len(
        &self,
        level: u32,
    ) -> usize {
        self.levels.get(level as usize).map(|h| h.len()).unwrap_or(0)
    }

    pub fn get(
        &self,
        name: &str,
    ) -> Option<&CompactionJob> {
        self.jobs.get(name).map(|e| &e.job)
    }

    /// All jobs, in no particular order.
    pub fn jobs(&self) -> impl Iterator<Item = &CompactionJob> {
        self.jobs.values().map(|e| &e.job)
    }

    /// Adds the job unless a job with the same name exists.
    pub fn enqueue(
        &mut self,
        job: CompactionJob,
    ) -> bool {
        if self.jobs.contains_key(&job.name) {
            return false;
        }
        let level = job.compaction_level as usize;
        if self.levels.len() <= level {
            self.levels.resize_with(level + 1, Vec::new);
        }
        let slot = self.levels[level].len();
        let name = job.name.clone();
        self.levels[level].push(name.clone());
        self.jobs.insert(name, Entry { job, slot });
        self.sift_up(level, slot);
        true
    }

    /// Leases the highest-priority eligible job to the holder of `token`.
    ///
    /// Only the head of each level is considered: a live lease at the head
    /// means nothing in that level is eligible yet, and a cancelled head
    /// means the level holds only cancelled jobs.
    pub fn dequeue(
        &mut self,
        now: i64,
        token: u64,
    ) -> Option<CompactionJob> {
        for level in 0..self.levels.len() {
            let Some(head) = self.levels[level].first() else {
                continue;
            };
            let job = &self.jobs[head].job;
            match status_of(job) {
                CompactionJobStatus::Cancelled => continue,
                CompactionJobStatus::InProgress if job.lease_expires_at >= now => continue,
                _ => {}
            }
            let name = head.clone();
            return self.lease(&name, now, token);
        }
        None
    }

    /// Leases a specific job, provided it is not cancelled and not held under
    /// a live lease.
    pub fn assign(
        &mut self,
        name: &str,
        now: i64,
        token: u64,
    ) -> Option<CompactionJob> {
        let job = &self.jobs.get(name)?.job;
        match status_of(job) {
            CompactionJobStatus::Cancelled => None,
            CompactionJobStatus::InProgress if job.lease_expires_at >= now => None,
            _ => self.lease(name, now, token),
        }
    }

    fn lease(
        &mut self,
        name: &str,
        now: i64,
        token: u64,
    ) -> Option<CompactionJob> {
        let lease_duration = self.lease_duration;
        let entry = self.jobs.get_mut(name)?;
        entry.job.status = CompactionJobStatus::InProgress as i32;
        entry.job.lease_expires_at = now + lease_duration;
        entry.job.raft_log_index = token;
        let (level, slot) = (entry.job.compaction_level as usize, entry.slot);
        let job = entry.job.clone();
        self.fix(level, slot);
        Some(job)
    }

    /// Renews the lease of a job held by `token` or a newer owner.
    pub fn update(
        &mut self,
        name: &str,
        now: i64,
        token: u64,
    ) -> bool {
        match self.jobs.get(name) {
            Some(e)
                if token >= e.job.raft_log_index
                    && status_of(&e.job) != CompactionJobStatus::Cancelled => {}
            _ => return false,
        }
        self.lease(name, now, token).is_some()
    }

    pub fn cancel(
        &mut self,
        name: &str,
    ) -> bool {
        let Some(entry) = self.jobs.get_mut(name) else {
            return false;
        };
        entry.job.status = CompactionJobStatus::Cancelled as i32;
        let (level, slot) = (entry.job.compaction_level as usize, entry.slot);
        self.fix(level, slot);
        true
    }

    /// Removes the job, unless `token` is older than the job's token.
    pub fn evict(
        &mut self,
        name: &str,
        token: u64,
    ) -> Option<CompactionJob> {
        let entry = self.jobs.get(name)?;
        if token < entry.job.raft_log_index {
            return None;
        }
        let (level, slot) = (entry.job.compaction_level as usize, entry.slot);
        let heap = &mut self.levels[level];
        let last = heap.len() - 1;
        heap.swap(slot, last);
        heap.pop();
        if slot < last {
            let moved = self.levels[level][slot].clone();
            if let Some(e) = self.jobs.get_mut(&moved) {
                e.slot = slot;
            }
            self.fix(level, slot);
        }
        self.jobs.remove(name).map(|e| e.job)
    }

    /// True if `token` currently holds the lease of the job.
    pub fn is_owner(
        &self,
        name: &str,
        token: u64,
    ) -> bool {
        self.jobs.get(name).is_some_and(|e| {
            status_of(&e.job) == CompactionJobStatus::InProgress && token >= e.job.raft_log_index
        })
    }

    /// Counts a failed attempt and either cancels the job or puts it back
    /// as never leased.
    pub fn fail(
        &mut self,
        name: &str,
        max_failures: u32,
    ) -> Option<FailureOutcome> {
        let entry = self.jobs.get_mut(name)?;
        entry.job.failures += 1;
        let outcome = if entry.job.failures >= max_failures {
            entry.job.status = CompactionJobStatus::Cancelled as i32;
            FailureOutcome::Cancelled
        } else {
            entry.job.status = CompactionJobStatus::Unspecified as i32;
            entry.job.lease_expires_at = 0;
            entry.job.raft_log_index = 0;
            FailureOutcome::Requeued
        };
        let (level, slot) = (entry.job.compaction_level as usize, entry.slot);
        self.fix(level, slot);
        Some(outcome)
    }

    // ---- heap maintenance ----

    fn less(
        &self,
        level: usize,
        i: usize,
        j: usize,
    ) -> bool {
        let heap = &self.levels[level];
        compare(&self.jobs[&heap[i]].job, &self.jobs[&heap[j]].job) == Ordering::Less
    }

    fn swap(
        &mut self,
        level: usize,
        i: usize,
        j: usize,
    ) {
        self.levels[level].swap(i, j);
        for k in [i, j] {
            let name = &self.levels[level][k];
            if let Some(e) = self.jobs.get_mut(name) {
                e.slot = k;
            }
        }
    }

    fn fix(
        &mut self,
        level: usize,
        slot: usize,
    ) {
        if !self.sift_down(level, slot) {
            self.sift_up(level, slot);
        }
    }

    fn sift_up(
        &mut self,
        level: usize,
        mut i: usize,
    ) {
        while i > 0 {
            let parent = (i - 1) / 2;
            if !self.less(level, i, parent) {
                break;
            }
            self.swap(level, i, parent);
            i = parent;
        }
    }

    /// Returns true if the element moved.
    fn sift_down(
        &mut self,
        level: usize,
        start: usize,
    ) -> bool {
        let n = self.levels[level].len();
        let mut i = start;
        loop {
            let left = 2 * i + 1;
            if left >= n {
                break;
            }
            let mut child = left;
            if left + 1 < n && self.less(level, left + 1, left) {
                child = left + 1;
            }
            if !self.less(level, child, i) {
                break;
            }
            self.swap(level, i, child);
            i = child;
        }
        i > start
    }
}

use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;

use super::ensure_positive;
use super::invalid;
use crate::Result;

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct CompactionConfig {
    /// How long a worker owns a job without reporting progress
    #[serde(default = "default_lease_duration_ms")]
    pub lease_duration_ms: u64,

    /// Failed attempts after which a job is cancelled
    #[serde(default = "default_max_failures")]
    pub max_failures: u32,

    /// Blocks needed to plan a level-0 job
    #[serde(default = "default_level0_threshold")]
    pub level0_threshold: usize,

    /// Blocks needed to plan a job at any level above 0
    #[serde(default = "default_level_threshold")]
    pub level_threshold: usize,

    /// Blocks at this level or above are never compacted again
    #[serde(default = "default_max_level")]
    pub max_level: u32,

    /// A queue left untouched for longer than this is compacted even below
    /// its threshold. 0 disables the flush.
    #[serde(default = "default_max_batch_age_ms")]
    pub max_batch_age_ms: u64,
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            lease_duration_ms: default_lease_duration_ms(),
            max_failures: default_max_failures(),
            level0_threshold: default_level0_threshold(),
            level_threshold: default_level_threshold(),
            max_level: default_max_level(),
            max_batch_age_ms: default_max_batch_age_ms(),
        }
    }
}

impl CompactionConfig {
    pub fn lease_duration(&self) -> Duration {
        Duration::from_millis(self.lease_duration_ms)
    }

    /// Never below 1, even when the config was not validated.
    pub fn threshold(
        &self,
        level: u32,
    ) -> usize {
        let threshold = if level == 0 {
            self.level0_threshold
        } else {
            self.level_threshold
        };
        threshold.max(1)
    }

    /// True if a queue last pushed to at `updated_at` is due for a flush at
    /// `now`. Both are log times in ns.
    pub fn exceeds_max_age(
        &self,
        updated_at: i64,
        now: i64,
    ) -> bool {
        if self.max_batch_age_ms == 0 {
            return false;
        }
        let max_age = Duration::from_millis(self.max_batch_age_ms).as_nanos() as i64;
        now.saturating_sub(updated_at) > max_age
    }

    pub fn validate(&self) -> Result<()> {
        ensure_positive(self.lease_duration_ms, "compaction.lease_duration_ms")?;
        ensure_positive(self.max_failures as u64, "compaction.max_failures")?;
        ensure_positive(self.level0_threshold as u64, "compaction.level0_threshold")?;
        ensure_positive(self.level_threshold as u64, "compaction.level_threshold")?;
        if self.max_level == 0 {
            return Err(invalid("compaction.max_level must allow at least level 0"));
        }
        Ok(())
    }
}

fn default_lease_duration_ms() -> u64 {
    15_000
}
fn default_max_failures() -> u32 {
    3
}
fn default_level0_threshold() -> usize {
    20
}
fn default_level_threshold() -> usize {
    10
}
fn default_max_level() -> u32 {
    3
}
fn default_max_batch_age_ms() -> u64 {
    60_000
}

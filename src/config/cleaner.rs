use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;

use super::ensure_positive;
use crate::Result;

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct CleanerConfig {
    /// Period of the clean-up proposals
    #[serde(default = "default_cleanup_interval_ms")]
    pub cleanup_interval_ms: u64,

    /// Time a compacted block is kept before it is deleted
    #[serde(default = "default_cleanup_delay_ms")]
    pub cleanup_delay_ms: u64,

    /// Concurrent object deletions per clean-up pass
    #[serde(default = "default_cleanup_max_concurrency")]
    pub cleanup_max_concurrency: usize,
}

impl Default for CleanerConfig {
    fn default() -> Self {
        Self {
            cleanup_interval_ms: default_cleanup_interval_ms(),
            cleanup_delay_ms: default_cleanup_delay_ms(),
            cleanup_max_concurrency: default_cleanup_max_concurrency(),
        }
    }
}

impl CleanerConfig {
    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_millis(self.cleanup_interval_ms)
    }

    pub fn validate(&self) -> Result<()> {
        ensure_positive(self.cleanup_interval_ms, "cleaner.cleanup_interval_ms")?;
        ensure_positive(self.cleanup_max_concurrency as u64, "cleaner.cleanup_max_concurrency")
    }
}

fn default_cleanup_interval_ms() -> u64 {
    15_000
}
fn default_cleanup_delay_ms() -> u64 {
    15 * 60 * 1000
}
fn default_cleanup_max_concurrency() -> usize {
    8
}

use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;

use super::ensure_positive;
use super::invalid;
use crate::Result;

/// Tuning of command application and of the read-index protocol
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct RaftConfig {
    /// Upper bound for a proposal to be committed and applied
    #[serde(default = "default_apply_timeout_ms")]
    pub apply_timeout_ms: u64,

    /// How often the applied/commit index is polled while waiting
    #[serde(default = "default_log_index_check_interval_ms")]
    pub log_index_check_interval_ms: u64,

    /// A replica further behind the read index than this fails fast
    /// instead of waiting. Zero disables the check.
    #[serde(default = "default_read_index_max_distance")]
    pub read_index_max_distance: u64,

    /// Time the node keeps serving after it starts reporting not serving
    #[serde(default = "default_shutdown_grace_period_ms")]
    pub shutdown_grace_period_ms: u64,
}

impl Default for RaftConfig {
    fn default() -> Self {
        Self {
            apply_timeout_ms: default_apply_timeout_ms(),
            log_index_check_interval_ms: default_log_index_check_interval_ms(),
            read_index_max_distance: default_read_index_max_distance(),
            shutdown_grace_period_ms: default_shutdown_grace_period_ms(),
        }
    }
}

impl RaftConfig {
    pub fn apply_timeout(&self) -> Duration {
        Duration::from_millis(self.apply_timeout_ms)
    }

    pub fn log_index_check_interval(&self) -> Duration {
        Duration::from_millis(self.log_index_check_interval_ms)
    }

    pub fn shutdown_grace_period(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_period_ms)
    }

    pub fn validate(&self) -> Result<()> {
        ensure_positive(self.apply_timeout_ms, "raft.apply_timeout_ms")?;
        ensure_positive(self.log_index_check_interval_ms, "raft.log_index_check_interval_ms")?;
        if self.log_index_check_interval_ms >= self.apply_timeout_ms {
            return Err(invalid(format!(
                "raft.log_index_check_interval_ms ({}) must be less than raft.apply_timeout_ms ({})",
                self.log_index_check_interval_ms, self.apply_timeout_ms
            )));
        }
        Ok(())
    }
}

fn default_apply_timeout_ms() -> u64 {
    5_000
}
fn default_log_index_check_interval_ms() -> u64 {
    14
}
fn default_read_index_max_distance() -> u64 {
    10 << 10
}
fn default_shutdown_grace_period_ms() -> u64 {
    5_000
}

use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;

use super::ensure_positive;
use crate::Result;

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct IndexConfig {
    /// Width of the time partitions blocks are grouped into
    #[serde(default = "default_partition_duration_secs")]
    pub partition_duration_secs: u64,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            partition_duration_secs: default_partition_duration_secs(),
        }
    }
}

impl IndexConfig {
    pub fn partition_duration(&self) -> Duration {
        Duration::from_secs(self.partition_duration_secs)
    }

    pub fn validate(&self) -> Result<()> {
        ensure_positive(self.partition_duration_secs, "index.partition_duration_secs")
    }
}

fn default_partition_duration_secs() -> u64 {
    6 * 3600
}

use std::sync::Arc;

use crate::proto::BlockMeta;
use crate::proto::Label;
use crate::Metrics;

static LOGGER_INIT: once_cell::sync::Lazy<()> = once_cell::sync::Lazy::new(|| {
    let _ = env_logger::builder().is_test(true).try_init();
});

pub fn enable_logger() {
    *LOGGER_INIT;
    println!("setup logger for unit test.");
}

pub fn test_metrics() -> Arc<Metrics> {
    Arc::new(Metrics::new().expect("metrics"))
}

pub const HOUR_NANOS: i64 = 3_600_000_000_000;

pub fn block(
    id: &str,
    tenant: &str,
    shard: u32,
    level: u32,
) -> BlockMeta {
    BlockMeta {
        id: id.to_string(),
        tenant_id: tenant.to_string(),
        shard,
        compaction_level: level,
        min_time: HOUR_NANOS,
        max_time: 2 * HOUR_NANOS,
        size: 1024,
        labels: vec![Label {
            name: "service_name".to_string(),
            value: "api".to_string(),
        }],
    }
}

pub fn block_at(
    id: &str,
    tenant: &str,
    min_time: i64,
    max_time: i64,
    labels: &[(&str, &str)],
) -> BlockMeta {
    BlockMeta {
        id: id.to_string(),
        tenant_id: tenant.to_string(),
        shard: 1,
        compaction_level: 0,
        min_time,
        max_time,
        size: 1024,
        labels: labels
            .iter()
            .map(|(name, value)| Label {
                name: name.to_string(),
                value: value.to_string(),
            })
            .collect(),
    }
}

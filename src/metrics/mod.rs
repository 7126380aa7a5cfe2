//! Prometheus collectors of the metastore.
//!
//! Collectors are owned by a [`Metrics`] value built once at start-up and
//! handed to every component; the caller decides which registry exposes them.

use prometheus::exponential_buckets;
use prometheus::Encoder;
use prometheus::HistogramOpts;
use prometheus::HistogramVec;
use prometheus::IntCounterVec;
use prometheus::IntGauge;
use prometheus::IntGaugeVec;
use prometheus::Opts;
use prometheus::Registry;
use prometheus::TextEncoder;

#[derive(Clone)]
pub struct Metrics {
    pub applied_index: IntGauge,
    pub apply_duration: HistogramVec,
    pub commands_applied: IntCounterVec,
    pub compaction_jobs: IntCounterVec,
    pub job_queue_size: IntGaugeVec,
    pub deletion_markers: IntGauge,
    pub blocks_deleted: IntCounterVec,
    pub read_index_duration: HistogramVec,
    pub consistent_read_failures: IntCounterVec,
}

impl std::fmt::Debug for Metrics {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("Metrics").finish()
    }
}

impl Metrics {
    pub fn new() -> prometheus::Result<Self> {
        Ok(Self {
            applied_index: IntGauge::new("metastore_fsm_applied_index", "Last applied log index")?,
            apply_duration: HistogramVec::new(
                HistogramOpts::new(
                    "metastore_fsm_apply_duration_seconds",
                    "Time spent applying a command",
                )
                .buckets(exponential_buckets(0.0001, 2.0, 16)?),
                &["command"],
            )?,
            commands_applied: IntCounterVec::new(
                Opts::new("metastore_fsm_commands_total", "Applied commands by outcome"),
                &["command", "outcome"],
            )?,
            compaction_jobs: IntCounterVec::new(
                Opts::new("metastore_compaction_jobs_total", "Compaction job lifecycle events"),
                &["event"],
            )?,
            job_queue_size: IntGaugeVec::new(
                Opts::new("metastore_compaction_job_queue_size", "Jobs queued per level"),
                &["level"],
            )?,
            deletion_markers: IntGauge::new(
                "metastore_deletion_markers",
                "Blocks marked for deletion",
            )?,
            blocks_deleted: IntCounterVec::new(
                Opts::new("metastore_cleaner_blocks_total", "Object deletions by outcome"),
                &["outcome"],
            )?,
            read_index_duration: HistogramVec::new(
                HistogramOpts::new(
                    "metastore_read_index_duration_seconds",
                    "Time to obtain a read index and catch up with it",
                )
                .buckets(exponential_buckets(0.0005, 2.0, 14)?),
                &["role"],
            )?,
            consistent_read_failures: IntCounterVec::new(
                Opts::new("metastore_consistent_read_failures_total", "Failed consistent reads"),
                &["reason"],
            )?,
        })
    }

    pub fn register(
        &self,
        registry: &Registry,
    ) -> prometheus::Result<()> {
        registry.register(Box::new(self.applied_index.clone()))?;
        registry.register(Box::new(self.apply_duration.clone()))?;
        registry.register(Box::new(self.commands_applied.clone()))?;
        registry.register(Box::new(self.compaction_jobs.clone()))?;
        registry.register(Box::new(self.job_queue_size.clone()))?;
        registry.register(Box::new(self.deletion_markers.clone()))?;
        registry.register(Box::new(self.blocks_deleted.clone()))?;
        registry.register(Box::new(self.read_index_duration.clone()))?;
        registry.register(Box::new(self.consistent_read_failures.clone()))?;
        Ok(())
    }
}

/// Renders `registry` in the Prometheus text format.
pub fn encode_metrics(registry: &Registry) -> String {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&registry.gather(), &mut buffer) {
        tracing::warn!("could not encode metrics: {}", e);
    }
    String::from_utf8(buffer).unwrap_or_default()
}

#[cfg(test)]
mod metrics_test;

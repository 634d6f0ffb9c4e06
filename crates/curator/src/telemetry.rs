use opentelemetry::{
    KeyValue, global,
    metrics::{Counter, Histogram},
};
use std::sync::OnceLock;
use std::time::Instant;

pub struct CuratorMetrics {
    pub records_ingested: Counter<u64>,
    pub records_rejected: Counter<u64>,
    pub duplicates_removed: Counter<u64>,
    pub records_downsampled: Counter<u64>,
    pub stage_duration: Histogram<f64>,
}

static METRICS: OnceLock<CuratorMetrics> = OnceLock::new();

/// Instruments are created on first use so they bind to whichever meter
/// provider `main` installed (a no-op one in tests).
pub fn metrics() -> &'static CuratorMetrics {
    METRICS.get_or_init(|| {
        let meter = global::meter("curator");
        CuratorMetrics {
            records_ingested: meter
                .u64_counter("curator_records_ingested_total")
                .with_description("Image records accepted during ingestion")
                .build(),
            records_rejected: meter
                .u64_counter("curator_records_rejected_total")
                .with_description("Image records skipped as invalid during ingestion")
                .build(),
            duplicates_removed: meter
                .u64_counter("curator_duplicates_removed_total")
                .with_description("Records discarded as exact or near duplicates")
                .build(),
            records_downsampled: meter
                .u64_counter("curator_records_downsampled_total")
                .with_description("Records dropped to meet class-distribution targets")
                .build(),
            stage_duration: meter
                .f64_histogram("curator_stage_duration_seconds")
                .with_description("Wall-clock time spent per curation stage")
                .with_unit("s")
                .build(),
        }
    })
}

/// Records the elapsed time of a stage when dropped.
pub struct StageTimer {
    stage: &'static str,
    started: Instant,
}

impl StageTimer {
    pub fn start(stage: &'static str) -> Self {
        Self {
            stage,
            started: Instant::now(),
        }
    }
}

impl Drop for StageTimer {
    fn drop(&mut self) {
        let elapsed = self.started.elapsed().as_secs_f64();
        metrics()
            .stage_duration
            .record(elapsed, &[KeyValue::new("stage", self.stage)]);
        tracing::debug!(stage = self.stage, elapsed_s = elapsed, "Stage finished");
    }
}

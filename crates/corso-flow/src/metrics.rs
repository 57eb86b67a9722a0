//! Observability metrics for the orchestration core.
//!
//! This module provides Prometheus-compatible metrics for monitoring the
//! pipeline. Metrics are designed to support:
//!
//! - **Alerting**: SLO-based alerts on stage latency and failure rates
//! - **Dashboards**: Real-time visibility into pipeline health
//! - **Debugging**: Correlating metrics with traces for root cause analysis
//!
//! ## Metrics Exported
//!
//! | Metric | Type | Labels | Description |
//! |--------|------|--------|-------------|
//! | `corso_flow_transitions_total` | Counter | `from_state`, `to_state` | Course state transitions |
//! | `corso_flow_stage_duration_seconds` | Histogram | `stage`, `outcome` | Stage execution duration |
//! | `corso_flow_jobs_total` | Counter | `queue`, `result` | Outbox jobs by outcome |
//! | `corso_flow_retries_total` | Counter | `stage` | Transient-failure retries |
//! | `corso_flow_repair_attempts_total` | Counter | `layer`, `result` | Repair-layer attempts |
//! | `corso_flow_quality_score` | Histogram | `verdict` | Quality gate overall scores |
//! | `corso_flow_outbox_depth` | Gauge | `queue` | Unprocessed entries per queue |
//! | `corso_flow_idempotency_replays_total` | Counter | - | Requests served from cache |
//!
//! ## Integration
//!
//! Metrics are exposed via the `metrics` crate facade. To export to
//! Prometheus:
//!
//! ```rust,ignore
//! use metrics_exporter_prometheus::PrometheusBuilder;
//!
//! PrometheusBuilder::new()
//!     .with_http_listener(([0, 0, 0, 0], 9090))
//!     .install()
//!     .expect("failed to install Prometheus recorder");
//! ```

use metrics::{counter, gauge, histogram};

/// Metric names as constants for consistency.
pub mod names {
    /// Counter: Total course state transitions.
    pub const TRANSITIONS_TOTAL: &str = "corso_flow_transitions_total";
    /// Histogram: Stage execution duration in seconds.
    pub const STAGE_DURATION_SECONDS: &str = "corso_flow_stage_duration_seconds";
    /// Counter: Outbox jobs by outcome.
    pub const JOBS_TOTAL: &str = "corso_flow_jobs_total";
    /// Counter: Transient-failure retries.
    pub const RETRIES_TOTAL: &str = "corso_flow_retries_total";
    /// Counter: Repair-layer attempts.
    pub const REPAIR_ATTEMPTS_TOTAL: &str = "corso_flow_repair_attempts_total";
    /// Histogram: Quality gate overall scores.
    pub const QUALITY_SCORE: &str = "corso_flow_quality_score";
    /// Gauge: Unprocessed entries per queue.
    pub const OUTBOX_DEPTH: &str = "corso_flow_outbox_depth";
    /// Counter: Requests served from the idempotency cache.
    pub const IDEMPOTENCY_REPLAYS_TOTAL: &str = "corso_flow_idempotency_replays_total";
}

/// Label keys used across metrics.
pub mod labels {
    /// Previous course state (for transitions).
    pub const FROM_STATE: &str = "from_state";
    /// Target course state (for transitions).
    pub const TO_STATE: &str = "to_state";
    /// Pipeline stage.
    pub const STAGE: &str = "stage";
    /// Execution outcome (completed, failed, stale, cancelled).
    pub const OUTCOME: &str = "outcome";
    /// Queue name.
    pub const QUEUE: &str = "queue";
    /// Job result.
    pub const RESULT: &str = "result";
    /// Repair layer name.
    pub const LAYER: &str = "layer";
    /// Quality gate verdict.
    pub const VERDICT: &str = "verdict";
}

/// Handle for recording orchestration metrics.
///
/// Cheap to construct; methods forward to the global metrics recorder.
#[derive(Debug, Clone, Copy, Default)]
pub struct FlowMetrics;

impl FlowMetrics {
    /// Creates a new metrics handle.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Records a course state transition.
    pub fn record_transition(&self, from_state: &str, to_state: &str) {
        counter!(
            names::TRANSITIONS_TOTAL,
            labels::FROM_STATE => from_state.to_string(),
            labels::TO_STATE => to_state.to_string()
        )
        .increment(1);
    }

    /// Records a stage execution duration.
    pub fn observe_stage_duration(&self, stage: &str, outcome: &str, seconds: f64) {
        histogram!(
            names::STAGE_DURATION_SECONDS,
            labels::STAGE => stage.to_string(),
            labels::OUTCOME => outcome.to_string()
        )
        .record(seconds);
    }

    /// Records an outbox job outcome.
    pub fn record_job(&self, queue: &str, result: &str) {
        counter!(
            names::JOBS_TOTAL,
            labels::QUEUE => queue.to_string(),
            labels::RESULT => result.to_string()
        )
        .increment(1);
    }

    /// Records a transient-failure retry.
    pub fn record_retry(&self, stage: &str) {
        counter!(names::RETRIES_TOTAL, labels::STAGE => stage.to_string()).increment(1);
    }

    /// Records one repair-layer attempt.
    pub fn record_repair_attempt(&self, layer: &str, result: &str) {
        counter!(
            names::REPAIR_ATTEMPTS_TOTAL,
            labels::LAYER => layer.to_string(),
            labels::RESULT => result.to_string()
        )
        .increment(1);
    }

    /// Records a quality gate score.
    pub fn observe_quality_score(&self, verdict: &str, score: f64) {
        histogram!(names::QUALITY_SCORE, labels::VERDICT => verdict.to_string()).record(score);
    }

    /// Updates the unprocessed-entry gauge for a queue.
    pub fn set_outbox_depth(&self, queue: &str, depth: usize) {
        #[allow(clippy::cast_precision_loss)]
        gauge!(names::OUTBOX_DEPTH, labels::QUEUE => queue.to_string()).set(depth as f64);
    }

    /// Records an idempotent replay.
    pub fn record_idempotency_replay(&self) {
        counter!(names::IDEMPOTENCY_REPLAYS_TOTAL).increment(1);
    }
}

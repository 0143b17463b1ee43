//! Prometheus metrics exposition
//!
//! Registers and exposes the orchestrator's metrics:
//!
//! - `convert_requests_total` (counter): labels `operation`, `technology`, `outcome`
//! - `convert_request_duration_seconds` (histogram): label `operation`
//! - `convert_fallback_attempts_total` (counter): labels `candidate`, `reason`
//! - `user_quota_rejections_total` (counter)
//!
//! The pool crate additionally emits `credential_rotations_total` and
//! `credential_pool_exhausted_total`.

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

/// Install the Prometheus recorder and return a handle for rendering metrics.
///
/// Configures `convert_request_duration_seconds` with explicit buckets
/// so it renders as a Prometheus histogram (with `_bucket` lines for
/// `histogram_quantile()` queries) rather than the default summary.
/// Bucket boundaries cover 50ms to 300s — cloud document conversion
/// legitimately runs minutes.
pub fn install_recorder() -> PrometheusHandle {
    PrometheusBuilder::new()
        .set_buckets_for_metric(
            metrics_exporter_prometheus::Matcher::Full(
                "convert_request_duration_seconds".to_string(),
            ),
            &[
                0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0,
            ],
        )
        .expect("failed to set histogram buckets")
        .install_recorder()
        .expect("failed to install Prometheus recorder")
}

/// Record a finished conversion request with its outcome.
pub fn record_conversion(operation: &str, technology: &str, outcome: &str) {
    metrics::counter!(
        "convert_requests_total",
        "operation" => operation.to_string(),
        "technology" => technology.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Record a request's wall-clock duration.
pub fn record_duration(operation: &str, duration_secs: f64) {
    metrics::histogram!(
        "convert_request_duration_seconds",
        "operation" => operation.to_string()
    )
    .record(duration_secs);
}

/// Record one failed candidate attempt within a fallback chain.
pub fn record_fallback_attempt(candidate: &str, reason: &str) {
    metrics::counter!(
        "convert_fallback_attempts_total",
        "candidate" => candidate.to_string(),
        "reason" => reason.to_string()
    )
    .increment(1);
}

/// Record a user-level premium quota rejection.
pub fn record_quota_rejection() {
    metrics::counter!("user_quota_rejections_total").increment(1);
}

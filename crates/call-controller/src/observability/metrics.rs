//! Metrics definitions for the call controller.
//!
//! All metrics follow Prometheus naming conventions:
//! - `cc_` prefix for the call controller
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//!
//! # Cardinality
//!
//! Labels are bounded to prevent cardinality explosion:
//! - `operation`: bounded by store method names (~20 values)
//! - `reason`: bounded by end reasons (4 values)
//!
//! No per-channel or per-call labels anywhere.

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::time::Duration;

/// Initialize the Prometheus metrics recorder and return the handle for
/// serving metrics via HTTP.
///
/// Must be called before any metrics are recorded. Configures histogram
/// buckets aligned with the matching SLO (sub-second common-case latency,
/// minutes-long tail while a request waits in the queue):
/// - Match latency: 100ms .. 10min
/// - Sweep duration: 1ms .. 1s
///
/// # Errors
///
/// Returns an error if the recorder fails to install (e.g., already
/// installed in this process).
pub fn init_metrics_recorder() -> Result<PrometheusHandle, String> {
    PrometheusBuilder::new()
        // Match latency: dominated by queue wait, so the buckets stretch
        // far past the sub-second immediate-match case
        .set_buckets_for_metric(
            Matcher::Prefix("cc_match_latency".to_string()),
            &[
                0.100, 0.250, 0.500, 1.000, 2.500, 5.000, 15.000, 60.000, 300.000, 600.000,
            ],
        )
        .map_err(|e| format!("Failed to set match latency buckets: {e}"))?
        // Sweep duration: internal store round-trips only
        .set_buckets_for_metric(
            Matcher::Prefix("cc_sweep".to_string()),
            &[
                0.001, 0.005, 0.010, 0.025, 0.050, 0.100, 0.250, 0.500, 1.000,
            ],
        )
        .map_err(|e| format!("Failed to set sweep duration buckets: {e}"))?
        .install_recorder()
        .map_err(|e| format!("Failed to install Prometheus metrics recorder: {e}"))
}

// ============================================================================
// Queue Metrics
// ============================================================================

/// Set the current queue length.
///
/// Metric: `cc_queue_length`
pub fn set_queue_length(count: u64) {
    // u64 to f64 conversion is safe for realistic queue lengths (< 2^53)
    #[allow(clippy::cast_precision_loss)]
    gauge!("cc_queue_length").set(count as f64);
}

/// Count a successfully enqueued request.
///
/// Metric: `cc_requests_enqueued_total`
pub fn incr_enqueued() {
    counter!("cc_requests_enqueued_total").increment(1);
}

/// Count requests purged by the cleanup task.
///
/// Metric: `cc_requests_expired_total`
pub fn incr_requests_expired(count: u64) {
    counter!("cc_requests_expired_total").increment(count);
}

// ============================================================================
// Matching Metrics
// ============================================================================

/// Count a created match (one per call, not per side).
///
/// Metric: `cc_matches_total`
pub fn incr_matches() {
    counter!("cc_matches_total").increment(1);
}

/// Count a match abandoned because another process claimed one side.
///
/// Metric: `cc_matches_abandoned_total`
pub fn incr_matches_abandoned() {
    counter!("cc_matches_abandoned_total").increment(1);
}

/// Record how long a matched request waited in the queue.
///
/// Metric: `cc_match_latency_seconds`
pub fn record_match_latency(wait: Duration) {
    histogram!("cc_match_latency_seconds").record(wait.as_secs_f64());
}

/// Record one background sweep pass.
///
/// Metric: `cc_sweep_duration_seconds`
pub fn record_sweep_duration(elapsed: Duration) {
    histogram!("cc_sweep_duration_seconds").record(elapsed.as_secs_f64());
}

// ============================================================================
// Call State Metrics
// ============================================================================

/// Set the number of active calls.
///
/// Metric: `cc_calls_active`
pub fn set_active_calls(count: u64) {
    #[allow(clippy::cast_precision_loss)]
    gauge!("cc_calls_active").set(count as f64);
}

/// Count an ended call by reason.
///
/// Metric: `cc_calls_ended_total`
/// Labels: `reason` (hangup, skip, drained, timeout)
pub fn incr_calls_ended(reason: &str) {
    counter!("cc_calls_ended_total", "reason" => reason.to_string()).increment(1);
}

// ============================================================================
// Coordinator Metrics
// ============================================================================

/// Set whether this process currently holds the leader lease.
///
/// Metric: `cc_leader`
pub fn set_leader(is_leader: bool) {
    gauge!("cc_leader").set(if is_leader { 1.0 } else { 0.0 });
}

// ============================================================================
// Store Metrics
// ============================================================================

/// Count a failed shared-store operation.
///
/// Metric: `cc_store_errors_total`
/// Labels: `operation` (bounded by store method names)
pub fn incr_store_error(operation: &str) {
    counter!("cc_store_errors_total", "operation" => operation.to_string()).increment(1);
}

//! Metrics for observability.
//!
//! Exports Prometheus-compatible metrics for:
//! - Sync outcomes and latency
//! - Remote store calls and retries
//! - Lease contention and expiry
//! - Index rebuilds and snapshot flushes
//!
//! # Metric Naming Convention
//!
//! All metrics are prefixed with `sheetsync_` and follow Prometheus
//! conventions: counters end in `_total`, gauges represent current state,
//! histograms track distributions (durations, sizes).

use metrics::{counter, gauge, histogram};
use std::time::Duration;

/// Record the outcome of a sync call (`created`, `updated`, `unchanged`,
/// `failed`).
pub fn record_sync_outcome(outcome: &str) {
    counter!("sheetsync_sync_total", "outcome" => outcome.to_string()).increment(1);
}

/// Record end-to-end sync latency.
pub fn record_sync_latency(duration: Duration) {
    histogram!("sheetsync_sync_duration_seconds").record(duration.as_secs_f64());
}

/// Record a remote store call.
pub fn record_remote_call(operation: &str, success: bool, duration: Duration) {
    let status = if success { "success" } else { "failure" };
    counter!("sheetsync_remote_calls_total", "operation" => operation.to_string(), "status" => status)
        .increment(1);
    histogram!("sheetsync_remote_call_duration_seconds", "operation" => operation.to_string())
        .record(duration.as_secs_f64());
}

/// Record a retry of a remote operation.
pub fn record_retry(operation: &str) {
    counter!("sheetsync_retries_total", "operation" => operation.to_string()).increment(1);
}

/// Record a retry budget exhaustion.
pub fn record_retries_exhausted(operation: &str) {
    counter!("sheetsync_retries_exhausted_total", "operation" => operation.to_string()).increment(1);
}

/// Record time spent waiting for a lease.
pub fn record_lease_wait(duration: Duration) {
    histogram!("sheetsync_lease_wait_duration_seconds").record(duration.as_secs_f64());
}

/// Record a lease acquisition timing out.
pub fn record_lease_contended(key: &str) {
    counter!("sheetsync_lease_contended_total", "key" => key.to_string()).increment(1);
}

/// Record an abandoned lease being reclaimed after expiry.
pub fn record_lease_expired(key: &str) {
    counter!("sheetsync_lease_expired_total", "key" => key.to_string()).increment(1);
}

/// Record a stale index entry healed at the write point.
pub fn record_index_conflict(uid: &str) {
    counter!("sheetsync_index_conflicts_total", "uid" => uid.to_string()).increment(1);
}

/// Record a full index rebuild.
pub fn record_index_rebuild(rows: usize, duration: Duration) {
    counter!("sheetsync_index_rebuilds_total").increment(1);
    gauge!("sheetsync_index_rows").set(rows as f64);
    histogram!("sheetsync_index_rebuild_duration_seconds").record(duration.as_secs_f64());
}

/// Record a snapshot flush batch (debounced writes).
pub fn record_snapshot_flush(flushed: usize, errors: usize) {
    counter!("sheetsync_snapshot_flushes_total").increment(1);
    counter!("sheetsync_snapshot_flushed_count").increment(flushed as u64);
    if errors > 0 {
        counter!("sheetsync_snapshot_flush_errors_total").increment(errors as u64);
    }
}

/// Record a snapshot SQLite retry (for SQLITE_BUSY/SQLITE_LOCKED).
pub fn record_snapshot_retry(operation: &str) {
    counter!("sheetsync_snapshot_retries_total", "operation" => operation.to_string()).increment(1);
}

/// Set the current engine state gauge.
pub fn set_engine_state(state: &str) {
    gauge!("sheetsync_engine_state", "state" => state.to_string()).set(1.0);
}

#[cfg(test)]
mod tests {
    use super::*;

    // The metrics facade is a no-op without an installed recorder; these
    // tests just verify the helpers don't panic.

    #[test]
    fn test_metrics_helpers_do_not_panic() {
        record_sync_outcome("created");
        record_sync_latency(Duration::from_millis(12));
        record_remote_call("append_row", true, Duration::from_millis(80));
        record_remote_call("read_all", false, Duration::from_secs(1));
        record_retry("update_row");
        record_retries_exhausted("update_row");
        record_lease_wait(Duration::from_millis(3));
        record_lease_contended("INV-001");
        record_lease_expired("INV-001");
        record_index_conflict("INV-001");
        record_index_rebuild(42, Duration::from_millis(150));
        record_snapshot_flush(5, 0);
        record_snapshot_flush(0, 2);
        record_snapshot_retry("flush");
        set_engine_state("Running");
    }
}

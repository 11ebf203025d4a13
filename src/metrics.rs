// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Metrics instrumentation for the balance reconciler.
//!
//! Uses the `metrics` crate for backend-agnostic metrics collection.
//! The embedding process is responsible for choosing the exporter
//! (Prometheus, OTEL, etc.)
//!
//! # Metric Naming Convention
//! - `balance_sync_` prefix for all metrics
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//!
//! # Labels
//! - `store`: cache, sql
//! - `operation`: scan, fetch, upsert, ping, status
//! - `trigger`: scheduled, forced, manual
//! - `status`: success, partial, failed

use metrics::{counter, gauge, histogram};
use std::time::{Duration, Instant};

/// Record a completed run with its trigger and terminal status
pub fn record_run(trigger: &str, status: &str) {
    counter!(
        "balance_sync_runs_total",
        "trigger" => trigger.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}

/// Record end-to-end run duration
pub fn record_run_duration(duration: Duration) {
    histogram!("balance_sync_run_seconds").record(duration.as_secs_f64());
}

/// Record per-run record counts by outcome (processed, updated, error)
pub fn record_records(outcome: &str, count: u64) {
    counter!(
        "balance_sync_records_total",
        "outcome" => outcome.to_string()
    )
    .increment(count);
}

/// Record how many balance keys a scan found
pub fn record_scan_keys(count: usize) {
    histogram!("balance_sync_scan_keys").record(count as f64);
}

/// Set whether a run is currently executing (1 = in flight, 0 = idle)
pub fn set_run_in_flight(in_flight: bool) {
    gauge!("balance_sync_run_in_flight").set(if in_flight { 1.0 } else { 0.0 });
}

/// Set the completion time of the most recent non-dry run (unix seconds)
pub fn set_last_run_timestamp(epoch_secs: i64) {
    gauge!("balance_sync_last_run_timestamp_seconds").set(epoch_secs as f64);
}

// ═══════════════════════════════════════════════════════════════════════════
// STORE OPERATIONS - Per-backend calls and latency
// ═══════════════════════════════════════════════════════════════════════════

/// Record a store operation outcome
pub fn record_store_operation(store: &str, operation: &str, status: &str) {
    counter!(
        "balance_sync_store_operations_total",
        "store" => store.to_string(),
        "operation" => operation.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}

/// Record store operation latency
pub fn record_store_latency(store: &str, operation: &str, duration: Duration) {
    histogram!(
        "balance_sync_store_seconds",
        "store" => store.to_string(),
        "operation" => operation.to_string()
    )
    .record(duration.as_secs_f64());
}

/// Record an upsert batch size
pub fn record_upsert_batch(count: usize) {
    histogram!("balance_sync_upsert_batch_size").record(count as f64);
}

/// Record a timed-out store operation
pub fn record_timeout(store: &str, operation: &str) {
    counter!(
        "balance_sync_timeouts_total",
        "store" => store.to_string(),
        "operation" => operation.to_string()
    )
    .increment(1);
}

// ═══════════════════════════════════════════════════════════════════════════
// FAILURES - Categorized for alerting
// ═══════════════════════════════════════════════════════════════════════════

/// Record a run that failed outright, by failure kind
pub fn record_run_failure(kind: &str) {
    counter!(
        "balance_sync_run_failures_total",
        "kind" => kind.to_string()
    )
    .increment(1);
}

/// Record a best-effort diagnostic status write-back
pub fn record_status_write(success: bool) {
    let status = if success { "success" } else { "failure" };
    counter!(
        "balance_sync_status_writes_total",
        "status" => status
    )
    .increment(1);
}

// ═══════════════════════════════════════════════════════════════════════════
// SCHEDULER - Triggers, skips, retries
// ═══════════════════════════════════════════════════════════════════════════

/// Record a schedule rule firing
pub fn record_trigger_fired(rule: &str) {
    counter!(
        "balance_sync_triggers_total",
        "rule" => rule.to_string()
    )
    .increment(1);
}

/// Record a trigger that did not start a run (busy, cooldown)
pub fn record_trigger_skipped(reason: &str) {
    counter!(
        "balance_sync_trigger_skips_total",
        "reason" => reason.to_string()
    )
    .increment(1);
}

/// Record a retry attempt being scheduled after a failed run
pub fn record_retry_scheduled(attempt: u32) {
    counter!(
        "balance_sync_retries_total",
        "attempt" => attempt.to_string()
    )
    .increment(1);
}

/// Record scheduler state transitions
pub fn set_scheduler_state(state: &str) {
    counter!(
        "balance_sync_scheduler_transitions_total",
        "state" => state.to_string()
    )
    .increment(1);
}

// ═══════════════════════════════════════════════════════════════════════════
// STORE HEALTH - Probe results
// ═══════════════════════════════════════════════════════════════════════════

/// Set store health status (1 = reachable, 0 = unreachable)
pub fn set_store_healthy(store: &str, healthy: bool) {
    gauge!(
        "balance_sync_store_healthy",
        "store" => store.to_string()
    )
    .set(if healthy { 1.0 } else { 0.0 });
}

/// A timing guard that records store latency on drop
pub struct LatencyTimer {
    store: &'static str,
    operation: &'static str,
    start: Instant,
}

impl LatencyTimer {
    /// Start a new latency timer
    pub fn new(store: &'static str, operation: &'static str) -> Self {
        Self {
            store,
            operation,
            start: Instant::now(),
        }
    }
}

impl Drop for LatencyTimer {
    fn drop(&mut self) {
        record_store_latency(self.store, self.operation, self.start.elapsed());
    }
}

/// Convenience macro for timing store operations
#[macro_export]
macro_rules! time_store_operation {
    ($store:expr, $op:expr) => {
        $crate::metrics::LatencyTimer::new($store, $op)
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    // Note: These tests verify the API compiles and doesn't panic.
    // In production, you'd use a real Recorder for assertions.

    #[test]
    fn test_record_run() {
        record_run("scheduled", "success");
        record_run("forced", "partial");
        record_run("manual", "failed");
    }

    #[test]
    fn test_record_run_counts() {
        record_records("processed", 100);
        record_records("updated", 12);
        record_records("error", 1);
        record_scan_keys(100);
    }

    #[test]
    fn test_store_operation_metrics() {
        record_store_operation("cache", "scan", "success");
        record_store_operation("sql", "upsert", "error");
        record_store_latency("cache", "fetch", Duration::from_micros(500));
        record_store_latency("sql", "upsert", Duration::from_millis(20));
        record_upsert_batch(500);
        record_timeout("sql", "upsert");
    }

    #[test]
    fn test_gauges() {
        set_run_in_flight(true);
        set_run_in_flight(false);
        set_last_run_timestamp(1_700_000_000);
        set_store_healthy("cache", true);
        set_store_healthy("sql", false);
    }

    #[test]
    fn test_scheduler_metrics() {
        record_trigger_fired("hourly");
        record_trigger_fired("daily");
        record_trigger_skipped("busy");
        record_trigger_skipped("cooldown");
        record_retry_scheduled(1);
        record_retry_scheduled(2);
        set_scheduler_state("running");
    }

    #[test]
    fn test_failure_metrics() {
        record_run_failure("cache_unavailable");
        record_run_failure("store_unavailable");
        record_status_write(true);
        record_status_write(false);
    }

    #[test]
    fn test_latency_timer() {
        {
            let _timer = LatencyTimer::new("cache", "scan");
            // Simulate some work
            std::thread::sleep(Duration::from_micros(10));
        }
        // Timer recorded on drop
    }
}

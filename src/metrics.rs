// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Metrics instrumentation for the dataset sync engine.
//!
//! Uses the `metrics` crate for backend-agnostic metrics collection.
//! The embedding process is responsible for choosing the exporter.
//!
//! # Metric Naming Convention
//! - `dataset_sync_` prefix for all metrics
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//! - `_bytes` suffix for size histograms
//!
//! # Labels
//! - `queue`: queue name (`default` for the unnamed queue)
//! - `outcome`: finished, requeued, failed
//! - `action`: copy, update, delete
//! - `operation`: compare, persist, flush, rehash, compute

use metrics::{counter, gauge, histogram};
use std::time::{Duration, Instant};

fn queue_label(queue: &str) -> String {
    if queue.is_empty() {
        "default".to_string()
    } else {
        queue.to_string()
    }
}

pub fn record_job_enqueued(queue: &str) {
    counter!("dataset_sync_jobs_enqueued_total", "queue" => queue_label(queue)).increment(1);
}

pub fn record_job_requeued(queue: &str) {
    counter!("dataset_sync_jobs_requeued_total", "queue" => queue_label(queue)).increment(1);
}

/// Payload could not be decoded and was dropped
pub fn record_malformed_job(queue: &str) {
    counter!("dataset_sync_jobs_malformed_total", "queue" => queue_label(queue)).increment(1);
}

pub fn record_lock_contention() {
    counter!("dataset_sync_lock_contention_total").increment(1);
}

pub fn record_job_started(plugin: &str) {
    counter!("dataset_sync_jobs_started_total", "plugin" => plugin.to_string()).increment(1);
}

pub fn record_job_outcome(outcome: &str) {
    counter!("dataset_sync_jobs_total", "outcome" => outcome.to_string()).increment(1);
}

/// A job attempt failed with an error of `kind` (see `SyncError::kind`)
pub fn record_job_error(kind: &str) {
    counter!("dataset_sync_job_errors_total", "kind" => kind.to_string()).increment(1);
}

pub fn record_file_persisted(action: &str) {
    counter!("dataset_sync_files_persisted_total", "action" => action.to_string()).increment(1);
}

pub fn record_bytes_written(bytes: u64) {
    histogram!("dataset_sync_file_bytes").record(bytes as f64);
}

pub fn record_hash_mismatch(hash_type: &str, fatal: bool) {
    counter!(
        "dataset_sync_hash_mismatch_total",
        "hash_type" => hash_type.to_string(),
        "fatal" => fatal.to_string()
    )
    .increment(1);
}

pub fn record_finalize(replace: bool, status: &str, count: usize) {
    let kind = if replace { "replace" } else { "add" };
    counter!(
        "dataset_sync_finalize_total",
        "kind" => kind,
        "status" => status.to_string()
    )
    .increment(1);
    histogram!("dataset_sync_finalize_batch_size", "kind" => kind).record(count as f64);
}

/// Nodes returned to the job after a failed finalize
pub fn record_rollback(count: usize) {
    counter!("dataset_sync_rollback_nodes_total").increment(count as u64);
}

pub fn record_known_hash_invalidation() {
    counter!("dataset_sync_known_hash_invalidations_total").increment(1);
}

pub fn record_rehash(status: &str) {
    counter!("dataset_sync_rehash_total", "status" => status.to_string()).increment(1);
}

pub fn set_active_workers(count: usize) {
    gauge!("dataset_sync_active_workers").set(count as f64);
}

/// Record operation latency
pub fn record_latency(operation: &str, duration: Duration) {
    histogram!(
        "dataset_sync_operation_seconds",
        "operation" => operation.to_string()
    )
    .record(duration.as_secs_f64());
}

/// Records latency of an operation when dropped.
pub struct LatencyTimer {
    operation: &'static str,
    start: Instant,
}

impl LatencyTimer {
    /// Start a new latency timer
    pub fn new(operation: &'static str) -> Self {
        Self {
            operation,
            start: Instant::now(),
        }
    }
}

impl Drop for LatencyTimer {
    fn drop(&mut self) {
        record_latency(self.operation, self.start.elapsed());
    }
}

/// Convenience macro for timing operations
#[macro_export]
macro_rules! time_operation {
    ($op:expr) => {
        $crate::metrics::LatencyTimer::new($op)
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    // These only verify the calls don't panic without an installed recorder.

    #[test]
    fn test_record_job_metrics() {
        record_job_enqueued("");
        record_job_requeued("gpu");
        record_malformed_job("");
        record_job_started("local");
        record_job_outcome("finished");
        record_job_error("transient");
        record_lock_contention();
    }

    #[test]
    fn test_record_persist_metrics() {
        record_file_persisted("copy");
        record_bytes_written(1024);
        record_hash_mismatch("quickXorHash", false);
        record_finalize(true, "error", 12);
        record_rollback(3);
        record_known_hash_invalidation();
        record_rehash("ok");
        set_active_workers(4);
    }

    #[test]
    fn test_latency_timer() {
        {
            let _timer = LatencyTimer::new("persist");
            std::thread::sleep(Duration::from_millis(1));
        }
        let _t = time_operation!("flush");
    }

    #[test]
    fn test_queue_label() {
        assert_eq!(queue_label(""), "default");
        assert_eq!(queue_label("gpu"), "gpu");
    }
}

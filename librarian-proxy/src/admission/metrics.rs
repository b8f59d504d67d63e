//! Counters for the admission controller.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Cumulative admission counters
#[derive(Debug, Default)]
pub struct AdmissionMetrics {
    /// Total requests enqueued
    pub requests_received: AtomicU64,

    /// Requests that obtained a slot
    pub requests_admitted: AtomicU64,

    /// Admitted requests whose work returned Ok
    pub requests_completed: AtomicU64,

    /// Admitted requests whose work returned Err or was cancelled
    pub requests_failed: AtomicU64,

    /// Requests that gave up waiting for a slot
    pub requests_timed_out: AtomicU64,

    /// Total wait between enqueue and admission, in milliseconds
    pub total_queue_wait_ms: AtomicU64,

    /// Total time spent holding a slot, in milliseconds
    pub total_processing_ms: AtomicU64,

    /// Deepest pending queue observed
    pub max_queue_depth: AtomicU64,

    /// Replica intents recorded
    pub replica_intents: AtomicU64,
}

impl AdmissionMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_received(&self, queue_depth: usize) {
        self.requests_received.fetch_add(1, Ordering::Relaxed);
        self.max_queue_depth.fetch_max(queue_depth as u64, Ordering::Relaxed);
    }

    pub fn record_admitted(&self, wait_time: Duration) {
        self.requests_admitted.fetch_add(1, Ordering::Relaxed);
        self.total_queue_wait_ms
            .fetch_add(wait_time.as_millis() as u64, Ordering::Relaxed);
    }

    pub fn record_finished(&self, succeeded: bool, processing_time: Duration) {
        if succeeded {
            self.requests_completed.fetch_add(1, Ordering::Relaxed);
        } else {
            self.requests_failed.fetch_add(1, Ordering::Relaxed);
        }
        self.total_processing_ms
            .fetch_add(processing_time.as_millis() as u64, Ordering::Relaxed);
    }

    pub fn record_timeout(&self) {
        self.requests_timed_out.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_replica_intent(&self) {
        self.replica_intents.fetch_add(1, Ordering::Relaxed);
    }

    /// Average wait for admission in milliseconds
    pub fn avg_queue_wait_ms(&self) -> f64 {
        let admitted = self.requests_admitted.load(Ordering::Relaxed);
        if admitted == 0 {
            return 0.0;
        }
        self.total_queue_wait_ms.load(Ordering::Relaxed) as f64 / admitted as f64
    }

    /// Average slot hold time in milliseconds
    pub fn avg_processing_ms(&self) -> f64 {
        let finished = self.requests_completed.load(Ordering::Relaxed)
            + self.requests_failed.load(Ordering::Relaxed);
        if finished == 0 {
            return 0.0;
        }
        self.total_processing_ms.load(Ordering::Relaxed) as f64 / finished as f64
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            requests_received: self.requests_received.load(Ordering::Relaxed),
            requests_admitted: self.requests_admitted.load(Ordering::Relaxed),
            requests_completed: self.requests_completed.load(Ordering::Relaxed),
            requests_failed: self.requests_failed.load(Ordering::Relaxed),
            requests_timed_out: self.requests_timed_out.load(Ordering::Relaxed),
            max_queue_depth: self.max_queue_depth.load(Ordering::Relaxed),
            replica_intents: self.replica_intents.load(Ordering::Relaxed),
            avg_queue_wait_ms: self.avg_queue_wait_ms(),
            avg_processing_ms: self.avg_processing_ms(),
        }
    }
}

/// Snapshot of metrics at a point in time
#[derive(Debug, Clone, serde::Serialize)]
pub struct MetricsSnapshot {
    pub requests_received: u64,
    pub requests_admitted: u64,
    pub requests_completed: u64,
    pub requests_failed: u64,
    pub requests_timed_out: u64,
    pub max_queue_depth: u64,
    pub replica_intents: u64,
    pub avg_queue_wait_ms: f64,
    pub avg_processing_ms: f64,
}

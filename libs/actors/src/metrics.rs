//! Bus Metrics
//!
//! Lock-free counters updated on the hot path and a serializable snapshot
//! for diagnostics.

use crate::balancer::BalancerSnapshot;
use crate::worker::WorkerStats;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Bus-wide counters
#[derive(Debug, Default)]
pub struct BusMetrics {
    /// Messages accepted by the dispatcher (before admission control)
    pub submitted: AtomicU64,
    /// Submissions dropped as in-flight duplicates
    pub deduplicated: AtomicU64,
    /// Messages a worker handed to the registry
    pub delivered: AtomicU64,
    pub handler_failures: AtomicU64,
    /// Deliveries that found no registered handler
    pub unhandled: AtomicU64,
    /// Queued messages discarded at shutdown
    pub abandoned: AtomicU64,
    pub total_handling_time_ns: AtomicU64,
}

impl BusMetrics {
    pub fn record_submitted(&self) {
        self.submitted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_deduplicated(&self) {
        self.deduplicated.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_abandoned(&self, count: u64) {
        self.abandoned.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_delivery(&self, duration: Duration, failures: usize, unhandled: bool) {
        self.delivered.fetch_add(1, Ordering::Relaxed);
        self.total_handling_time_ns
            .fetch_add(duration.as_nanos() as u64, Ordering::Relaxed);
        if failures > 0 {
            self.handler_failures
                .fetch_add(failures as u64, Ordering::Relaxed);
        }
        if unhandled {
            self.unhandled.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn avg_handling_time_ns(&self) -> f64 {
        let count = self.delivered.load(Ordering::Relaxed);
        if count == 0 {
            return 0.0;
        }
        self.total_handling_time_ns.load(Ordering::Relaxed) as f64 / count as f64
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            submitted: self.submitted.load(Ordering::Relaxed),
            deduplicated: self.deduplicated.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            handler_failures: self.handler_failures.load(Ordering::Relaxed),
            unhandled: self.unhandled.load(Ordering::Relaxed),
            abandoned: self.abandoned.load(Ordering::Relaxed),
            avg_handling_time_ns: self.avg_handling_time_ns(),
        }
    }
}

/// Point-in-time copy of [`BusMetrics`]
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub submitted: u64,
    pub deduplicated: u64,
    pub delivered: u64,
    pub handler_failures: u64,
    pub unhandled: u64,
    pub abandoned: u64,
    pub avg_handling_time_ns: f64,
}

/// Everything [`crate::Dispatcher::stats`] reports
#[derive(Debug, Clone, Serialize)]
pub struct BusStats {
    pub metrics: MetricsSnapshot,
    pub balancer: BalancerSnapshot,
    pub workers: Vec<WorkerStats>,
    pub dead_letters: usize,
    pub dead_letters_recorded: u64,
}

impl BusStats {
    /// Messages currently queued across all workers
    pub fn queued(&self) -> usize {
        self.workers.iter().map(|w| w.queue_len).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delivery_accounting() {
        let metrics = BusMetrics::default();
        metrics.record_submitted();
        metrics.record_submitted();
        metrics.record_deduplicated();
        metrics.record_delivery(Duration::from_nanos(300), 1, false);
        metrics.record_delivery(Duration::from_nanos(100), 0, true);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.submitted, 2);
        assert_eq!(snapshot.deduplicated, 1);
        assert_eq!(snapshot.delivered, 2);
        assert_eq!(snapshot.handler_failures, 1);
        assert_eq!(snapshot.unhandled, 1);
        assert_eq!(snapshot.avg_handling_time_ns, 200.0);
    }

    #[test]
    fn test_snapshot_serializes() {
        let json = serde_json::to_string(&BusMetrics::default().snapshot()).unwrap();
        assert!(json.contains("\"handler_failures\":0"));
    }
}

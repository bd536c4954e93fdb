//! Ambient observability counters, scoped down from the teacher's
//! `PerformanceMonitor`. No exporter: a snapshot struct plus counters
//! a caller can log or serve from its own endpoint. The teacher's
//! WebRTC/document-size/connection-timing fields are dropped — this
//! spec has no WebRTC surface and a stateless server has no document
//! size to sample (see DESIGN.md).

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use parking_lot::RwLock;
use serde::Serialize;

/// Elapsed-time helper, same shape as the teacher's `LatencyTracker`.
pub struct LatencyTracker {
    start: Instant,
}

impl LatencyTracker {
    pub fn new() -> Self {
        Self { start: Instant::now() }
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }
}

impl Default for LatencyTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub total_operations: u64,
    pub avg_operation_latency_ms: f64,
    pub conflicts_resolved: u64,
    pub total_connections: u64,
    pub active_connections: u64,
}

const MAX_LATENCY_SAMPLES: usize = 512;

/// Process-wide counters for one `WebSocketServer` instance.
pub struct Metrics {
    operation_latencies: RwLock<VecDeque<u64>>,
    total_operations: AtomicU64,
    conflicts_resolved: AtomicU64,
    total_connections: AtomicU64,
    active_connections: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            operation_latencies: RwLock::new(VecDeque::with_capacity(MAX_LATENCY_SAMPLES)),
            total_operations: AtomicU64::new(0),
            conflicts_resolved: AtomicU64::new(0),
            total_connections: AtomicU64::new(0),
            active_connections: AtomicU64::new(0),
        }
    }

    pub fn record_operation(&self, latency_ms: u64) {
        self.total_operations.fetch_add(1, Ordering::Relaxed);
        let mut samples = self.operation_latencies.write();
        if samples.len() >= MAX_LATENCY_SAMPLES {
            samples.pop_front();
        }
        samples.push_back(latency_ms);
    }

    pub fn record_conflict(&self) {
        self.conflicts_resolved.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_connection_opened(&self) {
        self.total_connections.fetch_add(1, Ordering::Relaxed);
        self.active_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_connection_closed(&self) {
        self.active_connections.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let samples = self.operation_latencies.read();
        let avg = if samples.is_empty() {
            0.0
        } else {
            samples.iter().sum::<u64>() as f64 / samples.len() as f64
        };

        MetricsSnapshot {
            total_operations: self.total_operations.load(Ordering::Relaxed),
            avg_operation_latency_ms: avg,
            conflicts_resolved: self.conflicts_resolved.load(Ordering::Relaxed),
            total_connections: self.total_connections.load(Ordering::Relaxed),
            active_connections: self.active_connections.load(Ordering::Relaxed),
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reflects_recorded_operations() {
        let metrics = Metrics::new();
        metrics.record_operation(10);
        metrics.record_operation(20);
        metrics.record_conflict();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.total_operations, 2);
        assert_eq!(snapshot.avg_operation_latency_ms, 15.0);
        assert_eq!(snapshot.conflicts_resolved, 1);
    }

    #[test]
    fn connection_counters_track_open_and_close() {
        let metrics = Metrics::new();
        metrics.record_connection_opened();
        metrics.record_connection_opened();
        metrics.record_connection_closed();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.total_connections, 2);
        assert_eq!(snapshot.active_connections, 1);
    }

    #[test]
    fn latency_sample_window_is_bounded() {
        let metrics = Metrics::new();
        for i in 0..(MAX_LATENCY_SAMPLES + 10) {
            metrics.record_operation(i as u64);
        }
        assert_eq!(metrics.operation_latencies.read().len(), MAX_LATENCY_SAMPLES);
    }
}

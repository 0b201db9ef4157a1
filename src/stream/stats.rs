//! Per-player streaming counters and the introspection record
//!
//! Counters are bumped from the tick thread, the compressor thread and
//! transport callbacks, so they are plain atomics. Every bump is mirrored
//! into the session-wide `Metrics`.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::metrics::Metrics;

#[derive(Debug)]
pub struct StreamStats {
    chunks_sent: AtomicU64,
    chunks_cancelled: AtomicU64,
    sort_operations: AtomicU64,
    compression_nanos: AtomicU64,
    compression_count: AtomicU64,
    stale_completions: AtomicU64,
    load_failures: AtomicU64,
    compress_failures: AtomicU64,
    write_failures: AtomicU64,
    duplicate_watches: AtomicU64,
    metrics: Arc<Metrics>,
}

impl StreamStats {
    pub fn new(metrics: Arc<Metrics>) -> Self {
        Self {
            chunks_sent: AtomicU64::new(0),
            chunks_cancelled: AtomicU64::new(0),
            sort_operations: AtomicU64::new(0),
            compression_nanos: AtomicU64::new(0),
            compression_count: AtomicU64::new(0),
            stale_completions: AtomicU64::new(0),
            load_failures: AtomicU64::new(0),
            compress_failures: AtomicU64::new(0),
            write_failures: AtomicU64::new(0),
            duplicate_watches: AtomicU64::new(0),
            metrics,
        }
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    pub fn record_sent(&self) {
        self.chunks_sent.fetch_add(1, Ordering::Relaxed);
        self.metrics.chunks_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cancelled(&self) {
        self.chunks_cancelled.fetch_add(1, Ordering::Relaxed);
        self.metrics.chunks_cancelled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_sort(&self) {
        self.sort_operations.fetch_add(1, Ordering::Relaxed);
        self.metrics.sort_operations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_compression(&self, elapsed: Duration) {
        let nanos = elapsed.as_nanos() as u64;
        self.compression_nanos.fetch_add(nanos, Ordering::Relaxed);
        self.compression_count.fetch_add(1, Ordering::Relaxed);
        self.metrics.compressions.fetch_add(1, Ordering::Relaxed);
        self.metrics
            .compression_time_us
            .fetch_add(nanos / 1_000, Ordering::Relaxed);
    }

    pub fn record_stale(&self) {
        self.stale_completions.fetch_add(1, Ordering::Relaxed);
        self.metrics.stale_completions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_load_failure(&self) {
        self.load_failures.fetch_add(1, Ordering::Relaxed);
        self.metrics.load_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_compress_failure(&self) {
        self.compress_failures.fetch_add(1, Ordering::Relaxed);
        self.metrics.compress_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_write_failure(&self) {
        self.write_failures.fetch_add(1, Ordering::Relaxed);
        self.metrics.write_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_duplicate_watch(&self) {
        self.duplicate_watches.fetch_add(1, Ordering::Relaxed);
        self.metrics.duplicate_watches.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_unload(&self) {
        self.metrics.unloads_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn chunks_sent(&self) -> u64 {
        self.chunks_sent.load(Ordering::Relaxed)
    }

    pub fn chunks_cancelled(&self) -> u64 {
        self.chunks_cancelled.load(Ordering::Relaxed)
    }

    pub fn sort_operations(&self) -> u64 {
        self.sort_operations.load(Ordering::Relaxed)
    }

    pub fn stale_completions(&self) -> u64 {
        self.stale_completions.load(Ordering::Relaxed)
    }

    pub fn load_failures(&self) -> u64 {
        self.load_failures.load(Ordering::Relaxed)
    }

    pub fn compress_failures(&self) -> u64 {
        self.compress_failures.load(Ordering::Relaxed)
    }

    pub fn write_failures(&self) -> u64 {
        self.write_failures.load(Ordering::Relaxed)
    }

    pub fn duplicate_watches(&self) -> u64 {
        self.duplicate_watches.load(Ordering::Relaxed)
    }

    /// Mean compression time in microseconds, 0 before the first compression
    pub fn avg_compression_micros(&self) -> f64 {
        let count = self.compression_count.load(Ordering::Relaxed);
        if count == 0 {
            return 0.0;
        }
        self.compression_nanos.load(Ordering::Relaxed) as f64 / count as f64 / 1_000.0
    }

    /// Zero this player's counters. Session-wide metrics are left alone.
    pub fn reset(&self) {
        for counter in [
            &self.chunks_sent,
            &self.chunks_cancelled,
            &self.sort_operations,
            &self.compression_nanos,
            &self.compression_count,
            &self.stale_completions,
            &self.load_failures,
            &self.compress_failures,
            &self.write_failures,
            &self.duplicate_watches,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

/// Read-only view of one player's send pipeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamSnapshot {
    pub player_name: String,
    pub rate: f64,
    pub total_chunks_sent: u64,
    pub total_chunks_cancelled: u64,
    pub total_sort_operations: u64,
    pub avg_compression_micros: f64,
    pub to_send: usize,
    pub sending: usize,
    pub sent: usize,
    pub network_queue: usize,
    pub view_distance: i32,
}

impl StreamSnapshot {
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_mirror_into_metrics() {
        let metrics = Arc::new(Metrics::new());
        let stats = StreamStats::new(Arc::clone(&metrics));

        stats.record_sent();
        stats.record_sent();
        stats.record_cancelled();
        stats.record_sort();

        assert_eq!(stats.chunks_sent(), 2);
        assert_eq!(stats.chunks_cancelled(), 1);
        assert_eq!(metrics.chunks_sent.load(Ordering::Relaxed), 2);
        assert_eq!(metrics.sort_operations.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_avg_compression() {
        let stats = StreamStats::new(Arc::new(Metrics::new()));
        assert_eq!(stats.avg_compression_micros(), 0.0);

        stats.record_compression(Duration::from_micros(100));
        stats.record_compression(Duration::from_micros(300));
        assert!((stats.avg_compression_micros() - 200.0).abs() < 1e-9);
    }

    #[test]
    fn test_reset_keeps_global_metrics() {
        let metrics = Arc::new(Metrics::new());
        let stats = StreamStats::new(Arc::clone(&metrics));
        stats.record_sent();
        stats.record_compression(Duration::from_micros(50));

        stats.reset();

        assert_eq!(stats.chunks_sent(), 0);
        assert_eq!(stats.avg_compression_micros(), 0.0);
        assert_eq!(metrics.chunks_sent.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_snapshot_json() {
        let snapshot = StreamSnapshot {
            player_name: "alex".to_string(),
            rate: 5.0,
            total_chunks_sent: 289,
            total_chunks_cancelled: 0,
            total_sort_operations: 1,
            avg_compression_micros: 120.5,
            to_send: 0,
            sending: 0,
            sent: 289,
            network_queue: 0,
            view_distance: 8,
        };
        let parsed: serde_json::Value = serde_json::from_str(&snapshot.to_json()).unwrap();
        assert_eq!(parsed["player_name"], "alex");
        assert_eq!(parsed["sent"], 289);
    }
}

//! Prometheus-compatible metrics endpoint
//!
//! Exposes chunk streaming metrics in Prometheus format.
//! Default endpoint: http://localhost:9090/metrics

use parking_lot::RwLock;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tracing::{debug, info};

/// Samples kept for tick-time percentiles
const TICK_HISTORY_LEN: usize = 1000;

/// Process-wide streaming metrics, shared by every scheduler of a session
#[derive(Debug)]
pub struct Metrics {
    // Players
    pub players_streaming: AtomicU64,
    pub index_sectors: AtomicU64,

    // Send pipeline counters
    pub chunks_sent: AtomicU64,
    pub chunks_cancelled: AtomicU64,
    pub unloads_sent: AtomicU64,
    pub sort_operations: AtomicU64,
    pub compressions: AtomicU64,
    pub compression_time_us: AtomicU64,
    pub stale_completions: AtomicU64,
    pub duplicate_watches: AtomicU64,

    // Failures
    pub load_failures: AtomicU64,
    pub compress_failures: AtomicU64,
    pub write_failures: AtomicU64,

    // Queue depths summed over players (gauges)
    pub send_queue_depth: AtomicU64,
    pub in_flight_chunks: AtomicU64,
    pub network_queue_depth: AtomicU64,
    pub watched_chunks: AtomicU64,
    pub compressor_backlog: AtomicU64,

    // Tick timing (microseconds)
    pub tick_time_us: AtomicU64,
    pub tick_time_p95_us: AtomicU64,
    pub tick_time_p99_us: AtomicU64,
    pub tick_time_max_us: AtomicU64,
    pub tick_count: AtomicU64,

    start_time: Instant,

    // Rolling tick times for percentile calculation
    tick_history: RwLock<VecDeque<u64>>,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            players_streaming: AtomicU64::new(0),
            index_sectors: AtomicU64::new(0),
            chunks_sent: AtomicU64::new(0),
            chunks_cancelled: AtomicU64::new(0),
            unloads_sent: AtomicU64::new(0),
            sort_operations: AtomicU64::new(0),
            compressions: AtomicU64::new(0),
            compression_time_us: AtomicU64::new(0),
            stale_completions: AtomicU64::new(0),
            duplicate_watches: AtomicU64::new(0),
            load_failures: AtomicU64::new(0),
            compress_failures: AtomicU64::new(0),
            write_failures: AtomicU64::new(0),
            send_queue_depth: AtomicU64::new(0),
            in_flight_chunks: AtomicU64::new(0),
            network_queue_depth: AtomicU64::new(0),
            watched_chunks: AtomicU64::new(0),
            compressor_backlog: AtomicU64::new(0),
            tick_time_us: AtomicU64::new(0),
            tick_time_p95_us: AtomicU64::new(0),
            tick_time_p99_us: AtomicU64::new(0),
            tick_time_max_us: AtomicU64::new(0),
            tick_count: AtomicU64::new(0),
            start_time: Instant::now(),
            tick_history: RwLock::new(VecDeque::with_capacity(TICK_HISTORY_LEN)),
        }
    }

    /// Record a tick time and update percentiles
    pub fn record_tick_time(&self, duration: Duration) {
        let us = duration.as_micros() as u64;
        self.tick_time_us.store(us, Ordering::Relaxed);
        self.tick_count.fetch_add(1, Ordering::Relaxed);

        let mut history = self.tick_history.write();
        history.push_back(us);
        while history.len() > TICK_HISTORY_LEN {
            history.pop_front();
        }

        if history.len() >= 10 {
            let mut sorted: Vec<u64> = history.iter().copied().collect();
            sorted.sort_unstable();

            let p95_idx = (sorted.len() as f32 * 0.95) as usize;
            let p99_idx = (sorted.len() as f32 * 0.99) as usize;

            self.tick_time_p95_us.store(sorted[p95_idx.min(sorted.len() - 1)], Ordering::Relaxed);
            self.tick_time_p99_us.store(sorted[p99_idx.min(sorted.len() - 1)], Ordering::Relaxed);
            self.tick_time_max_us.store(sorted.last().copied().unwrap_or(0), Ordering::Relaxed);
        }
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    /// Generate Prometheus-format metrics output
    pub fn to_prometheus(&self) -> String {
        let mut output = String::with_capacity(4096);

        macro_rules! metric {
            ($name:expr, $help:expr, $type:expr, $value:expr) => {
                output.push_str(&format!(
                    "# HELP {} {}\n# TYPE {} {}\n{} {}\n",
                    $name, $help, $name, $type, $name, $value
                ));
            };
        }

        metric!("voxel_stream_players", "Players with an attached chunk scheduler", "gauge",
            self.players_streaming.load(Ordering::Relaxed));
        metric!("voxel_stream_index_sectors", "Non-empty sectors in the player index", "gauge",
            self.index_sectors.load(Ordering::Relaxed));

        metric!("voxel_stream_chunks_sent_total", "Chunks delivered to players", "counter",
            self.chunks_sent.load(Ordering::Relaxed));
        metric!("voxel_stream_chunks_cancelled_total", "Chunks cancelled after hand-off to the network", "counter",
            self.chunks_cancelled.load(Ordering::Relaxed));
        metric!("voxel_stream_unloads_sent_total", "Unload packets sent", "counter",
            self.unloads_sent.load(Ordering::Relaxed));
        metric!("voxel_stream_sort_operations_total", "Send queue sorts", "counter",
            self.sort_operations.load(Ordering::Relaxed));
        metric!("voxel_stream_compressions_total", "Chunk payloads compressed", "counter",
            self.compressions.load(Ordering::Relaxed));
        metric!("voxel_stream_compression_microseconds_total", "Time spent compressing chunk payloads", "counter",
            self.compression_time_us.load(Ordering::Relaxed));
        metric!("voxel_stream_stale_completions_total", "Load or compression results for cancelled attempts", "counter",
            self.stale_completions.load(Ordering::Relaxed));
        metric!("voxel_stream_duplicate_watches_total", "Completions for chunks the player already watched", "counter",
            self.duplicate_watches.load(Ordering::Relaxed));

        metric!("voxel_stream_load_failures_total", "Chunk loads reported as failed", "counter",
            self.load_failures.load(Ordering::Relaxed));
        metric!("voxel_stream_compress_failures_total", "Chunk payloads that failed to encode", "counter",
            self.compress_failures.load(Ordering::Relaxed));
        metric!("voxel_stream_write_failures_total", "Chunk packets the transport failed to write", "counter",
            self.write_failures.load(Ordering::Relaxed));

        metric!("voxel_stream_send_queue_depth", "Chunks waiting to be dispatched", "gauge",
            self.send_queue_depth.load(Ordering::Relaxed));
        metric!("voxel_stream_in_flight_chunks", "Chunks loading or compressing", "gauge",
            self.in_flight_chunks.load(Ordering::Relaxed));
        metric!("voxel_stream_network_queue_depth", "Chunk packets not yet written", "gauge",
            self.network_queue_depth.load(Ordering::Relaxed));
        metric!("voxel_stream_watched_chunks", "Chunks delivered and watched", "gauge",
            self.watched_chunks.load(Ordering::Relaxed));
        metric!("voxel_stream_compressor_backlog", "Jobs waiting for the compressor thread", "gauge",
            self.compressor_backlog.load(Ordering::Relaxed));

        metric!("voxel_stream_tick_time_microseconds", "Current tick time in microseconds", "gauge",
            self.tick_time_us.load(Ordering::Relaxed));
        metric!("voxel_stream_tick_time_p95_microseconds", "95th percentile tick time", "gauge",
            self.tick_time_p95_us.load(Ordering::Relaxed));
        metric!("voxel_stream_tick_time_p99_microseconds", "99th percentile tick time", "gauge",
            self.tick_time_p99_us.load(Ordering::Relaxed));
        metric!("voxel_stream_tick_time_max_microseconds", "Maximum tick time", "gauge",
            self.tick_time_max_us.load(Ordering::Relaxed));
        metric!("voxel_stream_tick_count", "Total ticks processed", "counter",
            self.tick_count.load(Ordering::Relaxed));
        metric!("voxel_stream_uptime_seconds", "Server uptime in seconds", "counter",
            self.uptime_seconds());

        output
    }

    /// JSON view of the same metrics
    pub fn to_json(&self) -> String {
        let load = |v: &AtomicU64| v.load(Ordering::Relaxed);
        serde_json::json!({
            "players": {
                "streaming": load(&self.players_streaming),
                "index_sectors": load(&self.index_sectors),
            },
            "pipeline": {
                "chunks_sent": load(&self.chunks_sent),
                "chunks_cancelled": load(&self.chunks_cancelled),
                "unloads_sent": load(&self.unloads_sent),
                "sort_operations": load(&self.sort_operations),
                "compressions": load(&self.compressions),
                "compression_time_us": load(&self.compression_time_us),
                "stale_completions": load(&self.stale_completions),
                "duplicate_watches": load(&self.duplicate_watches),
            },
            "failures": {
                "load": load(&self.load_failures),
                "compress": load(&self.compress_failures),
                "write": load(&self.write_failures),
            },
            "queues": {
                "send_queue": load(&self.send_queue_depth),
                "in_flight": load(&self.in_flight_chunks),
                "network_queue": load(&self.network_queue_depth),
                "watched": load(&self.watched_chunks),
                "compressor_backlog": load(&self.compressor_backlog),
            },
            "performance": {
                "tick_time_us": load(&self.tick_time_us),
                "tick_time_p95_us": load(&self.tick_time_p95_us),
                "tick_time_p99_us": load(&self.tick_time_p99_us),
                "tick_time_max_us": load(&self.tick_time_max_us),
                "tick_count": load(&self.tick_count),
                "uptime_seconds": self.uptime_seconds(),
            },
        })
        .to_string()
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Start the metrics HTTP server
pub async fn start_metrics_server(metrics: Arc<Metrics>, port: u16) -> anyhow::Result<()> {
    let addr = format!("0.0.0.0:{}", port);
    let listener = TcpListener::bind(&addr).await?;

    info!("Metrics server listening on http://{}/metrics", addr);

    loop {
        let (mut socket, peer) = listener.accept().await?;
        let metrics = metrics.clone();

        tokio::spawn(async move {
            let mut buffer = [0u8; 1024];

            match socket.read(&mut buffer).await {
                Ok(n) if n > 0 => {
                    let request = String::from_utf8_lossy(&buffer[..n]);

                    let (status, content_type, body) = if request.starts_with("GET /metrics/json") {
                        ("200 OK", "application/json", metrics.to_json())
                    } else if request.starts_with("GET /metrics") {
                        ("200 OK", "text/plain; version=0.0.4", metrics.to_prometheus())
                    } else if request.starts_with("GET /health") {
                        ("200 OK", "text/plain", "OK".to_string())
                    } else {
                        ("404 Not Found", "text/plain", String::new())
                    };

                    let response = format!(
                        "HTTP/1.1 {}\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                        status,
                        content_type,
                        body.len(),
                        body
                    );

                    if let Err(e) = socket.write_all(response.as_bytes()).await {
                        debug!("Failed to write metrics response to {}: {}", peer, e);
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    debug!("Failed to read from metrics socket {}: {}", peer, e);
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_new() {
        let metrics = Metrics::new();
        assert_eq!(metrics.chunks_sent.load(Ordering::Relaxed), 0);
        assert_eq!(metrics.tick_count.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_record_tick_time() {
        let metrics = Metrics::new();

        for i in 0..100 {
            metrics.record_tick_time(Duration::from_micros(100 + i * 10));
        }

        assert_eq!(metrics.tick_count.load(Ordering::Relaxed), 100);
        assert!(metrics.tick_time_p95_us.load(Ordering::Relaxed) > 0);
        assert_eq!(metrics.tick_time_max_us.load(Ordering::Relaxed), 1090);
    }

    #[test]
    fn test_prometheus_format() {
        let metrics = Metrics::new();
        metrics.chunks_sent.store(289, Ordering::Relaxed);
        metrics.players_streaming.store(3, Ordering::Relaxed);

        let output = metrics.to_prometheus();

        assert!(output.contains("voxel_stream_chunks_sent_total 289"));
        assert!(output.contains("voxel_stream_players 3"));
        assert!(output.contains("# HELP"));
        assert!(output.contains("# TYPE voxel_stream_tick_count counter"));
    }

    #[test]
    fn test_json_format() {
        let metrics = Metrics::new();
        metrics.chunks_cancelled.store(7, Ordering::Relaxed);

        let parsed: serde_json::Value = serde_json::from_str(&metrics.to_json()).unwrap();
        assert_eq!(parsed["pipeline"]["chunks_cancelled"], 7);
        assert!(parsed["performance"].is_object());
    }
}

use std::str::FromStr;
use std::time::Duration;

use crate::constants::{server, view};

/// Chunk streaming configuration
#[derive(Debug, Clone)]
pub struct StreamingConfig {
    /// Upper bound of the adaptive send rate (chunks per tick, per player)
    pub max_send_rate: u32,
    /// Preload radius requested when a loaded chunk turns out unpopulated
    pub gen_chunk_preload_radius: i32,
    /// Movement (in chunks, either axis) required before the send queue is re-sorted
    pub sort_position_threshold: i32,
    /// Verbose per-operation logging
    pub debug: bool,
    /// Interval between per-player statistics lines
    pub stats_log_interval: Duration,
    /// World view distance in chunks (clients may request less)
    pub view_distance: i32,
    /// Deflate level for chunk payloads (0-9)
    pub compression_level: u32,
    /// Tick rate of the streaming loop in Hz
    pub tick_rate: u32,
    /// Port of the metrics endpoint
    pub metrics_port: u16,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            max_send_rate: 10,
            gen_chunk_preload_radius: view::DEFAULT_GEN_PRELOAD_RADIUS,
            sort_position_threshold: view::DEFAULT_SORT_POSITION_THRESHOLD,
            debug: false,
            stats_log_interval: Duration::from_millis(server::STATS_LOG_INTERVAL_MS),
            view_distance: view::DEFAULT_VIEW_DISTANCE,
            compression_level: server::COMPRESSION_LEVEL,
            tick_rate: server::TICK_RATE,
            metrics_port: server::METRICS_PORT,
        }
    }
}

/// Read and parse an environment variable, warning (and returning None) on garbage
fn env_parse<T: FromStr>(name: &str) -> Option<T> {
    let raw = std::env::var(name).ok()?;
    match raw.trim().parse::<T>() {
        Ok(parsed) => Some(parsed),
        Err(_) => {
            tracing::warn!("Invalid {} '{}', using default", name, raw);
            None
        }
    }
}

impl StreamingConfig {
    /// Load config from environment or use defaults
    pub fn load_or_default() -> Self {
        let mut config = Self::default();

        if let Some(rate) = env_parse::<u32>("MAX_SEND_RATE") {
            if (1..=1000).contains(&rate) {
                config.max_send_rate = rate;
            } else {
                tracing::warn!("MAX_SEND_RATE must be 1-1000, using default");
            }
        }

        if let Some(radius) = env_parse::<i32>("GEN_CHUNK_PRELOAD_RADIUS") {
            if (1..=8).contains(&radius) {
                config.gen_chunk_preload_radius = radius;
            } else {
                tracing::warn!("GEN_CHUNK_PRELOAD_RADIUS must be 1-8, using default");
            }
        }

        if let Some(threshold) = env_parse::<i32>("SORT_POSITION_THRESHOLD") {
            if threshold >= 0 {
                config.sort_position_threshold = threshold;
            } else {
                tracing::warn!("SORT_POSITION_THRESHOLD must be >= 0, using default");
            }
        }

        if let Some(debug) = env_parse::<bool>("CHUNK_SEND_DEBUG") {
            config.debug = debug;
        }

        if let Some(ms) = env_parse::<u64>("STATS_LOG_INTERVAL_MS") {
            config.stats_log_interval = Duration::from_millis(ms);
        }

        if let Some(view) = env_parse::<i32>("VIEW_DISTANCE") {
            if (2..=32).contains(&view) {
                config.view_distance = view;
            } else {
                tracing::warn!("VIEW_DISTANCE must be 2-32, using default");
            }
        }

        if let Some(level) = env_parse::<u32>("COMPRESSION_LEVEL") {
            if level <= 9 {
                config.compression_level = level;
            } else {
                tracing::warn!("COMPRESSION_LEVEL must be 0-9, using default");
            }
        }

        if let Some(tick_rate) = env_parse::<u32>("TICK_RATE") {
            if tick_rate > 0 {
                config.tick_rate = tick_rate;
            } else {
                tracing::warn!("TICK_RATE must be > 0, using default");
            }
        }

        if let Some(port) = env_parse::<u16>("METRICS_PORT") {
            config.metrics_port = port;
        }

        config
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> Result<(), String> {
        if self.max_send_rate == 0 {
            return Err("max_send_rate must be at least 1".to_string());
        }
        if self.view_distance < 1 {
            return Err("view_distance must be at least 1".to_string());
        }
        if self.gen_chunk_preload_radius < 1 {
            return Err("gen_chunk_preload_radius must be at least 1".to_string());
        }
        if self.sort_position_threshold < 0 {
            return Err("sort_position_threshold cannot be negative".to_string());
        }
        if self.compression_level > 9 {
            return Err("compression_level must be 0-9".to_string());
        }
        if self.tick_rate == 0 {
            return Err("tick_rate must be at least 1".to_string());
        }
        Ok(())
    }

    /// Upper bound of the adaptive rate as a float
    #[inline]
    pub fn max_rate(&self) -> f64 {
        self.max_send_rate as f64
    }

    /// Duration of one tick of the streaming loop
    pub fn tick_duration(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.tick_rate as f64)
    }
}

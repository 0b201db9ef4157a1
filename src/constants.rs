/// Adaptive send-rate constants. Rates are in chunks per tick.
pub mod rate {
    /// Floor of the adaptive rate (one chunk every 5 ticks)
    pub const MIN_RATE: f64 = 0.2;
    /// Network queue empty - increase rapidly
    pub const STEP_QUEUE_EMPTY: f64 = 0.14;
    /// Queue below half the max rate - increase moderately
    pub const STEP_QUEUE_SMALL: f64 = 0.10;
    /// Queue below the max rate - increase slowly
    pub const STEP_QUEUE_ACCEPTABLE: f64 = 0.05;
    /// Queue beyond twice the max rate - decrease rapidly
    pub const STEP_QUEUE_OVERFLOW: f64 = -0.20;
    /// Queue above the max rate and still growing - decrease moderately
    pub const STEP_QUEUE_GROWING: f64 = -0.10;
    /// Proportional gain used when the queue is stable
    pub const STABLE_GAIN: f64 = 0.01;
    /// Dispatch freezes once the network queue exceeds max_rate * this
    pub const QUEUE_LIMIT_FACTOR: usize = 2;
}

/// View-distance and load constants
pub mod view {
    /// World view distance used when nothing else is configured
    pub const DEFAULT_VIEW_DISTANCE: i32 = 10;
    /// Preload radius of the first load request for a chunk
    pub const INITIAL_LOAD_RADIUS: i32 = 1;
    /// Preload radius requested when a chunk arrives unpopulated
    pub const DEFAULT_GEN_PRELOAD_RADIUS: i32 = 2;
    /// Re-sort only after moving this many chunks on either axis
    pub const DEFAULT_SORT_POSITION_THRESHOLD: i32 = 3;
    /// Initial capacity of the send queue (21 * 21 view square)
    pub const SEND_QUEUE_CAPACITY: usize = 441;
}

/// Player spatial index constants
pub mod spatial {
    /// Sector edge in blocks (one chunk)
    pub const SECTOR_SIZE: i32 = 16;
    /// log2(SECTOR_SIZE) for shift-based division
    pub const SECTOR_SHIFT: i32 = 4;
    /// Ring cap for closest-player searches without a radius
    pub const UNBOUNDED_SEARCH_RINGS: i32 = 64;
}

/// Chunk column geometry
pub mod chunk {
    /// Blocks per horizontal chunk edge
    pub const WIDTH: usize = 16;
    /// Vertical sections per column
    pub const SECTIONS: usize = 16;
    /// Blocks per 16x16x16 section
    pub const SECTION_VOLUME: usize = 4096;
    /// Biome entries per column
    pub const BIOME_AREA: usize = WIDTH * WIDTH;
}

/// Server loop and statistics constants
pub mod server {
    /// Default tick rate of the streaming loop in Hz
    pub const TICK_RATE: u32 = 20;
    /// Default interval between per-player statistics lines
    pub const STATS_LOG_INTERVAL_MS: u64 = 60_000;
    /// Default deflate level for chunk payloads
    pub const COMPRESSION_LEVEL: u32 = 6;
    /// Default port of the metrics endpoint
    pub const METRICS_PORT: u16 = 9090;
}

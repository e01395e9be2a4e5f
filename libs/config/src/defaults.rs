//! Bus defaults
//!
//! Default values shared by the configuration structs and by code that
//! constructs messages without access to a loaded configuration.

/// Worker pool defaults
pub mod pool {
    /// Number of priority groups (partitions of the worker pool)
    pub const PRIORITY_GROUPS: usize = 3;

    /// Workers created per priority group
    pub const WORKERS_PER_GROUP: usize = 2;
}

/// Admission control defaults
pub mod dedup {
    /// Independent lock shards
    pub const SHARDS: usize = 4;

    /// In-flight keys retained per shard before the oldest is evicted
    pub const CAPACITY_PER_SHARD: usize = 10_000;

    /// Keys expire after this long even if never released (milliseconds)
    pub const TTL_MS: u64 = 60_000;
}

/// Adaptive balancer defaults
pub mod balancer {
    pub const KP: f64 = 0.5;
    pub const KI: f64 = 0.05;
    pub const KD: f64 = 0.1;
    pub const LEARNING_RATE: f64 = 0.01;
    pub const LEARNING_RATE_DECAY: f64 = 0.999;

    /// Weight of the raw control signal against the penalized one
    pub const SMOOTHING: f64 = 0.5;

    /// Softmax temperature
    pub const TEMPERATURE: f64 = 1.0;

    /// Counter value that triggers halving of all group counters
    pub const GROWTH_THRESHOLD: f64 = 1_000.0;

    /// Multiplier applied to the threshold after each halving
    pub const GROWTH_FACTOR: f64 = 2.0;
}

/// Dead-letter defaults
pub mod dead_letter {
    /// Failed deliveries retained before the oldest is evicted
    pub const CAPACITY: usize = 1_000;
}

/// Command defaults
pub mod commands {
    /// Window within which structurally identical commands share a key (seconds)
    pub const EXPIRY_WINDOW_SECS: u64 = 5;
}

/// Shutdown defaults
pub mod shutdown {
    /// Upper bound on the drain poll during `stop()` (milliseconds)
    pub const DRAIN_TIMEOUT_MS: u64 = 1_000;

    /// Poll interval while waiting for workers to go idle (milliseconds)
    pub const POLL_INTERVAL_MS: u64 = 10;
}

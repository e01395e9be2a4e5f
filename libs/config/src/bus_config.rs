//! Bus Configuration Module
//!
//! Provides configuration loading and validation for the message bus.
//! Supports loading from TOML files with environment variable overrides.

use crate::defaults;
use anyhow::{bail, Context, Result};
use config_crate::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};

/// Environment variable prefix for overrides
pub const ENV_PREFIX: &str = "BUS";

/// Separator between nested keys in environment variables
pub const ENV_SEPARATOR: &str = "__";

/// Main bus configuration structure
#[derive(Debug, Deserialize, Serialize, Clone, Default, PartialEq)]
#[serde(default)]
pub struct BusConfig {
    /// Worker pool sizing
    pub pool: PoolConfig,

    /// Admission control (deduplication) bounds
    pub dedup: DedupConfig,

    /// Adaptive priority balancer tuning
    pub balancer: BalancerConfig,

    /// Dead-letter retention
    pub dead_letter: DeadLetterConfig,

    /// Command key derivation
    pub commands: CommandConfig,

    /// Shutdown timing
    pub shutdown: ShutdownConfig,
}

/// Worker pool sizing
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default)]
pub struct PoolConfig {
    pub priority_groups: usize,
    pub workers_per_group: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            priority_groups: defaults::pool::PRIORITY_GROUPS,
            workers_per_group: defaults::pool::WORKERS_PER_GROUP,
        }
    }
}

impl PoolConfig {
    /// Total number of workers the pool creates
    pub fn total_workers(&self) -> usize {
        self.priority_groups * self.workers_per_group
    }
}

/// Admission control bounds
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default)]
pub struct DedupConfig {
    pub shards: usize,
    pub capacity_per_shard: usize,
    pub ttl_ms: u64,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            shards: defaults::dedup::SHARDS,
            capacity_per_shard: defaults::dedup::CAPACITY_PER_SHARD,
            ttl_ms: defaults::dedup::TTL_MS,
        }
    }
}

impl DedupConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_ms)
    }
}

/// Adaptive balancer tuning
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default)]
pub struct BalancerConfig {
    /// Initial proportional gain
    pub kp: f64,
    /// Initial integral gain
    pub ki: f64,
    /// Initial derivative gain
    pub kd: f64,
    /// Initial step size for online gain tuning
    pub learning_rate: f64,
    /// Geometric decay applied to the learning rate every decision
    pub learning_rate_decay: f64,
    /// Blend factor between raw and penalized control signals, in [0, 1]
    pub smoothing: f64,
    /// Softmax temperature, must be positive
    pub temperature: f64,
    /// Counter value that triggers halving
    pub growth_threshold: f64,
    /// Threshold multiplier applied after halving
    pub growth_factor: f64,
    /// Fixed RNG seed for reproducible routing (None = OS entropy)
    pub seed: Option<u64>,
}

impl Default for BalancerConfig {
    fn default() -> Self {
        Self {
            kp: defaults::balancer::KP,
            ki: defaults::balancer::KI,
            kd: defaults::balancer::KD,
            learning_rate: defaults::balancer::LEARNING_RATE,
            learning_rate_decay: defaults::balancer::LEARNING_RATE_DECAY,
            smoothing: defaults::balancer::SMOOTHING,
            temperature: defaults::balancer::TEMPERATURE,
            growth_threshold: defaults::balancer::GROWTH_THRESHOLD,
            growth_factor: defaults::balancer::GROWTH_FACTOR,
            seed: None,
        }
    }
}

/// Dead-letter retention
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default)]
pub struct DeadLetterConfig {
    pub capacity: usize,
}

impl Default for DeadLetterConfig {
    fn default() -> Self {
        Self {
            capacity: defaults::dead_letter::CAPACITY,
        }
    }
}

/// Command key derivation
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default)]
pub struct CommandConfig {
    pub expiry_window_secs: u64,
}

impl Default for CommandConfig {
    fn default() -> Self {
        Self {
            expiry_window_secs: defaults::commands::EXPIRY_WINDOW_SECS,
        }
    }
}

impl CommandConfig {
    pub fn expiry_window(&self) -> Duration {
        Duration::from_secs(self.expiry_window_secs)
    }
}

/// Shutdown timing
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default)]
pub struct ShutdownConfig {
    pub drain_timeout_ms: u64,
    pub poll_interval_ms: u64,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            drain_timeout_ms: defaults::shutdown::DRAIN_TIMEOUT_MS,
            poll_interval_ms: defaults::shutdown::POLL_INTERVAL_MS,
        }
    }
}

impl ShutdownConfig {
    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl BusConfig {
    /// Load configuration from an optional TOML file with environment overrides
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder();

        if let Some(path) = path {
            info!("Loading bus config: {:?}", path);
            builder = builder.add_source(File::from(path).required(true));
        }

        // Override with environment variables (BUS__ prefix)
        builder = builder.add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator(ENV_SEPARATOR)
                .separator(ENV_SEPARATOR)
                .try_parsing(true),
        );

        let config: BusConfig = builder
            .build()
            .context("Failed to build bus configuration")?
            .try_deserialize()
            .context("Failed to deserialize bus configuration")?;

        config.validate()?;
        debug!(?config, "Bus configuration loaded");
        Ok(config)
    }

    /// Parse and validate configuration from TOML text
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: BusConfig =
            toml::from_str(content).context("Failed to parse bus configuration TOML")?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.pool.priority_groups == 0 {
            bail!("pool.priority_groups must be greater than 0");
        }
        if self.pool.workers_per_group == 0 {
            bail!("pool.workers_per_group must be greater than 0");
        }

        if self.dedup.shards == 0 {
            bail!("dedup.shards must be greater than 0");
        }
        if self.dedup.capacity_per_shard == 0 {
            bail!("dedup.capacity_per_shard must be greater than 0");
        }
        if self.dedup.ttl_ms == 0 {
            bail!("dedup.ttl_ms must be greater than 0");
        }

        let b = &self.balancer;
        if !(b.temperature > 0.0) {
            bail!("balancer.temperature must be positive, got {}", b.temperature);
        }
        if !(0.0..=1.0).contains(&b.smoothing) {
            bail!("balancer.smoothing must be within [0, 1], got {}", b.smoothing);
        }
        if !(b.learning_rate_decay > 0.0 && b.learning_rate_decay <= 1.0) {
            bail!(
                "balancer.learning_rate_decay must be within (0, 1], got {}",
                b.learning_rate_decay
            );
        }
        if !(b.growth_factor > 1.0) {
            bail!("balancer.growth_factor must be greater than 1, got {}", b.growth_factor);
        }
        if !(b.growth_threshold > 0.0) {
            bail!("balancer.growth_threshold must be positive, got {}", b.growth_threshold);
        }

        if self.dead_letter.capacity == 0 {
            bail!("dead_letter.capacity must be greater than 0");
        }
        if self.commands.expiry_window_secs == 0 {
            bail!("commands.expiry_window_secs must be greater than 0");
        }
        if self.shutdown.poll_interval_ms == 0 {
            bail!("shutdown.poll_interval_ms must be greater than 0");
        }

        Ok(())
    }
}

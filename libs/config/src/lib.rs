//! # Bus Configuration
//!
//! Centralized configuration and defaults for the in-process actor message
//! bus: worker pool sizing, admission-control (dedup) bounds, the adaptive
//! priority balancer, dead-letter retention and shutdown timing.
//!
//! ## Layering
//!
//! 1. Built-in defaults (see [`defaults`])
//! 2. Optional TOML file
//! 3. Environment variables with the `BUS` prefix and `__` separator,
//!    e.g. `BUS__POOL__WORKERS_PER_GROUP=4`
//!
//! ## Usage
//!
//! ```rust,no_run
//! use bus_config::BusConfig;
//!
//! let config = BusConfig::load(Some("config/bus.toml".as_ref())).unwrap();
//! assert!(config.pool.priority_groups > 0);
//! ```

pub mod bus_config;
pub mod defaults;

pub use bus_config::{
    BalancerConfig, BusConfig, CommandConfig, DeadLetterConfig, DedupConfig, PoolConfig,
    ShutdownConfig,
};

//! Configuration management for the harvester
//!
//! Settings are layered, lowest priority first:
//! 1. Default values (embedded in structs)
//! 2. TOML configuration file
//! 3. `.env` file and environment variables
//!
//! # Usage
//!
//! ```no_run
//! use harvester::config::Config;
//!
//! let config = Config::load().expect("Failed to load configuration");
//! println!("Worker nodes: {}", config.worker.nodes);
//! ```
//!
//! # Environment Variables
//!
//! Any key can be overridden with `HARVESTER__<section>__<key>`:
//! - `HARVESTER__WORKER__POOL_SIZE=32`
//! - `HARVESTER__LIMITS__MIN_THROUGHPUT=16KB`
//! - `HARVESTER__TELEMETRY__LOG_FILTER=harvester=debug`
//!
//! # Configuration File
//!
//! Read from `config/harvester.toml` unless `HARVESTER_CONFIG` points elsewhere.

mod models;
mod sources;
mod validation;

pub use crate::humanize::ByteSize;
pub use models::{
    Config, LedgerConfig, LimitsConfig, MasterConfig, RetentionConfig, TelemetryConfig,
    WorkerConfig,
};
pub use validation::ValidationError;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    LoadError(#[from] config::ConfigError),

    #[error("Configuration validation failed: {0}")]
    ValidationError(#[from] ValidationError),
}

impl Config {
    /// Load configuration from all sources (file + environment)
    ///
    /// # Errors
    ///
    /// Returns an error if the file is malformed or validation fails.
    pub fn load() -> Result<Self, ConfigError> {
        let config = sources::load()?;
        validation::validate(&config)?;
        Ok(config)
    }

    /// Load configuration from a specific path
    pub fn load_from_path(path: std::path::PathBuf) -> Result<Self, ConfigError> {
        let config = sources::load_from_sources(path)?;
        validation::validate(&config)?;
        Ok(config)
    }
}

//! Tracing subscriber setup.
//!
//! `RUST_LOG` wins when set; otherwise the level comes from
//! `[application] log_level`.

use crate::config::ApplicationConfig;
use crate::error::{AppResult, SweepError};
use tracing_subscriber::EnvFilter;

/// Filter from `RUST_LOG`, falling back to `level`.
pub fn filter_for(level: &str) -> AppResult<EnvFilter> {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .map_err(|e| SweepError::Configuration(format!("invalid log filter '{}': {}", level, e)))
}

/// Installs the global `fmt` subscriber. Fails if one is already installed.
pub fn init(config: &ApplicationConfig) -> AppResult<()> {
    let filter = filter_for(&config.log_level)?;
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init()
        .map_err(|e| SweepError::Configuration(format!("failed to initialise logging: {}", e)))
}

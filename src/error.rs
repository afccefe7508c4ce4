//! Custom error types for the sweep library.
//!
//! `SweepError` is the single error type returned by library code. The binary
//! wraps it in `anyhow` at the edge.
//!
//! ## Error Hierarchy
//!
//! - **`Configuration`** / **`NoVoltages`**: problems detected before any hardware is
//!   touched (an empty voltage sequence, an invalid analyzer port count). Fatal to the run.
//! - **`Communication`**: any instrument I/O failure (timeout, malformed response,
//!   connection loss). The orchestrator drives every instrument to a safe state and
//!   then propagates it unchanged.
//! - **`DataShape`**: a bias-source record whose token count is not a multiple of the
//!   channel count. Callers may downgrade it to a warning.
//! - **`Io`**, **`Csv`**, **`Json`**, **`Figment`**: wrapped library errors, created with
//!   `?` through `#[from]`.

use thiserror::Error;

/// Convenience alias for results using the library error type.
pub type AppResult<T> = std::result::Result<T, SweepError>;

/// Error taxonomy for configuration, instrument I/O and record handling.
#[derive(Error, Debug)]
pub enum SweepError {
    /// Semantic configuration error caught during validation.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// A bias source has no voltage set-points to sweep.
    #[error("Configuration error: no voltages defined for bias source '{label}'")]
    NoVoltages {
        /// Label of the offending source.
        label: String,
    },

    /// Instrument I/O failed.
    #[error("Communication error with '{instrument}': {message}")]
    Communication {
        /// Resource string or label of the instrument.
        instrument: String,
        /// Transport-level description of the failure.
        message: String,
    },

    /// A record could not be split into whole channel groups.
    #[error("Record has {tokens} values, which is not a multiple of {channels} channels")]
    DataShape {
        /// Number of comma-separated tokens received.
        tokens: usize,
        /// Expected number of channels per sample.
        channels: usize,
    },

    /// A record token is not a number.
    #[error("Failed to parse record value: {0}")]
    Parse(String),

    /// File I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// CSV encoding or decoding failure.
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    /// Metadata serialization failure.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration file could not be loaded or extracted.
    #[error("Configuration load error: {0}")]
    Figment(#[from] figment::Error),

    /// Compiled without support for the requested functionality.
    #[error("Feature '{0}' is not enabled. Please build with --features {0}")]
    FeatureNotEnabled(String),

    /// One or more instruments could not be driven to a safe state.
    #[error("Shutdown failed with {} error(s)", .0.len())]
    ShutdownFailed(Vec<SweepError>),
}

impl SweepError {
    /// Builds a `Communication` error for `instrument`.
    pub fn communication(instrument: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Communication {
            instrument: instrument.into(),
            message: message.into(),
        }
    }

    /// True for errors detected before touching hardware.
    pub fn is_configuration(&self) -> bool {
        matches!(self, Self::Configuration(_) | Self::NoVoltages { .. })
    }

    /// True for instrument I/O failures.
    pub fn is_communication(&self) -> bool {
        matches!(self, Self::Communication { .. })
    }
}

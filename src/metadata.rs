//! Run metadata embedded in saved records.
//!
//! Every per-source CSV starts with a commented JSON block describing the run
//! that produced it, so a file found on disk months later still says which
//! source, which set-points and which software version made it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Describes one bias source's contribution to a sweep run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunMetadata {
    /// Base test name of the run.
    pub run_name: String,
    /// Label of the bias source the record belongs to.
    pub source_label: String,
    /// Voltage set-points swept by this source, in sweep order.
    pub voltages: Vec<f64>,
    /// Time the run started.
    pub started_at: DateTime<Utc>,
    /// Free-form run parameters (delays, acquisition mode, ...).
    pub parameters: BTreeMap<String, serde_json::Value>,
    /// Version of the sweep software.
    pub software_version: String,
}

impl Default for RunMetadata {
    fn default() -> Self {
        Self {
            run_name: String::new(),
            source_label: String::new(),
            voltages: Vec::new(),
            started_at: Utc::now(),
            parameters: BTreeMap::new(),
            software_version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// A builder for constructing `RunMetadata` instances.
#[derive(Default)]
pub struct RunMetadataBuilder {
    inner: RunMetadata,
}

impl RunMetadataBuilder {
    /// Starts from defaults (current time, crate version).
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the base test name.
    pub fn run_name(mut self, name: &str) -> Self {
        self.inner.run_name = name.to_string();
        self
    }

    /// Sets the source label.
    pub fn source_label(mut self, label: &str) -> Self {
        self.inner.source_label = label.to_string();
        self
    }

    /// Sets the swept voltages.
    pub fn voltages(mut self, voltages: &[f64]) -> Self {
        self.inner.voltages = voltages.to_vec();
        self
    }

    /// Overrides the start time.
    pub fn started_at(mut self, started_at: DateTime<Utc>) -> Self {
        self.inner.started_at = started_at;
        self
    }

    /// Adds a run parameter.
    pub fn parameter(mut self, key: &str, value: serde_json::Value) -> Self {
        self.inner.parameters.insert(key.to_string(), value);
        self
    }

    /// Finishes the builder.
    pub fn build(self) -> RunMetadata {
        self.inner
    }
}

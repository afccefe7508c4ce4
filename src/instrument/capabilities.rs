//! Capability traits the sweep orchestrator drives.
//!
//! Any instrument implementing `BiasSource` can be stepped through voltages;
//! any instrument implementing `DependentInstrument` can be triggered once per
//! bias combination. The orchestrator never sees SCPI.

use crate::error::AppResult;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Capability for controllable DC voltage sources that also record V/I/R/t.
#[async_trait]
pub trait BiasSource: Send {
    /// Label used in artifact names and CSV file names.
    fn label(&self) -> &str;

    /// Forces `volts` on the output.
    async fn set_voltage(&mut self, volts: f64) -> AppResult<()>;

    /// Starts a background acquisition sampling every `sample_interval`.
    async fn start_measurement(&mut self, sample_interval: Duration) -> AppResult<()>;

    /// Stops the background acquisition and returns its raw record.
    async fn stop_measurement(&mut self) -> AppResult<String>;

    /// Takes a single reading and returns its raw record.
    async fn measure_once(&mut self) -> AppResult<String>;

    /// Drives the output to zero and disables it. Safe to call repeatedly,
    /// including while unwinding from another error.
    async fn output_off(&mut self) -> AppResult<()>;

    /// Pops the oldest entry from the instrument error queue, if any.
    async fn read_error(&mut self) -> AppResult<Option<String>> {
        Ok(None)
    }

    /// Zeroes the elapsed-time counter reported in records.
    async fn reset_elapsed_time(&mut self) -> AppResult<()>;

    /// Turns the output off and releases the connection.
    async fn disconnect(&mut self) -> AppResult<()>;
}

/// Parameters forwarded untouched from configuration to the dependent
/// instrument (e.g. `if_bandwidth`, `points`).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MeasurementParams(pub BTreeMap<String, String>);

impl MeasurementParams {
    /// Empty parameter set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds or replaces a parameter.
    pub fn with(mut self, key: &str, value: impl ToString) -> Self {
        self.0.insert(key.to_string(), value.to_string());
        self
    }

    /// Looks up a parameter.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }
}

/// Handle to the result produced by one dependent measurement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeasurementArtifact {
    /// Artifact identifier the measurement was saved under.
    pub name: String,
    /// Where the result file lives, if one was written.
    pub location: Option<String>,
}

/// Capability for the instrument measured once per bias combination.
#[async_trait]
pub trait DependentInstrument: Send {
    /// Human-readable identifier for logs.
    fn name(&self) -> &str;

    /// Checks `params` and the instrument's own setup before any hardware is
    /// touched.
    fn validate(&self, _params: &MeasurementParams) -> AppResult<()> {
        Ok(())
    }

    /// Runs one measurement synchronously and saves it under `name`.
    async fn measure(
        &mut self,
        name: &str,
        params: &MeasurementParams,
    ) -> AppResult<MeasurementArtifact>;

    /// Puts the instrument in a safe idle state. Safe to call repeatedly.
    async fn output_off(&mut self) -> AppResult<()>;

    /// Idles the instrument and releases the connection.
    async fn disconnect(&mut self) -> AppResult<()>;
}

/// A dependent "measurement" that only waits.
///
/// Used for bias-only runs, where the sources' own records are the result and
/// the dwell sets how long each combination is held.
pub struct DwellMeasurement {
    dwell: Duration,
}

impl DwellMeasurement {
    /// Holds each combination for `dwell`.
    pub fn new(dwell: Duration) -> Self {
        Self { dwell }
    }
}

#[async_trait]
impl DependentInstrument for DwellMeasurement {
    fn name(&self) -> &str {
        "dwell"
    }

    async fn measure(
        &mut self,
        name: &str,
        _params: &MeasurementParams,
    ) -> AppResult<MeasurementArtifact> {
        if !self.dwell.is_zero() {
            tokio::time::sleep(self.dwell).await;
        }
        Ok(MeasurementArtifact {
            name: name.to_string(),
            location: None,
        })
    }

    async fn output_off(&mut self) -> AppResult<()> {
        Ok(())
    }

    async fn disconnect(&mut self) -> AppResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn params_deserialize_from_table() {
        let params: MeasurementParams =
            toml::from_str("if_bandwidth = \"50\"\npoints = \"201\"").unwrap();
        assert_eq!(params.get("if_bandwidth"), Some("50"));
        assert_eq!(params, MeasurementParams::new().with("if_bandwidth", 50).with("points", 201));
    }

    #[tokio::test(start_paused = true)]
    async fn dwell_waits_and_names_artifact() {
        let mut dwell = DwellMeasurement::new(Duration::from_secs(30));
        let start = tokio::time::Instant::now();
        let artifact = dwell.measure("bias_A1V", &MeasurementParams::new()).await.unwrap();

        assert!(start.elapsed() >= Duration::from_secs(30));
        assert_eq!(artifact.name, "bias_A1V");
        assert!(artifact.location.is_none());
    }
}

//! Configuration loading using Figment
//!
//! Settings are read from a TOML file, then overridden by environment
//! variables prefixed with `BIAS_SWEEP_`. Nested keys are separated by a
//! double underscore:
//!
//! ```text
//! BIAS_SWEEP_APPLICATION__LOG_LEVEL=debug
//! BIAS_SWEEP_SWEEP__TEST_NAME=RFTtest
//! BIAS_SWEEP_SWEEP__SETTLE_DELAY_SECS=30
//! ```
//!
//! A minimal file:
//!
//! ```toml
//! [application]
//! name = "bias-sweep"
//! log_level = "info"
//!
//! [storage]
//! local_dir = "data"
//! remote_dir = 'C:\Users\lab\Documents\data'
//!
//! [sweep]
//! test_name = "RFTtest"
//! settle_delay_secs = 5
//!
//! [[bias_sources]]
//! label = "A"
//! resource = "GPIB1::24::INSTR"
//! voltages = [0.0, 1.0]
//!
//! [[bias_sources]]
//! label = "B"
//! resource = "GPIB1::25::INSTR"
//! voltages = { start = 0.0, stop = 4.0, points = 3 }
//!
//! [analyzer]
//! resource = "TCPIP0::10.0.0.5::inst0::INSTR"
//! ports = [1, 2]
//! params = { points = 401, if_bandwidth = 100 }
//! ```

use crate::error::{AppResult, SweepError};
use crate::instrument::network_analyzer::check_ports;
use crate::instrument::MeasurementParams;
use crate::sweep::{AcquisitionMode, SweepPlan};
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Prefix of environment variables that override file settings.
pub const ENV_PREFIX: &str = "BIAS_SWEEP_";

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Application settings
    #[serde(default)]
    pub application: ApplicationConfig,
    /// Where results go
    pub storage: StorageConfig,
    /// Sweep timing and naming
    pub sweep: SweepConfig,
    /// Transport timeouts
    #[serde(default)]
    pub timeouts: TimeoutConfig,
    /// Bias sources, outermost first
    #[serde(default)]
    pub bias_sources: Vec<BiasSourceConfig>,
    /// Dependent network analyzer; without one each combination only dwells
    #[serde(default)]
    pub analyzer: Option<AnalyzerConfig>,
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Application name
    #[serde(default = "default_app_name")]
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: default_app_name(),
            log_level: default_log_level(),
        }
    }
}

/// Output locations
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Local directory for per-source CSV files
    pub local_dir: PathBuf,
    /// Directory on the analyzer's own disk for result files
    #[serde(default)]
    pub remote_dir: String,
}

/// Sweep timing, naming and acquisition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SweepConfig {
    /// Base name of every artifact
    pub test_name: String,
    /// Wait after applying set-points, in seconds
    #[serde(default)]
    pub settle_delay_secs: f64,
    /// Wait at 0 V after each combination, in seconds (0 = none)
    #[serde(default)]
    pub post_measurement_delay_secs: f64,
    /// Progress report period during waits, in seconds
    #[serde(default = "default_progress_interval")]
    pub progress_interval_secs: f64,
    /// Sample period for continuous acquisition; absent = single-point
    #[serde(default)]
    pub sample_interval_secs: Option<f64>,
    /// Hold time per combination when no analyzer is configured, in seconds
    #[serde(default)]
    pub dwell_secs: f64,
    /// Abort on malformed bias-source records instead of skipping them
    #[serde(default = "default_strict")]
    pub strict_record_shape: bool,
    /// Repeat the whole sweep at a fixed interval
    #[serde(default)]
    pub repeat: Option<RepeatConfig>,
}

/// Repetition of the whole sweep
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepeatConfig {
    /// Wait between the end of one run and the start of the next, in seconds
    pub interval_secs: f64,
    /// Number of runs
    pub count: u32,
}

/// Transport timeouts in milliseconds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutConfig {
    /// Default I/O timeout, restored after every long operation
    #[serde(default = "default_io_timeout")]
    pub default_ms: u64,
    /// Bias-source buffer fetch
    #[serde(default = "default_fetch_timeout")]
    pub fetch_ms: u64,
    /// Analyzer sweep and save
    #[serde(default = "default_sweep_timeout")]
    pub sweep_ms: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            default_ms: default_io_timeout(),
            fetch_ms: default_fetch_timeout(),
            sweep_ms: default_sweep_timeout(),
        }
    }
}

/// Set-points of one bias source
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum VoltageSpec {
    /// Explicit list, swept in order
    List(Vec<f64>),
    /// `points` evenly spaced values from `start` to `stop` inclusive
    Linear {
        /// First value
        start: f64,
        /// Last value
        stop: f64,
        /// Number of values
        points: usize,
    },
}

impl VoltageSpec {
    /// Voltages to sweep, in order.
    pub fn values(&self) -> Vec<f64> {
        match *self {
            VoltageSpec::List(ref values) => values.clone(),
            VoltageSpec::Linear { points: 0, .. } => Vec::new(),
            VoltageSpec::Linear { start, points: 1, .. } => vec![start],
            VoltageSpec::Linear {
                start,
                stop,
                points,
            } => {
                let step = (stop - start) / (points - 1) as f64;
                (0..points).map(|i| start + step * i as f64).collect()
            }
        }
    }
}

impl Default for VoltageSpec {
    fn default() -> Self {
        VoltageSpec::List(Vec::new())
    }
}

/// One bias source
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BiasSourceConfig {
    /// Label used in artifact and file names
    pub label: String,
    /// VISA resource string (e.g., "GPIB1::24::INSTR")
    pub resource: String,
    /// Set-points
    #[serde(default)]
    pub voltages: VoltageSpec,
    /// Current compliance in amps
    #[serde(default = "default_compliance")]
    pub compliance_amps: f64,
    /// Largest voltage the protection must allow; defaults to the largest
    /// set-point magnitude
    #[serde(default)]
    pub max_voltage: Option<f64>,
}

impl BiasSourceConfig {
    /// Voltage used to pick the protection level.
    pub fn protection_voltage(&self) -> f64 {
        self.max_voltage.unwrap_or_else(|| {
            self.voltages
                .values()
                .iter()
                .fold(0.0_f64, |acc, v| acc.max(v.abs()))
        })
    }
}

/// A measurement parameter as written in TOML.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    /// Boolean
    Bool(bool),
    /// Integer
    Int(i64),
    /// Float
    Float(f64),
    /// String
    Text(String),
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamValue::Bool(b) => write!(f, "{}", if *b { "ON" } else { "OFF" }),
            ParamValue::Int(i) => write!(f, "{}", i),
            ParamValue::Float(x) => write!(f, "{}", x),
            ParamValue::Text(s) => f.write_str(s),
        }
    }
}

/// Network analyzer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalyzerConfig {
    /// VISA resource string
    pub resource: String,
    /// Ports measured, e.g. `[1, 2]`
    pub ports: Vec<u8>,
    /// Balanced (mixed-mode) measurement on four ports
    #[serde(default)]
    pub balanced: bool,
    /// Forwarded to the analyzer's setup
    #[serde(default)]
    pub params: BTreeMap<String, ParamValue>,
}

impl AnalyzerConfig {
    /// Parameters in the form the analyzer receives them.
    pub fn measurement_params(&self) -> MeasurementParams {
        MeasurementParams(
            self.params
                .iter()
                .map(|(k, v)| (k.clone(), v.to_string()))
                .collect(),
        )
    }
}

// ============================================================================
// Default value functions
// ============================================================================

fn default_app_name() -> String {
    "bias-sweep".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_progress_interval() -> f64 {
    10.0
}

fn default_strict() -> bool {
    true
}

fn default_io_timeout() -> u64 {
    2000
}

fn default_fetch_timeout() -> u64 {
    1_200_000
}

fn default_sweep_timeout() -> u64 {
    450_000
}

fn default_compliance() -> f64 {
    0.1
}

// ============================================================================
// Loading and validation
// ============================================================================

/// Seconds as a `Duration`. Values `validate()` rejects map to zero.
fn secs(value: f64) -> Duration {
    Duration::try_from_secs_f64(value).unwrap_or(Duration::ZERO)
}

fn check_delay(name: &str, value: f64) -> AppResult<()> {
    Duration::try_from_secs_f64(value).map(|_| ()).map_err(|e| {
        SweepError::Configuration(format!(
            "{} must be a non-negative number of seconds, got {} ({})",
            name, value, e
        ))
    })
}

fn check_interval(name: &str, value: f64) -> AppResult<()> {
    match Duration::try_from_secs_f64(value) {
        Ok(d) if !d.is_zero() => Ok(()),
        Ok(_) => Err(SweepError::Configuration(format!(
            "{} must be positive, got {}",
            name, value
        ))),
        Err(e) => Err(SweepError::Configuration(format!(
            "{} must be positive, got {} ({})",
            name, value, e
        ))),
    }
}

impl Settings {
    /// Load settings from `path` and `BIAS_SWEEP_` environment variables,
    /// then validate them.
    ///
    /// Environment variables take precedence over the file.
    pub fn load<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let settings: Self = Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()?;
        settings.validate()?;
        Ok(settings)
    }

    /// Parse and validate settings from a TOML string, without environment
    /// overrides.
    pub fn from_toml_str(toml: &str) -> AppResult<Self> {
        let settings: Self = Figment::from(Toml::string(toml)).extract()?;
        settings.validate()?;
        Ok(settings)
    }

    /// Checks every value that can be checked without hardware.
    pub fn validate(&self) -> AppResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.as_str()) {
            return Err(SweepError::Configuration(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        let sweep = &self.sweep;
        if sweep.test_name.trim().is_empty() {
            return Err(SweepError::Configuration("test_name cannot be empty".into()));
        }
        check_delay("settle_delay_secs", sweep.settle_delay_secs)?;
        check_delay("post_measurement_delay_secs", sweep.post_measurement_delay_secs)?;
        check_delay("dwell_secs", sweep.dwell_secs)?;
        check_interval("progress_interval_secs", sweep.progress_interval_secs)?;
        if let Some(interval) = sweep.sample_interval_secs {
            check_interval("sample_interval_secs", interval)?;
        }
        if let Some(repeat) = &sweep.repeat {
            check_delay("repeat.interval_secs", repeat.interval_secs)?;
            if repeat.count == 0 {
                return Err(SweepError::Configuration(
                    "repeat.count must be at least 1".into(),
                ));
            }
        }

        let timeouts = &self.timeouts;
        if timeouts.default_ms == 0 || timeouts.fetch_ms == 0 || timeouts.sweep_ms == 0 {
            return Err(SweepError::Configuration("timeouts must be > 0 ms".into()));
        }

        let mut labels = HashSet::new();
        for source in &self.bias_sources {
            if source.label.is_empty() {
                return Err(SweepError::Configuration(
                    "bias source label cannot be empty".into(),
                ));
            }
            if !labels.insert(source.label.as_str()) {
                return Err(SweepError::Configuration(format!(
                    "Duplicate bias source label: '{}'",
                    source.label
                )));
            }
            if source.resource.is_empty() {
                return Err(SweepError::Configuration(format!(
                    "bias source '{}': 'resource' cannot be empty",
                    source.label
                )));
            }
            if let VoltageSpec::Linear { points: 0, .. } = source.voltages {
                return Err(SweepError::Configuration(format!(
                    "bias source '{}': 'points' must be > 0",
                    source.label
                )));
            }
            let values = source.voltages.values();
            if values.is_empty() {
                return Err(SweepError::NoVoltages {
                    label: source.label.clone(),
                });
            }
            if values.iter().any(|v| !v.is_finite()) {
                return Err(SweepError::Configuration(format!(
                    "bias source '{}': voltages must be finite",
                    source.label
                )));
            }
            if source.compliance_amps.is_nan() || source.compliance_amps <= 0.0 {
                return Err(SweepError::Configuration(format!(
                    "bias source '{}': compliance_amps must be positive",
                    source.label
                )));
            }
        }

        if let Some(analyzer) = &self.analyzer {
            if analyzer.resource.is_empty() {
                return Err(SweepError::Configuration(
                    "analyzer: 'resource' cannot be empty".into(),
                ));
            }
            check_ports(&analyzer.ports, analyzer.balanced)?;
            if self.storage.remote_dir.is_empty() {
                return Err(SweepError::Configuration(
                    "storage.remote_dir is required with an analyzer".into(),
                ));
            }
        }

        Ok(())
    }

    /// Run parameters for the orchestrator.
    pub fn sweep_plan(&self) -> SweepPlan {
        let sweep = &self.sweep;
        let mut plan = SweepPlan::new(sweep.test_name.clone(), self.storage.local_dir.clone());
        plan.settle_delay = secs(sweep.settle_delay_secs);
        plan.post_measurement_delay = secs(sweep.post_measurement_delay_secs);
        plan.progress_interval = secs(sweep.progress_interval_secs);
        plan.acquisition = match sweep.sample_interval_secs {
            Some(interval) => AcquisitionMode::Continuous {
                sample_interval: secs(interval),
            },
            None => AcquisitionMode::SinglePoint,
        };
        plan.strict_record_shape = sweep.strict_record_shape;
        plan.params = self
            .analyzer
            .as_ref()
            .map(AnalyzerConfig::measurement_params)
            .unwrap_or_default();
        plan
    }

    /// Hold time used in place of an analyzer measurement.
    pub fn dwell(&self) -> Duration {
        secs(self.sweep.dwell_secs)
    }

    /// Interval and count of repeated runs, if configured.
    pub fn repeat(&self) -> Option<(Duration, u32)> {
        self.sweep
            .repeat
            .as_ref()
            .map(|r| (secs(r.interval_secs), r.count))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: &str = r#"
        [storage]
        local_dir = "data"
        remote_dir = 'C:\data'

        [sweep]
        test_name = "RFTtest"
        settle_delay_secs = 2.5

        [[bias_sources]]
        label = "A"
        resource = "GPIB1::24::INSTR"
        voltages = [0.0, 1.0]

        [[bias_sources]]
        label = "B"
        resource = "GPIB1::25::INSTR"
        voltages = { start = 0.0, stop = 4.0, points = 3 }
        compliance_amps = 0.2
    "#;

    fn with_analyzer(extra: &str) -> String {
        format!(
            "{}\n[analyzer]\nresource = \"TCPIP0::10.0.0.5::inst0::INSTR\"\n{}",
            BASE, extra
        )
    }

    #[test]
    fn test_loads_defaults_and_voltage_specs() {
        let settings = Settings::from_toml_str(BASE).unwrap();
        assert_eq!(settings.application.log_level, "info");
        assert_eq!(settings.sweep.progress_interval_secs, 10.0);
        assert!(settings.sweep.strict_record_shape);
        assert_eq!(settings.timeouts.default_ms, 2000);
        assert_eq!(settings.bias_sources[0].voltages.values(), vec![0.0, 1.0]);
        assert_eq!(
            settings.bias_sources[1].voltages.values(),
            vec![0.0, 2.0, 4.0]
        );
        assert_eq!(settings.bias_sources[1].protection_voltage(), 4.0);
        assert!(settings.analyzer.is_none());
    }

    #[test]
    fn test_sweep_plan_from_settings() {
        let toml = with_analyzer("ports = [1, 2]\nparams = { points = 401, avg_mode = \"SWEEP\" }")
            + "\n";
        let settings = Settings::from_toml_str(&toml).unwrap();
        let plan = settings.sweep_plan();
        assert_eq!(plan.test_name, "RFTtest");
        assert_eq!(plan.settle_delay, Duration::from_millis(2500));
        assert_eq!(plan.acquisition, AcquisitionMode::SinglePoint);
        assert_eq!(plan.params.get("points"), Some("401"));
        assert_eq!(plan.params.get("avg_mode"), Some("SWEEP"));
    }

    #[test]
    fn test_continuous_acquisition_and_repeat() {
        let toml = BASE.replace(
            "settle_delay_secs = 2.5",
            "settle_delay_secs = 2.5\nsample_interval_secs = 0.5\nrepeat = { interval_secs = 3600, count = 4 }",
        );
        let settings = Settings::from_toml_str(&toml).unwrap();
        assert_eq!(
            settings.sweep_plan().acquisition,
            AcquisitionMode::Continuous {
                sample_interval: Duration::from_millis(500)
            }
        );
        assert_eq!(settings.repeat(), Some((Duration::from_secs(3600), 4)));
    }

    #[test]
    fn test_empty_voltage_list_names_source() {
        let toml = BASE.replace("voltages = [0.0, 1.0]", "voltages = []");
        let err = Settings::from_toml_str(&toml).unwrap_err();
        assert!(matches!(err, SweepError::NoVoltages { ref label } if label == "A"));
    }

    #[test]
    fn test_zero_points_rejected() {
        let toml = BASE.replace("points = 3", "points = 0");
        let err = Settings::from_toml_str(&toml).unwrap_err();
        assert!(err.to_string().contains("'points' must be > 0"));
    }

    #[test]
    fn test_duplicate_labels_rejected() {
        let toml = BASE.replace("label = \"B\"", "label = \"A\"");
        let err = Settings::from_toml_str(&toml).unwrap_err();
        assert!(err.to_string().contains("Duplicate bias source label"));
    }

    #[test]
    fn test_invalid_log_level() {
        let toml = format!("[application]\nlog_level = \"loud\"\n{}", BASE);
        let err = Settings::from_toml_str(&toml).unwrap_err();
        assert!(err.to_string().contains("Invalid log_level"));
    }

    #[test]
    fn test_negative_delay_rejected() {
        let toml = BASE.replace("settle_delay_secs = 2.5", "settle_delay_secs = -1");
        assert!(Settings::from_toml_str(&toml).unwrap_err().is_configuration());
    }

    #[test]
    fn test_delay_too_large_for_duration_rejected() {
        let toml = BASE.replace("settle_delay_secs = 2.5", "settle_delay_secs = 1e30");
        assert!(Settings::from_toml_str(&toml).unwrap_err().is_configuration());

        let toml = BASE.replace(
            "settle_delay_secs = 2.5",
            "settle_delay_secs = 2.5\nsample_interval_secs = 1e300",
        );
        assert!(Settings::from_toml_str(&toml).unwrap_err().is_configuration());

        let toml = BASE.replace(
            "settle_delay_secs = 2.5",
            "settle_delay_secs = 2.5\nprogress_interval_secs = 0",
        );
        assert!(Settings::from_toml_str(&toml).unwrap_err().is_configuration());

        let toml = BASE.replace(
            "settle_delay_secs = 2.5",
            "settle_delay_secs = 2.5\n[sweep.repeat]\ninterval_secs = 1e25\ncount = 2",
        );
        assert!(Settings::from_toml_str(&toml).unwrap_err().is_configuration());
    }

    #[test]
    fn test_validated_settings_convert_delays() {
        let toml = BASE.replace("settle_delay_secs = 2.5", "settle_delay_secs = 1e9\ndwell_secs = 0.25");
        let settings = Settings::from_toml_str(&toml).unwrap();
        assert_eq!(settings.sweep_plan().settle_delay, Duration::from_secs(1_000_000_000));
        assert_eq!(settings.dwell(), Duration::from_millis(250));
    }

    #[test]
    fn test_analyzer_port_rules() {
        assert!(Settings::from_toml_str(&with_analyzer("ports = [1, 2, 3, 4, 5]")).is_err());
        assert!(Settings::from_toml_str(&with_analyzer("ports = []")).is_err());
        assert!(Settings::from_toml_str(&with_analyzer("ports = [1, 2]\nbalanced = true")).is_err());
        assert!(Settings::from_toml_str(&with_analyzer("ports = [1, 2, 3, 4]\nbalanced = true")).is_ok());
    }

    #[test]
    fn test_linear_spec_single_point() {
        let spec = VoltageSpec::Linear {
            start: 1.5,
            stop: 9.0,
            points: 1,
        };
        assert_eq!(spec.values(), vec![1.5]);
    }

    #[test]
    fn test_env_overrides_file() {
        figment::Jail::expect_with(|jail| {
            jail.create_file("sweep.toml", BASE)?;
            jail.set_env("BIAS_SWEEP_SWEEP__TEST_NAME", "override");
            jail.set_env("BIAS_SWEEP_APPLICATION__LOG_LEVEL", "debug");

            let settings = Settings::load("sweep.toml").map_err(|e| e.to_string())?;
            assert_eq!(settings.sweep.test_name, "override");
            assert_eq!(settings.application.log_level, "debug");
            Ok(())
        });
    }

    #[test]
    fn test_missing_file_section_is_error() {
        figment::Jail::expect_with(|jail| {
            jail.create_file("broken.toml", "[storage]\nlocal_dir = \"data\"\n")?;
            assert!(matches!(
                Settings::load("broken.toml"),
                Err(SweepError::Figment(_))
            ));
            Ok(())
        });
    }
}

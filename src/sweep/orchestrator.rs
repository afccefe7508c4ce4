//! Nested bias sweep with one dependent measurement per combination.
//!
//! For every point of the grid formed by the sources' voltage sequences the
//! orchestrator applies all set-points, settles, triggers the dependent
//! instrument, then collects each source's record and appends it to that
//! source's CSV. All instrument calls are awaited one after another; nothing
//! runs concurrently.
//!
//! Whatever happens, every source gets exactly one `output_off` when the run
//! ends. A failed run drives all instruments to their safe state and returns
//! the original error; files written for completed combinations are kept.

use crate::data::{format_record, CsvRecordWriter, MeasurementRecord};
use crate::error::{AppResult, SweepError};
use crate::instrument::{BiasSource, DependentInstrument, MeasurementArtifact, MeasurementParams};
use crate::metadata::RunMetadataBuilder;
use crate::sweep::grid::{combinations, BiasCombination, SweepAxis};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// How bias sources acquire their records.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum AcquisitionMode {
    /// Sampling starts before the settle delay and stops after the dependent
    /// measurement, so the record covers the whole measurement window.
    Continuous {
        /// Time between samples.
        sample_interval: Duration,
    },
    /// One reading per source after the dependent measurement.
    SinglePoint,
}

/// Everything a run needs besides the instruments.
#[derive(Debug, Clone)]
pub struct SweepPlan {
    /// Base name for artifacts and CSV files.
    pub test_name: String,
    /// Wait between applying set-points and measuring.
    pub settle_delay: Duration,
    /// Wait with all sources at 0 V after each combination. Zero skips both
    /// the wait and the zeroing.
    pub post_measurement_delay: Duration,
    /// How often long waits report progress.
    pub progress_interval: Duration,
    /// Bias-source acquisition mode.
    pub acquisition: AcquisitionMode,
    /// Treat malformed records as fatal instead of skipping them.
    pub strict_record_shape: bool,
    /// Directory receiving one CSV per source.
    pub local_dir: PathBuf,
    /// Forwarded untouched to the dependent instrument.
    pub params: MeasurementParams,
}

impl SweepPlan {
    /// Plan with no delays, single-point acquisition and strict records.
    pub fn new(test_name: impl Into<String>, local_dir: impl Into<PathBuf>) -> Self {
        Self {
            test_name: test_name.into(),
            settle_delay: Duration::ZERO,
            post_measurement_delay: Duration::ZERO,
            progress_interval: Duration::from_secs(10),
            acquisition: AcquisitionMode::SinglePoint,
            strict_record_shape: true,
            local_dir: local_dir.into(),
            params: MeasurementParams::new(),
        }
    }
}

/// A bias source together with the voltages it steps through.
pub struct BiasChannel {
    /// The instrument.
    pub source: Box<dyn BiasSource>,
    /// Set-points in sweep order. Must not be empty.
    pub voltages: Vec<f64>,
}

/// Outcome of one visited combination.
#[derive(Debug, Clone, Serialize)]
pub struct CombinationResult {
    /// The applied set-points.
    pub combination: BiasCombination,
    /// Artifact identifier.
    pub name: String,
    /// What the dependent instrument produced.
    pub artifact: MeasurementArtifact,
}

/// Records accumulated by one source over a run.
#[derive(Debug, Clone)]
pub struct SourceRecord {
    /// Source label.
    pub label: String,
    /// CSV the record was persisted to.
    pub path: PathBuf,
    /// All samples, in visitation order.
    pub record: MeasurementRecord,
}

/// Summary of a completed run.
#[derive(Debug, Clone)]
pub struct SweepReport {
    /// Base name the run used.
    pub test_name: String,
    /// When the run started.
    pub started_at: DateTime<Utc>,
    /// Visited combinations, in order.
    pub combinations: Vec<CombinationResult>,
    /// One entry per source, in source order.
    pub records: Vec<SourceRecord>,
}

impl SweepReport {
    /// Accumulated record for `label`.
    pub fn record(&self, label: &str) -> Option<&MeasurementRecord> {
        self.records
            .iter()
            .find(|r| r.label == label)
            .map(|r| &r.record)
    }
}

/// Per-run mutable state, kept outside the orchestrator so a failed run can
/// still be unwound with `&mut self`.
struct RunState {
    writers: Vec<CsvRecordWriter>,
    records: Vec<MeasurementRecord>,
    combinations: Vec<CombinationResult>,
}

/// Drives N bias sources through their voltage grid and one dependent
/// instrument once per grid point.
pub struct SweepOrchestrator {
    plan: SweepPlan,
    channels: Vec<BiasChannel>,
    dependent: Box<dyn DependentInstrument>,
}

impl SweepOrchestrator {
    /// Orchestrator with no bias sources yet.
    pub fn new(plan: SweepPlan, dependent: Box<dyn DependentInstrument>) -> Self {
        Self {
            plan,
            channels: Vec::new(),
            dependent,
        }
    }

    /// Appends a source. Sources are enumerated in the order they are added,
    /// the first one outermost.
    pub fn with_source(mut self, source: Box<dyn BiasSource>, voltages: Vec<f64>) -> Self {
        self.channels.push(BiasChannel { source, voltages });
        self
    }

    /// The run parameters.
    pub fn plan(&self) -> &SweepPlan {
        &self.plan
    }

    /// Base name used by the next run.
    pub fn test_name(&self) -> &str {
        &self.plan.test_name
    }

    /// Replaces the base name used by the next run.
    pub fn set_test_name(&mut self, name: impl Into<String>) {
        self.plan.test_name = name.into();
    }

    /// Number of combinations a run visits.
    pub fn combination_count(&self) -> usize {
        self.channels.iter().map(|c| c.voltages.len()).product()
    }

    /// Names of the artifacts a run produces, in order. Touches no hardware.
    pub fn planned_artifacts(&self) -> Vec<String> {
        let axes = self.axes();
        combinations(&axes)
            .map(|c| c.artifact_name(&self.plan.test_name))
            .collect()
    }

    fn axes(&self) -> Vec<SweepAxis> {
        self.channels
            .iter()
            .map(|c| SweepAxis::new(c.source.label(), c.voltages.clone()))
            .collect()
    }

    /// Checks every source has a unique label and set-points, and that the
    /// dependent instrument accepts the measurement parameters. Touches no
    /// hardware and no files.
    pub fn check_preconditions(&self) -> AppResult<()> {
        let mut labels = HashSet::new();
        for channel in &self.channels {
            let label = channel.source.label();
            if !labels.insert(label) {
                return Err(SweepError::Configuration(format!(
                    "Duplicate bias source label: '{}'",
                    label
                )));
            }
        }
        if let Some(empty) = self.channels.iter().find(|c| c.voltages.is_empty()) {
            return Err(SweepError::NoVoltages {
                label: empty.source.label().to_string(),
            });
        }
        self.dependent.validate(&self.plan.params)
    }

    /// Runs the full sweep.
    ///
    /// On success every source has been turned off once; if turning them off
    /// fails the errors are returned as `ShutdownFailed`. On failure the
    /// original error is returned after the safe-off sequence.
    pub async fn run(&mut self) -> AppResult<SweepReport> {
        self.check_preconditions()?;

        let started_at = Utc::now();
        let mut state = RunState {
            writers: Vec::with_capacity(self.channels.len()),
            records: vec![MeasurementRecord::new(); self.channels.len()],
            combinations: Vec::new(),
        };

        let result = self.execute(started_at, &mut state).await;
        let off_errors = self.all_outputs_off().await;

        match result {
            Ok(()) => {
                if !off_errors.is_empty() {
                    return Err(SweepError::ShutdownFailed(off_errors));
                }
                info!(
                    test = %self.plan.test_name,
                    combinations = state.combinations.len(),
                    "Sweep complete"
                );
                Ok(self.report(started_at, state))
            }
            Err(err) => {
                error!(test = %self.plan.test_name, "Sweep aborted: {}", err);
                for off_err in &off_errors {
                    error!("Safe shutdown step failed: {}", off_err);
                }
                self.log_instrument_errors().await;
                Err(err)
            }
        }
    }

    async fn execute(&mut self, started_at: DateTime<Utc>, state: &mut RunState) -> AppResult<()> {
        let plan = self.plan.clone();

        for channel in &self.channels {
            let metadata = RunMetadataBuilder::new()
                .run_name(&plan.test_name)
                .source_label(channel.source.label())
                .voltages(&channel.voltages)
                .started_at(started_at)
                .parameter("settle_delay_secs", plan.settle_delay.as_secs_f64().into())
                .parameter(
                    "post_measurement_delay_secs",
                    plan.post_measurement_delay.as_secs_f64().into(),
                )
                .parameter("acquisition", acquisition_json(plan.acquisition))
                .parameter("dependent", self.dependent.name().into())
                .parameter("measurement_params", serde_json::to_value(&plan.params)?)
                .build();
            state
                .writers
                .push(CsvRecordWriter::create(&plan.local_dir, &metadata)?);
        }

        for channel in &mut self.channels {
            channel.source.reset_elapsed_time().await?;
        }

        let axes = self.axes();
        let total = self.combination_count();
        info!(
            test = %plan.test_name,
            sources = self.channels.len(),
            total,
            "Starting sweep"
        );

        for combination in combinations(&axes) {
            let name = combination.artifact_name(&plan.test_name);
            info!(
                combination = combination.index + 1,
                total,
                artifact = %name,
                "Applying bias"
            );

            for (channel, setpoint) in self.channels.iter_mut().zip(&combination.setpoints) {
                channel.source.set_voltage(setpoint.volts).await?;
                info!(source = %setpoint.label, voltage = setpoint.volts, "Bias set");
            }

            if let AcquisitionMode::Continuous { sample_interval } = plan.acquisition {
                for channel in &mut self.channels {
                    channel.source.start_measurement(sample_interval).await?;
                }
            }

            wait_with_progress(plan.settle_delay, plan.progress_interval, "settle").await;

            let artifact = self.dependent.measure(&name, &plan.params).await?;
            debug!(artifact = %name, location = ?artifact.location, "Dependent measurement done");

            // Every record is formatted before any is persisted, so a strict
            // shape failure leaves no partial rows for this combination.
            let mut collected = Vec::with_capacity(self.channels.len());
            for (i, channel) in self.channels.iter_mut().enumerate() {
                let raw = match plan.acquisition {
                    AcquisitionMode::Continuous { .. } => channel.source.stop_measurement().await?,
                    AcquisitionMode::SinglePoint => channel.source.measure_once().await?,
                };
                match format_record(&raw) {
                    Ok(record) => collected.push((i, record)),
                    Err(err @ SweepError::DataShape { .. }) if !plan.strict_record_shape => {
                        warn!(
                            source = %channel.source.label(),
                            artifact = %name,
                            "Skipping malformed record: {}", err
                        );
                    }
                    Err(err) => return Err(err),
                }
            }
            for (i, record) in collected {
                state.writers[i].append(&record)?;
                state.records[i].append(record);
            }

            state.combinations.push(CombinationResult {
                combination,
                name,
                artifact,
            });

            if !plan.post_measurement_delay.is_zero() {
                for channel in &mut self.channels {
                    channel.source.set_voltage(0.0).await?;
                }
                wait_with_progress(
                    plan.post_measurement_delay,
                    plan.progress_interval,
                    "post-measurement",
                )
                .await;
            }
        }
        Ok(())
    }

    /// `output_off` once per source and once for the dependent instrument,
    /// collecting failures instead of stopping at the first.
    async fn all_outputs_off(&mut self) -> Vec<SweepError> {
        let mut errors = Vec::new();
        for channel in &mut self.channels {
            if let Err(err) = channel.source.output_off().await {
                warn!(source = %channel.source.label(), "Failed to turn output off: {}", err);
                errors.push(err);
            }
        }
        if let Err(err) = self.dependent.output_off().await {
            warn!(instrument = %self.dependent.name(), "Failed to hold: {}", err);
            errors.push(err);
        }
        errors
    }

    async fn log_instrument_errors(&mut self) {
        for channel in &mut self.channels {
            let entry = channel.source.read_error().await;
            match entry {
                Ok(Some(entry)) => error!(source = %channel.source.label(), "Instrument error: {}", entry),
                Ok(None) => {}
                Err(err) => debug!(source = %channel.source.label(), "Could not read error queue: {}", err),
            }
        }
    }

    fn report(&self, started_at: DateTime<Utc>, state: RunState) -> SweepReport {
        let records = self
            .channels
            .iter()
            .zip(state.writers)
            .zip(state.records)
            .map(|((channel, writer), record)| SourceRecord {
                label: channel.source.label().to_string(),
                path: writer.path().to_path_buf(),
                record,
            })
            .collect();
        SweepReport {
            test_name: self.plan.test_name.clone(),
            started_at,
            combinations: state.combinations,
            records,
        }
    }

    /// Disconnects every source and the dependent instrument.
    pub async fn shutdown(&mut self) -> AppResult<()> {
        info!("Shutting down instruments");
        let mut errors = Vec::new();
        for channel in &mut self.channels {
            if let Err(err) = channel.source.disconnect().await {
                error!(source = %channel.source.label(), "Failed to disconnect: {}", err);
                errors.push(err);
            }
        }
        if let Err(err) = self.dependent.disconnect().await {
            error!(instrument = %self.dependent.name(), "Failed to disconnect: {}", err);
            errors.push(err);
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(SweepError::ShutdownFailed(errors))
        }
    }
}

fn acquisition_json(mode: AcquisitionMode) -> serde_json::Value {
    match mode {
        AcquisitionMode::Continuous { sample_interval } => serde_json::json!({
            "mode": "continuous",
            "sample_interval_secs": sample_interval.as_secs_f64(),
        }),
        AcquisitionMode::SinglePoint => serde_json::json!({ "mode": "single_point" }),
    }
}

/// Sleeps for `total`, logging the remaining time every `interval`.
pub async fn wait_with_progress(total: Duration, interval: Duration, what: &str) {
    if total.is_zero() {
        return;
    }
    let step = if interval.is_zero() { total } else { interval };
    let deadline = Instant::now() + total;
    info!("Waiting {:.1} s ({})", total.as_secs_f64(), what);
    loop {
        let now = Instant::now();
        if now >= deadline {
            break;
        }
        tokio::time::sleep(step.min(deadline - now)).await;
        let left = deadline.saturating_duration_since(Instant::now());
        if !left.is_zero() {
            info!("{:.0} s remaining ({})", left.as_secs_f64(), what);
        }
    }
}

//! Simulated instruments that generate synthetic data.
//!
//! `MockBiasSource` and `MockAnalyzer` implement the capability traits without
//! any transport. Every call is appended to a shared [`EventLog`] so tests can
//! check the interleaving of calls across instruments, and each operation can
//! be made to fail on its n-th call.

use crate::error::{AppResult, SweepError};
use crate::instrument::{BiasSource, DependentInstrument, MeasurementArtifact, MeasurementParams};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tracing::info;

/// Ordered log of instrument calls shared by several mocks.
#[derive(Clone, Default)]
pub struct EventLog {
    events: Arc<Mutex<Vec<String>>>,
}

impl EventLog {
    /// Empty log.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<String>> {
        self.events.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Appends an event.
    pub fn record(&self, event: impl Into<String>) {
        self.lock().push(event.into());
    }

    /// Snapshot of every event so far.
    pub fn events(&self) -> Vec<String> {
        self.lock().clone()
    }

    /// Number of events equal to `event`.
    pub fn count(&self, event: &str) -> usize {
        self.lock().iter().filter(|e| *e == event).count()
    }

    /// Events starting with `prefix`, in order.
    pub fn matching(&self, prefix: &str) -> Vec<String> {
        self.lock()
            .iter()
            .filter(|e| e.starts_with(prefix))
            .cloned()
            .collect()
    }
}

/// Counts calls per operation and fails the ones scheduled to fail.
#[derive(Default)]
struct FailurePlan {
    calls: HashMap<&'static str, usize>,
    fail_at: HashMap<&'static str, usize>,
}

impl FailurePlan {
    fn check(&mut self, who: &str, op: &'static str) -> AppResult<()> {
        let n = {
            let calls = self.calls.entry(op).or_insert(0);
            *calls += 1;
            *calls
        };
        if self.fail_at.get(op) == Some(&n) {
            return Err(SweepError::communication(
                who,
                format!("simulated failure on {} call {}", op, n),
            ));
        }
        Ok(())
    }
}

/// Simulated SMU.
///
/// Current is derived from the set voltage through a fixed load resistance;
/// time is taken from the Tokio clock, so paused-clock tests see exact values.
pub struct MockBiasSource {
    label: String,
    log: EventLog,
    load_ohms: f64,
    samples_per_record: usize,
    raw_override: Option<String>,
    voltage: f64,
    sample_interval: Duration,
    time_origin: Instant,
    failures: FailurePlan,
}

impl MockBiasSource {
    /// New source writing to `log`, with a 1 MΩ load and one sample per record.
    pub fn new(label: impl Into<String>, log: EventLog) -> Self {
        Self {
            label: label.into(),
            log,
            load_ohms: 1.0e6,
            samples_per_record: 1,
            raw_override: None,
            voltage: 0.0,
            sample_interval: Duration::from_secs(1),
            time_origin: Instant::now(),
            failures: FailurePlan::default(),
        }
    }

    /// Number of samples returned by `stop_measurement`.
    pub fn with_samples(mut self, samples: usize) -> Self {
        self.samples_per_record = samples.max(1);
        self
    }

    /// Returns `raw` from every read instead of synthetic data.
    pub fn with_raw_record(mut self, raw: impl Into<String>) -> Self {
        self.raw_override = Some(raw.into());
        self
    }

    /// Makes the `call`-th (1-based) invocation of `op` fail with a
    /// communication error. `op` is the trait method name, e.g. `"set_voltage"`.
    pub fn fail_at(mut self, op: &'static str, call: usize) -> Self {
        self.failures.fail_at.insert(op, call);
        self
    }

    fn event(&self, what: &str) {
        self.log.record(format!("{}:{}", self.label, what));
    }

    fn synthesize(&self, samples: usize) -> String {
        if let Some(raw) = &self.raw_override {
            return raw.clone();
        }
        let elapsed = self.time_origin.elapsed().as_secs_f64();
        let current = self.voltage / self.load_ohms;
        (0..samples)
            .map(|k| {
                let t = elapsed + k as f64 * self.sample_interval.as_secs_f64();
                format!("{},{},{},{},{}", self.voltage, current, self.load_ohms, t, 0)
            })
            .collect::<Vec<_>>()
            .join(",")
    }
}

#[async_trait]
impl BiasSource for MockBiasSource {
    fn label(&self) -> &str {
        &self.label
    }

    async fn set_voltage(&mut self, volts: f64) -> AppResult<()> {
        self.event(&format!("set_voltage {}", volts));
        self.failures.check(&self.label, "set_voltage")?;
        self.voltage = volts;
        Ok(())
    }

    async fn start_measurement(&mut self, sample_interval: Duration) -> AppResult<()> {
        self.event("start_measurement");
        self.failures.check(&self.label, "start_measurement")?;
        self.sample_interval = sample_interval;
        Ok(())
    }

    async fn stop_measurement(&mut self) -> AppResult<String> {
        self.event("stop_measurement");
        self.failures.check(&self.label, "stop_measurement")?;
        Ok(self.synthesize(self.samples_per_record))
    }

    async fn measure_once(&mut self) -> AppResult<String> {
        self.event("measure_once");
        self.failures.check(&self.label, "measure_once")?;
        Ok(self.synthesize(1))
    }

    async fn output_off(&mut self) -> AppResult<()> {
        self.event("output_off");
        self.failures.check(&self.label, "output_off")?;
        self.voltage = 0.0;
        Ok(())
    }

    async fn reset_elapsed_time(&mut self) -> AppResult<()> {
        self.event("reset_elapsed_time");
        self.failures.check(&self.label, "reset_elapsed_time")?;
        self.time_origin = Instant::now();
        Ok(())
    }

    async fn disconnect(&mut self) -> AppResult<()> {
        self.event("disconnect");
        self.voltage = 0.0;
        Ok(())
    }
}

/// Simulated network analyzer.
///
/// With an output directory set, each measurement writes a small Touchstone
/// stub named after the artifact so file-retention behaviour can be checked.
pub struct MockAnalyzer {
    name: String,
    log: EventLog,
    output_dir: Option<PathBuf>,
    ports: usize,
    measure_time: Duration,
    validation_error: Option<String>,
    failures: FailurePlan,
}

impl MockAnalyzer {
    /// Two-port analyzer writing to `log`.
    pub fn new(log: EventLog) -> Self {
        Self {
            name: "analyzer".to_string(),
            log,
            output_dir: None,
            ports: 2,
            measure_time: Duration::ZERO,
            validation_error: None,
            failures: FailurePlan::default(),
        }
    }

    /// Writes result files into `dir`.
    pub fn with_output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.output_dir = Some(dir.into());
        self
    }

    /// Number of ports, which sets the result file extension.
    pub fn with_ports(mut self, ports: usize) -> Self {
        self.ports = ports;
        self
    }

    /// Simulated sweep duration.
    pub fn with_measure_time(mut self, duration: Duration) -> Self {
        self.measure_time = duration;
        self
    }

    /// Makes the `call`-th (1-based) measurement fail with a communication error.
    pub fn fail_on_measure(mut self, call: usize) -> Self {
        self.failures.fail_at.insert("measure", call);
        self
    }

    /// Makes `validate` reject every parameter set with `message`.
    pub fn reject_params(mut self, message: impl Into<String>) -> Self {
        self.validation_error = Some(message.into());
        self
    }

    fn event(&self, what: &str) {
        self.log.record(format!("{}:{}", self.name, what));
    }
}

#[async_trait]
impl DependentInstrument for MockAnalyzer {
    fn name(&self) -> &str {
        &self.name
    }

    fn validate(&self, _params: &MeasurementParams) -> AppResult<()> {
        match &self.validation_error {
            Some(message) => Err(SweepError::Configuration(message.clone())),
            None => Ok(()),
        }
    }

    async fn measure(
        &mut self,
        name: &str,
        _params: &MeasurementParams,
    ) -> AppResult<MeasurementArtifact> {
        self.event(&format!("measure {}", name));
        self.failures.check(&self.name, "measure")?;
        if !self.measure_time.is_zero() {
            tokio::time::sleep(self.measure_time).await;
        }

        let location = match &self.output_dir {
            Some(dir) => {
                std::fs::create_dir_all(dir)?;
                let path = dir.join(format!("{}.s{}p", name, self.ports));
                std::fs::write(&path, "! simulated sweep\n# GHz S RI R 50\n")?;
                info!(analyzer = %self.name, artifact = %path.display(), "Saved simulated sweep");
                Some(path.display().to_string())
            }
            None => None,
        };
        Ok(MeasurementArtifact {
            name: name.to_string(),
            location,
        })
    }

    async fn output_off(&mut self) -> AppResult<()> {
        self.event("output_off");
        Ok(())
    }

    async fn disconnect(&mut self) -> AppResult<()> {
        self.event("disconnect");
        Ok(())
    }
}

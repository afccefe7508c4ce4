//! Generic SCPI source-measure unit used as a bias source.
//!
//! The command set follows the common 2400-style SMU dialect: the unit forces
//! voltage, senses current, and buffers `VOLT, CURR, RES, TIME, STAT` per
//! trigger. `configure` performs the compliance/range/zero phase that must
//! precede any sweep.

use crate::adapters::ScpiTransport;
use crate::error::{AppResult, SweepError};
use crate::instrument::BiasSource;
use async_trait::async_trait;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Selectable over-voltage protection levels, in volts.
pub const VOLTAGE_PROTECTION_LIMITS: [u32; 6] = [20, 40, 60, 80, 120, 160];

/// Largest number of readings the SMU buffers per acquisition.
pub const MAX_BUFFERED_READINGS: u32 = 2500;

/// Longest trigger delay the SMU accepts, in seconds.
pub const MAX_TRIGGER_DELAY_S: f64 = 999.9999;

/// Smallest protection level that still allows `max_voltage`, or `None` when
/// protection must be disabled.
pub fn protection_level(max_voltage: f64) -> Option<u32> {
    VOLTAGE_PROTECTION_LIMITS
        .iter()
        .copied()
        .find(|&limit| max_voltage.abs() <= f64::from(limit))
}

/// SCPI source-measure unit.
pub struct ScpiSmu {
    label: String,
    transport: Box<dyn ScpiTransport>,
    fetch_timeout: Duration,
}

impl ScpiSmu {
    /// Wraps an open transport.
    pub fn new(label: impl Into<String>, transport: Box<dyn ScpiTransport>) -> Self {
        Self {
            label: label.into(),
            transport,
            fetch_timeout: Duration::from_secs(1200),
        }
    }

    /// Timeout used while fetching buffered readings.
    pub fn with_fetch_timeout(mut self, timeout: Duration) -> Self {
        self.fetch_timeout = timeout;
        self
    }

    /// Configures voltage sourcing with compliance, then zeroes the output.
    ///
    /// `max_voltage` picks the over-voltage protection level; `compliance` is
    /// the current limit in amps.
    pub async fn configure(&mut self, max_voltage: f64, compliance: f64) -> AppResult<()> {
        if compliance.is_nan() || compliance <= 0.0 {
            return Err(SweepError::Configuration(format!(
                "compliance for '{}' must be positive, got {}",
                self.label, compliance
            )));
        }

        let t = &self.transport;
        t.write("SOURce:FUNCtion:MODE VOLTage").await?;
        t.write("SOURce:VOLTage:RANGe:AUTO 1").await?;
        t.write("SOURce:VOLTage 0").await?;
        match protection_level(max_voltage) {
            Some(level) => {
                t.write(&format!("SOURce:VOLTage:PROTection:LEVel {}", level))
                    .await?
            }
            None => {
                warn!(
                    source = %self.label,
                    "Requested {} V exceeds 160 V, disabling voltage protection", max_voltage
                );
                t.write("SOURce:VOLTage:PROTection:LEVel NONE").await?
            }
        }
        t.write(&format!(":SENSe:CURRent:PROTection:LEVel {}", compliance))
            .await?;
        t.write(":FORMat:ELEMents VOLTage, CURRent, RESistance, TIME, STATus")
            .await?;

        info!(source = %self.label, max_voltage, compliance, "SMU configured");
        Ok(())
    }
}

#[async_trait]
impl BiasSource for ScpiSmu {
    fn label(&self) -> &str {
        &self.label
    }

    async fn set_voltage(&mut self, volts: f64) -> AppResult<()> {
        let t = &self.transport;
        t.write(&format!("SOURce:VOLTage {}", volts)).await?;
        t.write(":CONFigure:VOLTage:DC").await?;
        t.query("*OPC?").await?;
        t.write(":SENSe:FUNCtion:ON \"CURRent\"").await?;
        debug!(source = %self.label, voltage = volts, "Voltage set");
        Ok(())
    }

    async fn start_measurement(&mut self, sample_interval: Duration) -> AppResult<()> {
        let delay = sample_interval.as_secs_f64();
        if delay > MAX_TRIGGER_DELAY_S {
            return Err(SweepError::Configuration(format!(
                "sample interval {} s for '{}' exceeds {} s",
                delay, self.label, MAX_TRIGGER_DELAY_S
            )));
        }

        let t = &self.transport;
        t.write(":ARM:COUNt 1").await?;
        t.write(&format!(":TRIGger:COUNt {}", MAX_BUFFERED_READINGS))
            .await?;
        t.write(&format!(":TRIGger:DELay {}", delay)).await?;
        t.write(":INITiate").await
    }

    async fn stop_measurement(&mut self) -> AppResult<String> {
        self.transport.write(":ABORt").await?;
        self.transport
            .query_with_timeout("FETCh?", self.fetch_timeout)
            .await
    }

    async fn measure_once(&mut self) -> AppResult<String> {
        self.transport.write(":ARM:COUNt 1").await?;
        self.transport.write(":TRIGger:COUNt 1").await?;
        self.transport
            .query_with_timeout("READ?", self.fetch_timeout)
            .await
    }

    async fn output_off(&mut self) -> AppResult<()> {
        self.transport.write("SOURce:VOLTage 0").await?;
        self.transport.write(":OUTPut:STATe OFF").await
    }

    async fn reset_elapsed_time(&mut self) -> AppResult<()> {
        self.transport.write(":SYSTem:TIME:RESet").await
    }

    async fn read_error(&mut self) -> AppResult<Option<String>> {
        let entry = self.transport.query("SYSTem:ERRor:NEXT?").await?;
        if entry.is_empty() || entry.starts_with("0,") || entry.starts_with("+0,") {
            Ok(None)
        } else {
            Ok(Some(entry))
        }
    }

    async fn disconnect(&mut self) -> AppResult<()> {
        self.output_off().await?;
        // Return the front panel to local control.
        self.transport.write(":SYSTem:KEY 23").await?;
        self.transport.close().await
    }
}

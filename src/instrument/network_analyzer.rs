//! Generic SCPI vector network analyzer used as the dependent instrument.
//!
//! One `measure` call defines an S-parameter trace for every ordered port pair,
//! runs a single sweep and saves a Touchstone `{name}.s{N}p` on the analyzer's
//! own disk. The trigger is put back on hold afterwards.

use crate::adapters::ScpiTransport;
use crate::error::{AppResult, SweepError};
use crate::instrument::{DependentInstrument, MeasurementArtifact, MeasurementParams};
use async_trait::async_trait;
use std::time::Duration;
use tracing::{debug, info};

/// Highest physical port number.
pub const MAX_PORTS: u8 = 4;

/// Reply of the active-calset query when no calibration is applied.
const NO_CALSET: &str = "No Calset Selected";

/// Mixed-mode parameter for the balanced port pair `(i, j)`, 1-based.
const BALANCED_PARAMETERS: [[&str; 4]; 4] = [
    ["SDD11", "SDD12", "SDC11", "SDC12"],
    ["SDD21", "SDD22", "SDC21", "SDC22"],
    ["SCD11", "SCD12", "SCC11", "SCC12"],
    ["SCD21", "SCD22", "SCC21", "SCC22"],
];

/// Measurement parameters the analyzer understands, with the command each one
/// sets.
const SETUP_COMMANDS: [(&str, &str); 8] = [
    ("points", "SENSe1:SWEep:POINts"),
    ("start_freq", "SENSe1:FREQuency:STARt"),
    ("stop_freq", "SENSe1:FREQuency:STOP"),
    ("center_freq", "SENSe1:FREQuency:CENTer"),
    ("span_freq", "SENSe1:FREQuency:SPAN"),
    ("avg_mode", "SENSe1:AVERage:MODE"),
    ("avg_count", "SENSe1:AVERage:COUNt"),
    ("if_bandwidth", "SENSe1:BANDwidth"),
];

/// Checks a port list: 1 to 4 distinct ports numbered 1..=4, and exactly four
/// for balanced measurements.
pub fn check_ports(ports: &[u8], balanced: bool) -> AppResult<()> {
    if ports.is_empty() || ports.len() > usize::from(MAX_PORTS) {
        return Err(SweepError::Configuration(format!(
            "specify between 1 and {} analyzer ports, got {}",
            MAX_PORTS,
            ports.len()
        )));
    }
    if let Some(bad) = ports.iter().find(|&&p| p == 0 || p > MAX_PORTS) {
        return Err(SweepError::Configuration(format!(
            "analyzer port {} does not exist",
            bad
        )));
    }
    for (i, port) in ports.iter().enumerate() {
        if ports[..i].contains(port) {
            return Err(SweepError::Configuration(format!(
                "analyzer port {} listed twice",
                port
            )));
        }
    }
    if balanced && ports.len() != usize::from(MAX_PORTS) {
        return Err(SweepError::Configuration(format!(
            "balanced measurement needs {} ports, got {}",
            MAX_PORTS,
            ports.len()
        )));
    }
    Ok(())
}

/// SCPI network analyzer.
pub struct ScpiNetworkAnalyzer {
    name: String,
    transport: Box<dyn ScpiTransport>,
    ports: Vec<u8>,
    balanced: bool,
    remote_dir: String,
    sweep_timeout: Duration,
}

impl ScpiNetworkAnalyzer {
    /// Wraps an open transport. Results are saved under `remote_dir` on the
    /// analyzer.
    pub fn new(
        name: impl Into<String>,
        transport: Box<dyn ScpiTransport>,
        ports: Vec<u8>,
        balanced: bool,
        remote_dir: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            transport,
            ports,
            balanced,
            remote_dir: remote_dir.into(),
            sweep_timeout: Duration::from_secs(450),
        }
    }

    /// Timeout used while waiting for a sweep or a save to complete.
    pub fn with_sweep_timeout(mut self, timeout: Duration) -> Self {
        self.sweep_timeout = timeout;
        self
    }

    /// Touchstone file name for `name`.
    pub fn file_name(&self, name: &str) -> String {
        format!("{}.s{}p", name, self.ports.len())
    }

    fn port_list(&self) -> String {
        self.ports
            .iter()
            .map(u8::to_string)
            .collect::<Vec<_>>()
            .join(",")
    }

    /// Returns the active calibration set, failing when none is selected.
    pub async fn check_calibration(&self) -> AppResult<String> {
        let reply = self
            .transport
            .query("SENSe1:CORRection:CSET:ACTivate? NAME")
            .await?;
        let calset = reply.trim().trim_matches('"').to_string();
        if calset.is_empty() || calset == NO_CALSET {
            return Err(SweepError::Configuration(format!(
                "no active calibration set on '{}'",
                self.name
            )));
        }
        info!(analyzer = %self.name, calset = %calset, "Current calibration");
        Ok(calset)
    }

    async fn setup(&self, params: &MeasurementParams) -> AppResult<()> {
        let t = &self.transport;
        t.write("CALCulate:PARameter:DELete:ALL").await?;
        t.write("SENSe1:SWEep:MODE HOLD").await?;
        if let Some(points) = params.get("points") {
            t.write(&format!("SENSe1:SWEep:POINts {}", points)).await?;
        }
        t.write("SENSe1:SWEep:GENeration ANALog").await?;
        t.write("SENSe1:SWEep:TIME:AUTO ON").await?;
        // `points` was sent before the sweep generation settings.
        for (key, command) in SETUP_COMMANDS.iter().skip(1) {
            if let Some(value) = params.get(key) {
                t.write(&format!("{} {}", command, value)).await?;
            }
        }
        Ok(())
    }

    async fn define_traces(&self) -> AppResult<()> {
        let t = &self.transport;
        for &i in &self.ports {
            for &j in &self.ports {
                let parameter = format!("S{}_{}", i, j);
                let meas = format!("meas{}", parameter);
                debug!(analyzer = %self.name, "Defining {}", meas);
                t.write(&format!(
                    "CALCulate:PARameter:DEFine:EXTended '{}',{}",
                    meas, parameter
                ))
                .await?;
                if self.balanced {
                    let mixed = BALANCED_PARAMETERS[usize::from(i) - 1][usize::from(j) - 1];
                    t.write("CALCulate:FSIMulator:BALun:PARameter:STATe ON")
                        .await?;
                    t.write(&format!(
                        "CALCulate:FSIMulator:BALun:PARameter:BBALanced:DEFine {}",
                        mixed
                    ))
                    .await?;
                }
                t.write(&format!("DISPlay:WINDow{}:TRACe{}:FEED '{}'", i, j, meas))
                    .await?;
            }
        }

        if self.balanced {
            t.write("CALCulate1:FSIMulator:BALun:STIMulus:MODE TM")
                .await?;
            t.write("CALCulate:FSIMulator:BALun:DEVice BBALanced").await?;
            t.write("CALCulate:FSIMulator:BALun:TOPology:BBALanced:PPORts 1,3,2,4")
                .await
        } else {
            t.write("CALCulate1:FSIMulator:BALun:STIMulus:MODE SE")
                .await
        }
    }
}

#[async_trait]
impl DependentInstrument for ScpiNetworkAnalyzer {
    fn name(&self) -> &str {
        &self.name
    }

    fn validate(&self, params: &MeasurementParams) -> AppResult<()> {
        check_ports(&self.ports, self.balanced)?;
        if let Some(unknown) = params
            .0
            .keys()
            .find(|k| !SETUP_COMMANDS.iter().any(|(known, _)| *known == k.as_str()))
        {
            return Err(SweepError::Configuration(format!(
                "unknown analyzer parameter '{}'",
                unknown
            )));
        }
        let span = params.get("center_freq").is_some() || params.get("span_freq").is_some();
        let range = params.get("start_freq").is_some() || params.get("stop_freq").is_some();
        if span && range {
            return Err(SweepError::Configuration(
                "use either start_freq/stop_freq or center_freq/span_freq, not both".into(),
            ));
        }
        Ok(())
    }

    async fn measure(
        &mut self,
        name: &str,
        params: &MeasurementParams,
    ) -> AppResult<MeasurementArtifact> {
        self.setup(params).await?;
        self.check_calibration().await?;
        self.define_traces().await?;

        let t = &self.transport;
        t.write("SENSe1:SWEep:MODE SINGle").await?;
        t.query_with_timeout("*OPC?", self.sweep_timeout).await?;

        let file = self.file_name(name);
        let location = format!("{}\\{}", self.remote_dir, file);
        info!(analyzer = %self.name, artifact = %location, "Saving snp data");
        t.write(&format!(
            ":CALCulate1:DATA:SNP:PORTs:SAVE '{}','{}'",
            self.port_list(),
            location
        ))
        .await?;
        t.query_with_timeout("*OPC?", self.sweep_timeout).await?;

        self.output_off().await?;
        Ok(MeasurementArtifact {
            name: name.to_string(),
            location: Some(location),
        })
    }

    async fn output_off(&mut self) -> AppResult<()> {
        self.transport.write("SENSe1:SWEep:MODE HOLD").await
    }

    async fn disconnect(&mut self) -> AppResult<()> {
        self.output_off().await?;
        self.transport.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::MockTransport;

    fn analyzer(ports: Vec<u8>, balanced: bool) -> (ScpiNetworkAnalyzer, MockTransport) {
        let mock = MockTransport::new("TCPIP0::10.0.0.5::inst0::INSTR");
        mock.respond("SENSe1:CORR", "\"CalSet_12\"");
        let pna = ScpiNetworkAnalyzer::new(
            "pna",
            Box::new(mock.clone()),
            ports,
            balanced,
            "C:\\Data\\run",
        )
        .with_sweep_timeout(Duration::from_secs(300));
        (pna, mock)
    }

    #[test]
    fn port_checks() {
        assert!(check_ports(&[1, 2], false).is_ok());
        assert!(check_ports(&[1, 2, 3, 4], true).is_ok());
        assert!(check_ports(&[], false).unwrap_err().is_configuration());
        assert!(check_ports(&[1, 2, 3, 4, 1], false).is_err());
        assert!(check_ports(&[1, 5], false).is_err());
        assert!(check_ports(&[2, 2], false).is_err());
        assert!(check_ports(&[1, 2], true).is_err());
    }

    #[test]
    fn validate_rejects_mixed_frequency_modes() {
        let (pna, mock) = analyzer(vec![1, 2], false);
        let params = MeasurementParams::new()
            .with("start_freq", "1e9")
            .with("span_freq", "2e9");
        assert!(pna.validate(&params).unwrap_err().is_configuration());
        assert!(pna
            .validate(&MeasurementParams::new().with("colour", "red"))
            .is_err());
        assert!(pna.validate(&MeasurementParams::new().with("points", 201)).is_ok());
        assert!(mock.commands().is_empty());
    }

    #[tokio::test]
    async fn measure_sweeps_and_saves_touchstone() {
        let (mut pna, mock) = analyzer(vec![1, 2], false);
        let params = MeasurementParams::new().with("points", 401).with("if_bandwidth", 100);

        let artifact = pna.measure("RFTtest_A1V", &params).await.unwrap();

        assert_eq!(artifact.name, "RFTtest_A1V");
        assert_eq!(
            artifact.location.as_deref(),
            Some("C:\\Data\\run\\RFTtest_A1V.s2p")
        );

        let cmds = mock.commands();
        assert_eq!(cmds[0], "CALCulate:PARameter:DELete:ALL");
        assert_eq!(cmds[2], "SENSe1:SWEep:POINts 401");
        assert!(cmds.contains(&"SENSe1:BANDwidth 100".to_string()));
        assert!(cmds.contains(&"CALCulate:PARameter:DEFine:EXTended 'measS2_1',S2_1".to_string()));
        assert!(cmds.contains(&"DISPlay:WINDow1:TRACe2:FEED 'measS1_2'".to_string()));
        assert!(cmds.contains(&"CALCulate1:FSIMulator:BALun:STIMulus:MODE SE".to_string()));

        let single = cmds.iter().position(|c| c == "SENSe1:SWEep:MODE SINGle").unwrap();
        let save = cmds
            .iter()
            .position(|c| c == ":CALCulate1:DATA:SNP:PORTs:SAVE '1,2','C:\\Data\\run\\RFTtest_A1V.s2p'")
            .unwrap();
        assert!(single < save);
        assert_eq!(cmds.last().map(String::as_str), Some("SENSe1:SWEep:MODE HOLD"));

        assert_eq!(mock.max_timeout(), Duration::from_secs(300));
        assert_eq!(mock.current_timeout(), Duration::from_millis(2000));
    }

    #[tokio::test]
    async fn balanced_defines_mixed_mode_parameters() {
        let (mut pna, mock) = analyzer(vec![1, 2, 3, 4], true);
        pna.measure("bal", &MeasurementParams::new()).await.unwrap();

        let cmds = mock.commands();
        assert!(cmds.contains(
            &"CALCulate:FSIMulator:BALun:PARameter:BBALanced:DEFine SDC12".to_string()
        ));
        assert!(cmds.contains(&"CALCulate1:FSIMulator:BALun:STIMulus:MODE TM".to_string()));
        assert!(cmds.iter().any(|c| c.ends_with("bal.s4p'")));
    }

    #[tokio::test]
    async fn missing_calset_aborts_before_sweep() {
        let mock = MockTransport::new("TCPIP0::10.0.0.5::inst0::INSTR");
        mock.respond("SENSe1:CORR", "\"No Calset Selected\"");
        let mut pna =
            ScpiNetworkAnalyzer::new("pna", Box::new(mock.clone()), vec![1, 2], false, "C:\\Data");

        let err = pna.measure("x", &MeasurementParams::new()).await.unwrap_err();
        assert!(err.is_configuration());
        assert!(!mock.commands().contains(&"SENSe1:SWEep:MODE SINGle".to_string()));
    }

    #[tokio::test]
    async fn disconnect_holds_and_closes() {
        let (mut pna, mock) = analyzer(vec![1], false);
        pna.disconnect().await.unwrap();
        assert_eq!(mock.commands(), vec!["SENSe1:SWEep:MODE HOLD"]);
        assert!(mock.is_closed());
    }
}

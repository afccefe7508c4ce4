//! Instruments driven by the sweep.
//!
//! The orchestrator only sees the capability traits in [`capabilities`]. Concrete
//! drivers translate them into SCPI over an [`ScpiTransport`](crate::adapters::ScpiTransport);
//! the mocks implement them directly for tests and dry runs.

pub mod capabilities;
pub mod mock;
pub mod network_analyzer;
pub mod scpi_smu;

pub use capabilities::{
    BiasSource, DependentInstrument, DwellMeasurement, MeasurementArtifact, MeasurementParams,
};
pub use mock::{EventLog, MockAnalyzer, MockBiasSource};
pub use network_analyzer::ScpiNetworkAnalyzer;
pub use scpi_smu::ScpiSmu;

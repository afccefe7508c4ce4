//! Bias sweeps: grid enumeration, the orchestrator and repeated runs.

pub mod grid;
pub mod orchestrator;
pub mod schedule;

pub use grid::{artifact_name, combinations, BiasCombination, CartesianProduct, Setpoint, SweepAxis};
pub use orchestrator::{
    AcquisitionMode, BiasChannel, CombinationResult, SourceRecord, SweepOrchestrator, SweepPlan,
    SweepReport,
};
pub use schedule::run_repeated;

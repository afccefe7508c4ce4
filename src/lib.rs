//! Nested DC-bias sweeps over SCPI instruments.
//!
//! A run steps any number of bias sources through the Cartesian product of
//! their voltage sequences and triggers one dependent measurement (typically a
//! network-analyzer sweep) per combination. Bias-source records are
//! demultiplexed into voltage/current/resistance/time/status channels and
//! appended to one CSV per source as the run progresses.
//!
//! - [`sweep`]: grid enumeration, the orchestrator and repeated runs
//! - [`instrument`]: capability traits and SCPI drivers
//! - [`adapters`]: transports (VISA, scripted mock)
//! - [`data`]: record formatting and CSV storage
//! - [`config`] / [`logging`]: settings and tracing setup

pub mod adapters;
pub mod app;
pub mod config;
pub mod data;
pub mod error;
pub mod instrument;
pub mod logging;
pub mod metadata;
pub mod sweep;

pub use error::{AppResult, SweepError};

//! Instrument transport adapters
//!
//! Every instrument speaks SCPI text over some bus. `ScpiTransport` is the
//! low-level I/O seam: drivers in `crate::instrument` format commands, an
//! adapter moves them over VISA (GPIB, USB, LAN) or, for tests and dry runs,
//! into a scripted mock.

pub mod mock;
pub mod visa_adapter;

pub use mock::MockTransport;
pub use visa_adapter::VisaAdapter;

use crate::error::AppResult;
use async_trait::async_trait;
use std::time::Duration;

/// Command/query transport to one instrument.
///
/// All calls are blocking round-trips from the caller's point of view; the
/// adapter serializes access to the underlying session.
#[async_trait]
pub trait ScpiTransport: Send + Sync {
    /// Sends a command without reading a response.
    async fn write(&self, cmd: &str) -> AppResult<()>;

    /// Sends a query and returns the trimmed response, using the default timeout.
    async fn query(&self, cmd: &str) -> AppResult<String>;

    /// Sends a query with a temporary timeout.
    ///
    /// The default timeout is restored before returning, whether or not the
    /// query succeeded.
    async fn query_with_timeout(&self, cmd: &str, timeout: Duration) -> AppResult<String>;

    /// Releases the session. Further calls fail.
    async fn close(&self) -> AppResult<()>;

    /// VISA resource string (e.g. "GPIB0::24::INSTR").
    fn resource(&self) -> &str;
}

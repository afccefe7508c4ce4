//! VISA adapter for GPIB/USB/Ethernet instruments
//!
//! Wraps the `visa-rs` crate (feature `instrument_visa`). VISA calls block, so
//! every operation runs on Tokio's blocking pool while holding the session lock.
//!
//! Supports resource strings like:
//! - "GPIB0::24::INSTR" (GPIB interface)
//! - "USB0::0x1234::0x5678::SERIAL::INSTR" (USB)
//! - "TCPIP0::192.168.1.1::inst0::INSTR" (Ethernet/LXI)

use super::ScpiTransport;
use crate::error::{AppResult, SweepError};
use async_trait::async_trait;
use std::time::Duration;

#[cfg(feature = "instrument_visa")]
use std::sync::Arc;
#[cfg(feature = "instrument_visa")]
use tokio::sync::Mutex;
#[cfg(feature = "instrument_visa")]
use tracing::debug;

/// VISA transport to one instrument.
pub struct VisaAdapter {
    /// VISA resource string (e.g., "GPIB0::24::INSTR")
    pub(crate) resource: String,

    /// Default I/O timeout, restored after every long operation
    pub(crate) timeout: Duration,

    /// Line terminator appended to commands (typically "\n" for SCPI)
    pub(crate) write_terminator: String,

    #[cfg(feature = "instrument_visa")]
    session: Arc<Mutex<Option<session::VisaSession>>>,
}

impl VisaAdapter {
    /// Create an unopened adapter with a 2 s default timeout.
    pub fn new(resource: impl Into<String>) -> Self {
        Self {
            resource: resource.into(),
            timeout: Duration::from_millis(2000),
            write_terminator: "\n".to_string(),
            #[cfg(feature = "instrument_visa")]
            session: Arc::new(Mutex::new(None)),
        }
    }

    /// Set the default timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the command terminator.
    pub fn with_write_terminator(mut self, terminator: impl Into<String>) -> Self {
        self.write_terminator = terminator.into();
        self
    }

    /// Open the VISA session.
    #[cfg(feature = "instrument_visa")]
    pub async fn open(self) -> AppResult<Self> {
        let resource = self.resource.clone();
        let timeout = self.timeout;
        let opened = tokio::task::spawn_blocking(move || session::VisaSession::open(&resource, timeout))
            .await
            .map_err(|e| SweepError::communication(&self.resource, format!("VISA open task panicked: {}", e)))??;

        *self.session.lock().await = Some(opened);
        debug!(
            "VISA resource '{}' opened with {}ms timeout",
            self.resource,
            self.timeout.as_millis()
        );
        Ok(self)
    }

    /// Open the VISA session.
    #[cfg(not(feature = "instrument_visa"))]
    pub async fn open(self) -> AppResult<Self> {
        Err(SweepError::FeatureNotEnabled("instrument_visa".to_string()))
    }

    /// Runs `op` against the open session on the blocking pool.
    #[cfg(feature = "instrument_visa")]
    async fn with_session<T, F>(&self, what: &str, op: F) -> AppResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&session::VisaSession, &str) -> AppResult<T> + Send + 'static,
    {
        let session = Arc::clone(&self.session);
        let resource = self.resource.clone();
        let what = what.to_string();
        tokio::task::spawn_blocking(move || {
            let guard = session.blocking_lock();
            let open = guard
                .as_ref()
                .ok_or_else(|| SweepError::communication(&resource, "VISA session not open"))?;
            op(open, &resource)
        })
        .await
        .map_err(|e| SweepError::communication(&self.resource, format!("VISA {} task panicked: {}", what, e)))?
    }

    #[cfg_attr(not(feature = "instrument_visa"), allow(dead_code))]
    fn terminated(&self, cmd: &str) -> String {
        format!("{}{}", cmd, self.write_terminator)
    }
}

#[cfg(feature = "instrument_visa")]
#[async_trait]
impl ScpiTransport for VisaAdapter {
    async fn write(&self, cmd: &str) -> AppResult<()> {
        let line = self.terminated(cmd);
        debug!("VISA write: {}", cmd);
        self.with_session("write", move |s, resource| s.write(resource, &line))
            .await
    }

    async fn query(&self, cmd: &str) -> AppResult<String> {
        let line = self.terminated(cmd);
        let response = self
            .with_session("query", move |s, resource| {
                s.write(resource, &line)?;
                s.read_line(resource)
            })
            .await?;
        debug!("VISA query '{}' -> '{}'", cmd, response);
        Ok(response)
    }

    async fn query_with_timeout(&self, cmd: &str, timeout: Duration) -> AppResult<String> {
        let line = self.terminated(cmd);
        let default_timeout = self.timeout;
        debug!("VISA query (timeout {:?}): {}", timeout, cmd);
        self.with_session("query", move |s, resource| {
            s.set_timeout(resource, timeout)?;
            let result = s.write(resource, &line).and_then(|()| s.read_line(resource));
            let restored = s.set_timeout(resource, default_timeout);
            let response = result?;
            restored?;
            Ok(response)
        })
        .await
    }

    async fn close(&self) -> AppResult<()> {
        if self.session.lock().await.take().is_some() {
            debug!("VISA resource '{}' closed", self.resource);
        }
        Ok(())
    }

    fn resource(&self) -> &str {
        &self.resource
    }
}

#[cfg(not(feature = "instrument_visa"))]
#[async_trait]
impl ScpiTransport for VisaAdapter {
    async fn write(&self, _cmd: &str) -> AppResult<()> {
        Err(SweepError::FeatureNotEnabled("instrument_visa".to_string()))
    }

    async fn query(&self, _cmd: &str) -> AppResult<String> {
        Err(SweepError::FeatureNotEnabled("instrument_visa".to_string()))
    }

    async fn query_with_timeout(&self, _cmd: &str, _timeout: Duration) -> AppResult<String> {
        Err(SweepError::FeatureNotEnabled("instrument_visa".to_string()))
    }

    async fn close(&self) -> AppResult<()> {
        Ok(())
    }

    fn resource(&self) -> &str {
        &self.resource
    }
}

#[cfg(feature = "instrument_visa")]
mod session {
    use crate::error::{AppResult, SweepError};
    use std::ffi::CString;
    use std::io::{BufRead, BufReader, Write};
    use std::time::Duration;
    use visa_rs::prelude::*;

    /// An open instrument plus the resource manager that owns it; dropping the
    /// manager closes its sessions.
    pub(super) struct VisaSession {
        _rm: DefaultRM,
        instr: Instrument,
    }

    impl VisaSession {
        pub(super) fn open(resource: &str, timeout: Duration) -> AppResult<Self> {
            let rm = DefaultRM::new().map_err(|e| {
                SweepError::communication(resource, format!("Failed to create VISA resource manager: {}", e))
            })?;
            let expr: VisaString = CString::new(resource)
                .map_err(|e| SweepError::communication(resource, e.to_string()))?
                .into();
            let rsc = rm.find_res(&expr).map_err(|e| {
                SweepError::communication(resource, format!("Failed to find VISA resource: {}", e))
            })?;
            let instr = rm
                .open(&rsc, AccessMode::NO_LOCK, TIMEOUT_IMMEDIATE)
                .map_err(|e| {
                    SweepError::communication(resource, format!("Failed to open VISA resource: {}", e))
                })?;

            let session = Self { _rm: rm, instr };
            session.set_timeout(resource, timeout)?;
            Ok(session)
        }

        pub(super) fn set_timeout(&self, resource: &str, timeout: Duration) -> AppResult<()> {
            let timeout_ms = u32::try_from(timeout.as_millis()).unwrap_or(u32::MAX);
            let attr = attribute::AttrTmoValue::new_checked(timeout_ms).ok_or_else(|| {
                SweepError::communication(resource, format!("Invalid VISA timeout {}ms", timeout_ms))
            })?;
            self.instr.set_attr(attr).map_err(|e| {
                SweepError::communication(resource, format!("Failed to set VISA timeout: {}", e))
            })
        }

        pub(super) fn write(&self, resource: &str, line: &str) -> AppResult<()> {
            (&self.instr).write_all(line.as_bytes()).map_err(|e| {
                SweepError::communication(resource, format!("VISA write failed for '{}': {}", line.trim(), e))
            })
        }

        pub(super) fn read_line(&self, resource: &str) -> AppResult<String> {
            let mut reader = BufReader::new(&self.instr);
            let mut response = String::new();
            reader.read_line(&mut response).map_err(|e| {
                SweepError::communication(resource, format!("VISA read failed: {}", e))
            })?;
            Ok(response.trim().to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_visa_adapter_creation() {
        let adapter = VisaAdapter::new("GPIB0::24::INSTR");
        assert_eq!(adapter.resource(), "GPIB0::24::INSTR");
        assert_eq!(adapter.timeout, Duration::from_millis(2000));
        assert_eq!(adapter.write_terminator, "\n");
    }

    #[test]
    fn test_visa_adapter_builder() {
        let adapter = VisaAdapter::new("TCPIP0::192.168.1.1::inst0::INSTR")
            .with_timeout(Duration::from_millis(5000))
            .with_write_terminator("\r\n");

        assert_eq!(adapter.timeout, Duration::from_millis(5000));
        assert_eq!(adapter.terminated("*IDN?"), "*IDN?\r\n");
    }

    #[cfg(not(feature = "instrument_visa"))]
    #[tokio::test]
    async fn test_open_without_feature() {
        let err = VisaAdapter::new("GPIB0::24::INSTR").open().await.err().unwrap();
        assert!(matches!(err, SweepError::FeatureNotEnabled(_)));
    }
}

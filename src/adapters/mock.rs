//! Scripted transport for testing drivers without hardware.
//!
//! Provides:
//! - A command log for verifying command ordering
//! - Canned query responses keyed by command prefix
//! - Controllable failure injection
//! - Timeout tracking, to check that long operations restore the default

use super::ScpiTransport;
use crate::error::{AppResult, SweepError};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

#[derive(Default)]
struct MockState {
    log: Vec<String>,
    responses: Vec<(String, VecDeque<String>)>,
    fail_prefixes: Vec<String>,
    fail_next: bool,
    closed: bool,
    current_timeout: Duration,
    max_timeout: Duration,
}

/// In-memory `ScpiTransport`.
///
/// Clones share state, so a test can keep a handle while a driver owns the
/// boxed transport.
#[derive(Clone)]
pub struct MockTransport {
    resource: String,
    default_timeout: Duration,
    state: Arc<Mutex<MockState>>,
}

impl MockTransport {
    /// Creates an open transport with a 2 s default timeout.
    pub fn new(resource: impl Into<String>) -> Self {
        let default_timeout = Duration::from_millis(2000);
        Self {
            resource: resource.into(),
            default_timeout,
            state: Arc::new(Mutex::new(MockState {
                current_timeout: default_timeout,
                max_timeout: default_timeout,
                ..MockState::default()
            })),
        }
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queues `response` for the next query starting with `prefix`.
    ///
    /// When the queue for a prefix holds one entry it is reused for every later
    /// match, so a single call scripts a fixed answer.
    pub fn respond(&self, prefix: &str, response: impl Into<String>) -> &Self {
        let mut state = self.state();
        let response = response.into();
        match state.responses.iter_mut().find(|(p, _)| p == prefix) {
            Some((_, queue)) => queue.push_back(response),
            None => state
                .responses
                .push((prefix.to_string(), VecDeque::from([response]))),
        }
        self
    }

    /// Makes every command starting with `prefix` fail.
    pub fn fail_on(&self, prefix: &str) -> &Self {
        self.state().fail_prefixes.push(prefix.to_string());
        self
    }

    /// Makes the next command fail, whatever it is.
    pub fn inject_next_failure(&self) {
        self.state().fail_next = true;
    }

    /// Every command and query sent so far, in order.
    pub fn commands(&self) -> Vec<String> {
        self.state().log.clone()
    }

    /// Clears the command log.
    pub fn clear_log(&self) {
        self.state().log.clear();
    }

    /// Timeout currently in effect.
    pub fn current_timeout(&self) -> Duration {
        self.state().current_timeout
    }

    /// Longest timeout ever applied.
    pub fn max_timeout(&self) -> Duration {
        self.state().max_timeout
    }

    /// True once `close` has been called.
    pub fn is_closed(&self) -> bool {
        self.state().closed
    }

    fn record(&self, cmd: &str) -> AppResult<()> {
        let mut state = self.state();
        if state.closed {
            return Err(SweepError::communication(&self.resource, "session closed"));
        }
        state.log.push(cmd.to_string());
        let injected = std::mem::take(&mut state.fail_next);
        if injected || state.fail_prefixes.iter().any(|p| cmd.starts_with(p.as_str())) {
            return Err(SweepError::communication(
                &self.resource,
                format!("injected failure on '{}'", cmd),
            ));
        }
        Ok(())
    }

    fn response_for(&self, cmd: &str) -> String {
        let mut state = self.state();
        let queue = state
            .responses
            .iter_mut()
            .filter(|(prefix, _)| cmd.starts_with(prefix.as_str()))
            .max_by_key(|(prefix, _)| prefix.len())
            .map(|(_, queue)| queue);
        match queue {
            Some(queue) if queue.len() > 1 => queue.pop_front().unwrap_or_default(),
            Some(queue) => queue.front().cloned().unwrap_or_default(),
            None => String::new(),
        }
    }
}

#[async_trait]
impl ScpiTransport for MockTransport {
    async fn write(&self, cmd: &str) -> AppResult<()> {
        self.record(cmd)
    }

    async fn query(&self, cmd: &str) -> AppResult<String> {
        self.record(cmd)?;
        Ok(self.response_for(cmd))
    }

    async fn query_with_timeout(&self, cmd: &str, timeout: Duration) -> AppResult<String> {
        {
            let mut state = self.state();
            state.current_timeout = timeout;
            state.max_timeout = state.max_timeout.max(timeout);
        }
        let result = self.query(cmd).await;
        self.state().current_timeout = self.default_timeout;
        result
    }

    async fn close(&self) -> AppResult<()> {
        self.state().closed = true;
        Ok(())
    }

    fn resource(&self) -> &str {
        &self.resource
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn logs_commands_in_order() {
        let mock = MockTransport::new("GPIB0::1::INSTR");
        mock.write("*RST").await.unwrap();
        mock.query("*IDN?").await.unwrap();
        assert_eq!(mock.commands(), vec!["*RST", "*IDN?"]);

        mock.clear_log();
        mock.write(":OUTPut OFF").await.unwrap();
        assert_eq!(mock.commands(), vec![":OUTPut OFF"]);
    }

    #[tokio::test]
    async fn scripted_responses_pop_until_last() {
        let mock = MockTransport::new("GPIB0::1::INSTR");
        mock.respond("FETC", "1,2,3,4,5").respond("FETC", "6,7,8,9,10");

        assert_eq!(mock.query("FETCh?").await.unwrap(), "1,2,3,4,5");
        assert_eq!(mock.query("FETCh?").await.unwrap(), "6,7,8,9,10");
        assert_eq!(mock.query("FETCh?").await.unwrap(), "6,7,8,9,10");
        assert_eq!(mock.query("*OPC?").await.unwrap(), "");
    }

    #[tokio::test]
    async fn longest_prefix_wins() {
        let mock = MockTransport::new("GPIB0::1::INSTR");
        mock.respond("SENS", "generic").respond("SENSe1:CORR", "CalSet_1");
        assert_eq!(
            mock.query("SENSe1:CORRection:CSET:ACTivate? NAME").await.unwrap(),
            "CalSet_1"
        );
    }

    #[tokio::test]
    async fn injected_failures() {
        let mock = MockTransport::new("GPIB0::1::INSTR");
        mock.inject_next_failure();
        assert!(mock.write("*CLS").await.unwrap_err().is_communication());
        assert!(mock.write("*CLS").await.is_ok());

        mock.fail_on(":ABOR");
        assert!(mock.write(":ABORt").await.is_err());
    }

    #[tokio::test]
    async fn timeout_restored_after_long_query() {
        let mock = MockTransport::new("GPIB0::1::INSTR");
        mock.fail_on("FETC");
        let long = Duration::from_secs(1200);
        assert!(mock.query_with_timeout("FETCh?", long).await.is_err());
        assert_eq!(mock.current_timeout(), Duration::from_millis(2000));
        assert_eq!(mock.max_timeout(), long);
    }

    #[tokio::test]
    async fn closed_transport_rejects_commands() {
        let mock = MockTransport::new("GPIB0::1::INSTR");
        mock.close().await.unwrap();
        assert!(mock.is_closed());
        assert!(mock.write("*RST").await.is_err());
    }
}

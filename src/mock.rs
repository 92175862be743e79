//! Simulated instrument for tests and examples.
//!
//! [`mock_transport`] returns a connected pair: the [`MockTransport`] is
//! handed to an [`Instrument`](crate::instrument::Instrument), the
//! [`MockDevice`] stays with the test to script answers, inject failures and
//! count calls.
//!
//! The device understands a minimal SCPI-like protocol:
//!
//! - `KEY?` answers the register `KEY`
//! - `KEY VALUE` stores `VALUE` in register `KEY` and answers the write
//!   response (`"OK"` unless changed)

use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use crate::error::{TransportError, TransportErrorKind};
use crate::transport::{Transport, TransportResult};

#[derive(Debug)]
struct MockState {
    registers: HashMap<String, String>,
    write_response: String,
    failures: VecDeque<TransportErrorKind>,
    queries: Vec<String>,
    writes: Vec<String>,
    reopens: usize,
    open: bool,
}

impl Default for MockState {
    fn default() -> Self {
        Self {
            registers: HashMap::new(),
            write_response: "OK".to_string(),
            failures: VecDeque::new(),
            queries: Vec::new(),
            writes: Vec::new(),
            reopens: 0,
            open: true,
        }
    }
}

impl MockState {
    fn take_failure(&mut self, command: &str) -> TransportResult<()> {
        if !self.open {
            return Err(TransportError::disconnected("session closed"));
        }
        match self.failures.pop_front() {
            Some(kind) => Err(TransportError::new(kind, format!("injected failure on '{}'", command))),
            None => Ok(()),
        }
    }
}

/// Client side, given to the root node.
#[derive(Debug, Clone)]
pub struct MockTransport {
    state: Arc<Mutex<MockState>>,
}

/// Test side of the simulated instrument.
#[derive(Debug, Clone)]
pub struct MockDevice {
    state: Arc<Mutex<MockState>>,
}

/// Create a connected transport/device pair.
pub fn mock_transport() -> (MockTransport, MockDevice) {
    let state = Arc::new(Mutex::new(MockState::default()));
    (
        MockTransport {
            state: state.clone(),
        },
        MockDevice { state },
    )
}

impl Transport for MockTransport {
    fn query(&mut self, command: &str) -> TransportResult<String> {
        let mut state = self.state.lock();
        state.queries.push(command.to_string());
        state.take_failure(command)?;
        let key = command.trim().trim_end_matches('?');
        state.registers.get(key).cloned().ok_or_else(|| {
            TransportError::new(TransportErrorKind::Protocol, format!("unknown query '{}'", command))
        })
    }

    fn write(&mut self, command: &str) -> TransportResult<String> {
        let mut state = self.state.lock();
        state.writes.push(command.to_string());
        state.take_failure(command)?;
        let (key, value) = command.trim().split_once(' ').unwrap_or((command.trim(), ""));
        state.registers.insert(key.to_string(), value.trim().to_string());
        Ok(state.write_response.clone())
    }

    fn reopen(&mut self) -> TransportResult<()> {
        let mut state = self.state.lock();
        state.reopens += 1;
        state.open = true;
        Ok(())
    }
}

impl MockDevice {
    /// Set register `key` as if the front panel had been used.
    pub fn set_register(&self, key: &str, value: impl ToString) {
        self.state.lock().registers.insert(key.to_string(), value.to_string());
    }

    /// Current value of register `key`.
    pub fn register(&self, key: &str) -> Option<String> {
        self.state.lock().registers.get(key).cloned()
    }

    /// Answer every write with `response` from now on.
    pub fn set_write_response(&self, response: &str) {
        self.state.lock().write_response = response.to_string();
    }

    /// Fail the next `count` operations with `kind`.
    pub fn fail_next(&self, count: usize, kind: TransportErrorKind) {
        let mut state = self.state.lock();
        state.failures.extend(std::iter::repeat(kind).take(count));
    }

    /// Drop the session: every operation fails until the next reopen.
    pub fn disconnect(&self) {
        self.state.lock().open = false;
    }

    /// Queries received so far.
    pub fn queries(&self) -> Vec<String> {
        self.state.lock().queries.clone()
    }

    /// Write commands received so far.
    pub fn writes(&self) -> Vec<String> {
        self.state.lock().writes.clone()
    }

    /// Number of queries and writes received.
    pub fn operations(&self) -> usize {
        let state = self.state.lock();
        state.queries.len() + state.writes.len()
    }

    /// Number of session reopenings.
    pub fn reopens(&self) -> usize {
        self.state.lock().reopens
    }

    /// Forget recorded calls, keeping registers.
    pub fn reset_counters(&self) {
        let mut state = self.state.lock();
        state.queries.clear();
        state.writes.clear();
        state.reopens = 0;
    }
}

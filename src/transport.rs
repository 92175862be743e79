//! Session with the physical instrument.
//!
//! The property layer only needs text in, text out. Concrete sessions
//! (serial port, VISA, TCP socket) live outside this crate and signal
//! recoverable failures through [`TransportError::is_retriable`].

use crate::error::TransportError;

/// Result type alias for transport operations.
pub type TransportResult<T> = std::result::Result<T, TransportError>;

/// A message based instrument session.
pub trait Transport: Send {
    /// Send `command` and return the answer.
    fn query(&mut self, command: &str) -> TransportResult<String>;

    /// Send `command` and return whatever the device acknowledged with
    /// (empty when the protocol has no acknowledgement).
    fn write(&mut self, command: &str) -> TransportResult<String>;

    /// Close and open the session again.
    fn reopen(&mut self) -> TransportResult<()>;
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn query(&mut self, command: &str) -> TransportResult<String> {
        (**self).query(command)
    }

    fn write(&mut self, command: &str) -> TransportResult<String> {
        (**self).write(command)
    }

    fn reopen(&mut self) -> TransportResult<()> {
        (**self).reopen()
    }
}

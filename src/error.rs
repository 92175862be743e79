//! Error types for property access.
//!
//! [`PropertyError`] is the single error returned by every read, write and
//! declaration operation. Its variants fall into the four categories callers
//! need to tell apart:
//!
//! 1. **Validation failures** - `Validation`, `OutOfRange`
//!    - Raised by pre-read/pre-write checks and limits validation
//!    - Never retried, no device contact has happened yet
//!
//! 2. **Communication failures** - `Communication`
//!    - Raised by the transport through the root node
//!    - Retried up to the property budget when [`TransportError::is_retriable`],
//!      then returned verbatim
//!
//! 3. **Operation check failures** - `OperationCheck`
//!    - The device answered but did not apply the write
//!
//! 4. **Structural errors** - `Structural`, `NotReadable`, `NotWritable`
//!    - Programmer errors in declarations (unknown anchor, duplicate stage,
//!      missing channel enumeration, malformed check expression)

use thiserror::Error;

use crate::composer::HookPoint;
use crate::value::Value;

/// Result type alias for property operations.
pub type Result<T> = std::result::Result<T, PropertyError>;

/// Errors raised while declaring, reading or writing properties.
#[derive(Error, Debug)]
pub enum PropertyError {
    /// A check clause evaluated to false (or could not be evaluated)
    #[error("{message}")]
    Validation { property: String, message: String },

    /// The value lies outside the configured limits
    #[error(
        "The provided value {value} is out of bound for {property}.{}",
        describe_bounds(.minimum, .maximum, .step)
    )]
    OutOfRange {
        property: String,
        value: Value,
        minimum: Option<f64>,
        maximum: Option<f64>,
        step: Option<f64>,
    },

    /// Failure reported by the transport
    #[error(transparent)]
    Communication(#[from] TransportError),

    /// The device reported that the write did not take effect
    #[error(
        "The instrument did not succeed to set {property} to {value} ({internal}){}",
        describe_details(.details)
    )]
    OperationCheck {
        property: String,
        value: Value,
        internal: Value,
        details: Option<String>,
    },

    /// The property has no read accessor
    #[error("Property '{0}' is write-only")]
    NotReadable(String),

    /// The property has no write accessor
    #[error("Property '{0}' is read-only")]
    NotWritable(String),

    /// Malformed declaration or customization
    #[error(transparent)]
    Structural(#[from] StructuralError),

    /// Failure raised by a user supplied stage or accessor override
    #[error(transparent)]
    Custom(#[from] anyhow::Error),
}

impl PropertyError {
    /// Create a validation failure for `property`.
    pub fn validation(property: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Validation {
            property: property.into(),
            message: message.into(),
        }
    }

    /// Check if this error comes from a check or limits validation.
    pub fn is_validation(&self) -> bool {
        matches!(self, Self::Validation { .. } | Self::OutOfRange { .. })
    }

    /// Check if the chain may reopen the session and try again.
    pub fn is_retriable(&self) -> bool {
        matches!(self, Self::Communication(err) if err.is_retriable())
    }

    /// Check if this is a declaration error.
    pub fn is_structural(&self) -> bool {
        matches!(self, Self::Structural(_))
    }
}

fn describe_bounds(minimum: &Option<f64>, maximum: &Option<f64>, step: &Option<f64>) -> String {
    let mut message = String::new();
    if let Some(min) = minimum {
        message.push_str(&format!(" Minimum {}.", min));
    }
    if let Some(max) = maximum {
        message.push_str(&format!(" Maximum {}.", max));
    }
    if let Some(step) = step {
        message.push_str(&format!(" Step {}.", step));
    }
    message
}

fn describe_details(details: &Option<String>) -> String {
    match details {
        Some(details) if !details.is_empty() => format!(": {}", details),
        _ => ".".to_string(),
    }
}

/// Declaration-time errors. These are programmer errors and never retried.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StructuralError {
    /// Anchor or target stage absent from a composer
    #[error("No stage named '{name}' in the {hook} composer")]
    StageNotFound { hook: HookPoint, name: String },

    /// Stage name already used in a composer
    #[error("A stage named '{name}' already exists in the {hook} composer")]
    DuplicateStage { hook: HookPoint, name: String },

    /// Stage built for another hook point
    #[error("Cannot attach a {stage} stage to the {hook} composer")]
    StageHookMismatch { hook: HookPoint, stage: HookPoint },

    /// No property with that name
    #[error("Unknown property '{0}'")]
    UnknownProperty(String),

    /// No subsystem with that name
    #[error("Unknown subsystem '{0}'")]
    UnknownSubsystem(String),

    /// No channel container with that name
    #[error("Unknown channel container '{0}'")]
    UnknownChannel(String),

    /// Channel declared without static ids or a listing callable
    #[error("Channel '{0}' has no way to enumerate available identifiers")]
    MissingChannelEnumeration(String),

    /// No limits provider declared under this id
    #[error("No limits declared under '{0}'")]
    UnknownLimits(String),

    /// A check expression could not be compiled
    #[error("Invalid check '{expression}': {message}")]
    InvalidCheck { expression: String, message: String },

    /// A `get_format` pattern could not be compiled
    #[error("Invalid extraction format '{format}': {message}")]
    InvalidFormat { format: String, message: String },

    /// Accessor token could not be formatted with the routing arguments
    #[error("Cannot format command '{token}': {message}")]
    InvalidCommand { token: String, message: String },

    /// Invalid path to another property (empty segment, dangling parent)
    #[error("Invalid property path '{0}'")]
    InvalidPath(String),

    /// A relay node outlived its parent
    #[error("Node is detached from its parent")]
    DetachedNode,
}

/// Category of a transport failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportErrorKind {
    /// No answer within the transport timeout
    Timeout,
    /// Session lost (cable pulled, socket closed)
    Disconnected,
    /// Generic I/O failure on the session
    Io,
    /// The device answered something the transport cannot interpret
    Protocol,
}

impl std::fmt::Display for TransportErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            TransportErrorKind::Timeout => "timeout",
            TransportErrorKind::Disconnected => "disconnected",
            TransportErrorKind::Io => "io",
            TransportErrorKind::Protocol => "protocol",
        };
        write!(f, "{}", label)
    }
}

/// Error raised by a [`Transport`](crate::transport::Transport).
#[derive(Error, Debug, Clone, PartialEq)]
#[error("Transport {kind} error: {message}")]
pub struct TransportError {
    /// Failure category
    pub kind: TransportErrorKind,
    /// Details from the transport
    pub message: String,
}

impl TransportError {
    /// Create a transport error of `kind`.
    pub fn new(kind: TransportErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Timeout error.
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::Timeout, message)
    }

    /// Lost session error.
    pub fn disconnected(message: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::Disconnected, message)
    }

    /// Recoverable failures trigger a session reopen and a new attempt.
    pub fn is_retriable(&self) -> bool {
        !matches!(self.kind, TransportErrorKind::Protocol)
    }
}

impl From<std::io::Error> for TransportError {
    fn from(err: std::io::Error) -> Self {
        let kind = match err.kind() {
            std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock => {
                TransportErrorKind::Timeout
            }
            std::io::ErrorKind::BrokenPipe
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::NotConnected => TransportErrorKind::Disconnected,
            _ => TransportErrorKind::Io,
        };
        Self::new(kind, err.to_string())
    }
}

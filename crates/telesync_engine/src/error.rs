//! Error types for the synchronization engine.

use std::time::Duration;
use telesync_protocol::ProtocolError;
use thiserror::Error;

/// Result type for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

/// Errors that can occur while synchronizing.
///
/// Errors are surfaced to `on_error` observers and never thrown from the
/// public engine surface, so the type is `Clone` to allow fan-out.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// Connection refused, DNS failure, stream closed abnormally, silence.
    #[error("transport error: {message}")]
    Transport {
        /// Error message.
        message: String,
    },

    /// An operation exceeded its per-call timeout.
    #[error("operation timed out after {after:?}")]
    Timeout {
        /// The timeout that elapsed.
        after: Duration,
    },

    /// A stale pending operation was force-released by the guard.
    #[error("guard released a stale operation held for {held_for:?}")]
    GuardTimeout {
        /// How long the stale operation had been held.
        held_for: Duration,
    },

    /// Malformed response payload.
    #[error("parse error: {0}")]
    Parse(String),

    /// Automatic recovery gave up. Requires an explicit reset.
    #[error("gave up after {attempts} reconnect attempts")]
    MaxAttemptsExceeded {
        /// The configured reconnect attempt limit.
        attempts: u32,
    },

    /// Configuration rejected at construction.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// The transport is closed.
    #[error("not connected")]
    NotConnected,
}

/// Classification of an [`EngineError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// See [`EngineError::Transport`].
    Transport,
    /// See [`EngineError::Timeout`].
    Timeout,
    /// See [`EngineError::GuardTimeout`].
    GuardTimeout,
    /// See [`EngineError::Parse`].
    Parse,
    /// See [`EngineError::MaxAttemptsExceeded`].
    MaxAttemptsExceeded,
    /// See [`EngineError::InvalidConfig`].
    InvalidConfig,
    /// See [`EngineError::NotConnected`].
    NotConnected,
}

impl EngineError {
    /// Creates a transport error.
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
        }
    }

    /// Returns the classification of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::Transport { .. } => ErrorKind::Transport,
            EngineError::Timeout { .. } => ErrorKind::Timeout,
            EngineError::GuardTimeout { .. } => ErrorKind::GuardTimeout,
            EngineError::Parse(_) => ErrorKind::Parse,
            EngineError::MaxAttemptsExceeded { .. } => ErrorKind::MaxAttemptsExceeded,
            EngineError::InvalidConfig(_) => ErrorKind::InvalidConfig,
            EngineError::NotConnected => ErrorKind::NotConnected,
        }
    }

    /// Returns true if this error feeds backoff and moves the connection
    /// toward recovery.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            EngineError::Transport { .. } | EngineError::Timeout { .. } | EngineError::Parse(_)
        )
    }

    /// Returns true if automatic recovery has stopped.
    pub fn is_fatal(&self) -> bool {
        matches!(self, EngineError::MaxAttemptsExceeded { .. })
    }
}

impl From<ProtocolError> for EngineError {
    fn from(err: ProtocolError) -> Self {
        EngineError::Parse(err.to_string())
    }
}

//! Error types for protocol encoding and decoding.

use thiserror::Error;

/// Result type for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Errors that can occur while encoding or decoding protocol messages.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// The payload is not valid JSON or does not match the expected shape.
    #[error("decode error: {0}")]
    Decode(String),

    /// The message could not be serialized.
    #[error("encode error: {0}")]
    Encode(String),

    /// A stream envelope is structurally valid JSON but unusable.
    #[error("invalid envelope: {0}")]
    InvalidEnvelope(String),
}

impl ProtocolError {
    pub(crate) fn decode(err: serde_json::Error) -> Self {
        Self::Decode(err.to_string())
    }

    pub(crate) fn encode(err: serde_json::Error) -> Self {
        Self::Encode(err.to_string())
    }
}

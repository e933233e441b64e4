//! Error types for the telemetry server.

use telesync_protocol::ProtocolError;
use thiserror::Error;

/// Result type for server operations.
pub type ServerResult<T> = Result<T, ServerError>;

/// Errors that can occur in the telemetry server.
#[derive(Error, Debug)]
pub enum ServerError {
    /// Invalid request or frame.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Unknown path.
    #[error("not found: {0}")]
    NotFound(String),

    /// Wire format error.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl ServerError {
    /// Returns true if this is a client error (4xx).
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            ServerError::InvalidRequest(_) | ServerError::NotFound(_) | ServerError::Protocol(_)
        )
    }

    /// Returns true if this is a server error (5xx).
    pub fn is_server_error(&self) -> bool {
        matches!(self, ServerError::Io(_))
    }

    /// HTTP status code for this error.
    pub fn status_code(&self) -> u16 {
        match self {
            ServerError::InvalidRequest(_) | ServerError::Protocol(_) => 400,
            ServerError::NotFound(_) => 404,
            ServerError::Io(_) => 500,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_classification() {
        assert!(ServerError::InvalidRequest("bad".into()).is_client_error());
        assert!(ServerError::NotFound("/nope".into()).is_client_error());
        assert!(ServerError::Io(std::io::Error::other("oops")).is_server_error());
        assert!(!ServerError::InvalidRequest("bad".into()).is_server_error());
        assert_eq!(ServerError::NotFound("/nope".into()).status_code(), 404);
    }

    #[test]
    fn protocol_errors_convert() {
        let err: ServerError = ProtocolError::Decode("eof".into()).into();
        assert!(err.is_client_error());
        assert!(err.to_string().contains("eof"));
    }
}

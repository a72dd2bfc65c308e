//! Client error types.

use thiserror::Error;
use wiremux_protocol::ErrorCode;

/// Client errors.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] wiremux_protocol::ProtocolError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("not connected")]
    NotConnected,

    #[error("session already open")]
    AlreadyOpen,

    #[error("connection closed")]
    ConnectionClosed,

    #[error("request timeout")]
    Timeout,

    #[error("handshake failed: {code} {reason}")]
    HandshakeFailed { code: u16, reason: String },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("duplicate request id: {0}")]
    DuplicateRequestId(String),

    #[error("call failed: {status} {reason}")]
    CallFailed { status: u16, reason: String },
}

impl ClientError {
    /// Returns the status code carried by this error, if any.
    pub fn status_code(&self) -> Option<u16> {
        match self {
            ClientError::HandshakeFailed { code, .. } => Some(*code),
            ClientError::CallFailed { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Returns whether this error is retryable.
    pub fn is_retryable(&self) -> bool {
        match self {
            ClientError::Io(_) => true,
            ClientError::Timeout => true,
            ClientError::ConnectionClosed => true,
            ClientError::Transport(_) => true,
            ClientError::CallFailed { status, .. } => {
                *status == ErrorCode::ServerError.status_code()
                    || *status == ErrorCode::GatewayTimeout.status_code()
            }
            _ => false,
        }
    }
}

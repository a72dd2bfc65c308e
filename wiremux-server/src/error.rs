//! Server error types.

use thiserror::Error;
use wiremux_protocol::ErrorCode;

/// Server errors.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] wiremux_protocol::ProtocolError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("identity {0:?} is not allowed on this session")]
    NotAllowed(String),

    #[error("unsupported protocol version: {0}")]
    UnsupportedProtocol(String),

    #[error("execution failed: {0}")]
    Execution(String),

    #[error("call timed out")]
    Timeout,

    #[error("connection closed")]
    ConnectionClosed,

    #[error("server shutting down")]
    ShuttingDown,
}

impl ServerError {
    /// Converts to protocol error code.
    pub fn error_code(&self) -> ErrorCode {
        match self {
            ServerError::Io(_) => ErrorCode::ServerError,
            ServerError::Protocol(_) => ErrorCode::ProtocolError,
            ServerError::Json(_) => ErrorCode::ProtocolError,
            ServerError::NotAllowed(_) => ErrorCode::NotAllowed,
            ServerError::UnsupportedProtocol(_) => ErrorCode::UnsupportedProtocol,
            ServerError::Execution(_) => ErrorCode::ServerError,
            ServerError::Timeout => ErrorCode::GatewayTimeout,
            ServerError::ConnectionClosed => ErrorCode::ServerError,
            ServerError::ShuttingDown => ErrorCode::ServerError,
        }
    }

    /// Returns whether this error is retryable.
    pub fn is_retryable(&self) -> bool {
        self.error_code().is_retryable()
    }
}

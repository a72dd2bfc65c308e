//! Protocol error types and session-level status codes.

use crate::frame::FrameKind;
use std::fmt;
use thiserror::Error;

/// Errors raised while framing, classifying or decoding a frame.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: usize, max: usize },

    #[error("empty frame")]
    EmptyFrame,

    #[error("unrecognized frame starting with {0:?}")]
    UnknownFrame(String),

    #[error("unexpected {0} frame")]
    UnexpectedFrame(FrameKind),

    #[error("length prefix mismatch: declared {declared}, got {actual}")]
    LengthMismatch { declared: usize, actual: usize },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid UTF-8 in payload")]
    InvalidUtf8,
}

/// Stable session-level status codes.
///
/// These travel inside a status frame, never inside a logical response, and
/// their numeric values are part of the protocol contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    /// The handshake could not be decoded.
    BadRequest,
    /// A frame was malformed or misrouted.
    ProtocolError,
    /// A batch named an identity other than the active one.
    NotAllowed,
    /// The handshake asked for a protocol version this peer does not speak.
    UnsupportedProtocol,
    /// A downstream call failed.
    ServerError,
    /// A downstream call did not finish in time.
    GatewayTimeout,
}

impl ErrorCode {
    /// Numeric status carried on the wire.
    pub fn status_code(&self) -> u16 {
        match self {
            ErrorCode::BadRequest => 400,
            ErrorCode::ProtocolError => 500,
            ErrorCode::ServerError => 500,
            ErrorCode::NotAllowed => 503,
            ErrorCode::GatewayTimeout => 504,
            ErrorCode::UnsupportedProtocol => 505,
        }
    }

    /// Reason phrase carried next to the status code.
    pub fn reason_phrase(&self) -> &'static str {
        match self {
            ErrorCode::BadRequest => "Bad Request",
            ErrorCode::ProtocolError => "Protocol Error",
            ErrorCode::NotAllowed => "Not Allowed",
            ErrorCode::UnsupportedProtocol => "Unsupported Protocol",
            ErrorCode::ServerError => "Server Error",
            ErrorCode::GatewayTimeout => "Gateway Timeout",
        }
    }

    /// Returns whether this error is potentially retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ErrorCode::ServerError | ErrorCode::GatewayTimeout)
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCode::BadRequest => write!(f, "BAD_REQUEST"),
            ErrorCode::ProtocolError => write!(f, "PROTOCOL_ERROR"),
            ErrorCode::NotAllowed => write!(f, "NOT_ALLOWED"),
            ErrorCode::UnsupportedProtocol => write!(f, "UNSUPPORTED_PROTOCOL"),
            ErrorCode::ServerError => write!(f, "SERVER_ERROR"),
            ErrorCode::GatewayTimeout => write!(f, "GATEWAY_TIMEOUT"),
        }
    }
}

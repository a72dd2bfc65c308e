//! # wiremux-protocol
//!
//! Wire protocol for wiremux, a request/response multiplexer that carries many
//! HTTP-style exchanges over one long-lived connection.
//!
//! This crate provides:
//! - Envelope types for handshakes, batches, status, heartbeat and close frames
//! - Cheap prefix classification of inbound frames before full decode
//! - JSON encoding/decoding plus the optional length-tracking delimiter
//! - Session-level status codes and protocol errors

pub mod codec;
pub mod error;
pub mod frame;
pub mod message;

pub use codec::{Decoder, Encoder};
pub use error::{ErrorCode, ProtocolError};
pub use frame::{ClientFrame, FrameKind, ServerFrame};
pub use message::{
    Close, CloseMessage, Handshake, HandshakeMessage, Header, Heartbeat, QueryParam, Request,
    RequestMessage, Response, ResponseMessage, Status, StatusMessage,
};

/// Protocol name announced in every handshake.
pub const PROTOCOL_NAME: &str = "wiremux";

/// Protocol version supported by this implementation.
pub const PROTOCOL_VERSION: &str = "1.0";

/// Content type assumed when a request does not name one.
pub const DEFAULT_DATA_FORMAT: &str = "application/json";

/// Default port for the streaming TCP server.
pub const DEFAULT_PORT: u16 = 7420;

/// Maximum size of a single frame (16 MiB).
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

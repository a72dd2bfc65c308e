//! # wiremux-client
//!
//! Client library for wiremux.
//!
//! This crate provides:
//! - A connection-level session state machine (handshake, active, closed)
//! - A concurrent pending-call table correlating responses to requests
//! - A batch dispatcher with synchronous, future-based and typed forms
//! - Transport adapters for byte streams and message channels

pub mod client;
pub mod connection;
pub mod error;
pub mod pending;
pub mod session;
pub mod transport;

pub use client::Client;
pub use connection::{Connection, ConnectionConfig};
pub use error::ClientError;
pub use pending::{PendingCall, PendingCallTable};
pub use session::{ClientSession, SessionState};
pub use transport::{ChannelTransport, StreamTransport, Transport};

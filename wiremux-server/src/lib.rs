//! # wiremux-server
//!
//! Server side of wiremux.
//!
//! This crate provides:
//! - Per-connection sessions with identity issue and validation
//! - Batch routing to a pluggable executor with per-call timeouts
//! - Streaming and batching response aggregation
//! - Heartbeats for streaming connections
//! - A long-poll session registry with bounded parking
//! - A line-delimited TCP server

pub mod aggregator;
pub mod config;
pub mod error;
pub mod executor;
pub mod handler;
pub mod heartbeat;
pub mod longpoll;
pub mod parking;
pub mod router;
pub mod server;
pub mod session;

pub use aggregator::BatchAggregator;
pub use config::{Config, NetworkConfig, ProtocolConfig};
pub use error::ServerError;
pub use executor::{CallContext, EchoExecutor, Executor};
pub use handler::{Action, SessionHandler};
pub use heartbeat::HeartbeatScheduler;
pub use longpoll::{LongPollRegistry, LongPollSession};
pub use parking::PollQueue;
pub use router::{ResponseSink, Router};
pub use server::{Server, ServerConfig};
pub use session::{Session, SessionState, TransportMode};

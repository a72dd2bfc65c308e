//! Heartbeat scheduler for streaming sessions.

use crate::error::ServerError;
use crate::router::ResponseSink;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use wiremux_protocol::{Encoder, Heartbeat};

/// Emits a heartbeat frame at a fixed interval while a session is active.
///
/// The marker is the number of nanoseconds since the scheduler started, so it
/// only ever grows. The task ends on the first failed write; that error is
/// what [`HeartbeatScheduler::failed`] resolves to. Dropping the scheduler
/// stops it.
pub struct HeartbeatScheduler {
    handle: JoinHandle<ServerError>,
}

impl HeartbeatScheduler {
    pub fn start(identity: String, interval: Duration, sink: Arc<dyn ResponseSink>) -> Self {
        let handle = tokio::spawn(async move {
            let started = Instant::now();
            let mut ticker = tokio::time::interval_at(started + interval, interval);
            loop {
                ticker.tick().await;
                let marker = started.elapsed().as_nanos().to_string();
                let frame = match Encoder::encode_heartbeat(&Heartbeat::new(marker, &identity)) {
                    Ok(frame) => frame,
                    Err(e) => return ServerError::Protocol(e),
                };
                if let Err(e) = sink.send_frame(frame).await {
                    tracing::debug!("Heartbeat for {} failed: {}", identity, e);
                    return e;
                }
            }
        });
        Self { handle }
    }

    /// Resolves once emitting a heartbeat has failed.
    pub async fn failed(&mut self) -> ServerError {
        match (&mut self.handle).await {
            Ok(e) => e,
            Err(_) => ServerError::ConnectionClosed,
        }
    }

    pub fn stop(&self) {
        self.handle.abort();
    }

    pub fn is_running(&self) -> bool {
        !self.handle.is_finished()
    }
}

impl Drop for HeartbeatScheduler {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

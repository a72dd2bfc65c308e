//! Long-poll sessions.
//!
//! A long-poll peer has no channel the server can write to on its own. It
//! posts frames (handshake, batches, close) and separately fetches whatever
//! the server has for it. Fetches park in a [`PollQueue`] until a result is
//! ready; if none arrives within the park timeout the fetch is answered with a
//! heartbeat so the peer can poll again.

use crate::config::ProtocolConfig;
use crate::error::ServerError;
use crate::handler::{Action, SessionHandler};
use crate::parking::PollQueue;
use crate::router::{ResponseSink, Router};
use crate::session::{Session, TransportMode};
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use wiremux_protocol::{Encoder, ErrorCode, Heartbeat, StatusMessage};

/// Hands response envelopes to the next fetch.
struct PollQueueSink {
    queue: Arc<PollQueue>,
    delivery_timeout: Duration,
}

#[async_trait]
impl ResponseSink for PollQueueSink {
    async fn send_frame(&self, frame: Bytes) -> Result<(), ServerError> {
        self.queue.deliver(frame, self.delivery_timeout).await
    }

    fn discard_pending(&self) {
        self.queue.reset();
    }
}

/// One long-poll session.
pub struct LongPollSession {
    identity: RwLock<String>,
    handler: tokio::sync::Mutex<SessionHandler>,
    queue: Arc<PollQueue>,
    park_timeout: Duration,
    started: Instant,
    last_seen: Mutex<Instant>,
}

impl LongPollSession {
    fn new(
        identity: String,
        handler: SessionHandler,
        queue: Arc<PollQueue>,
        park_timeout: Duration,
    ) -> Self {
        let now = Instant::now();
        Self {
            identity: RwLock::new(identity),
            handler: tokio::sync::Mutex::new(handler),
            queue,
            park_timeout,
            started: now,
            last_seen: Mutex::new(now),
        }
    }

    pub fn identity(&self) -> String {
        self.identity.read().clone()
    }

    /// Fetches the next ready frame, or a heartbeat once the park timeout
    /// elapses.
    pub async fn poll(&self) -> Result<Bytes, ServerError> {
        self.touch();
        let frame = match self.queue.park(self.park_timeout).await? {
            Some(frame) => frame,
            None => {
                let marker = self.started.elapsed().as_nanos().to_string();
                Encoder::encode_heartbeat(&Heartbeat::new(marker, self.identity()))?
            }
        };
        self.touch();
        Ok(frame)
    }

    /// Feeds one posted frame to the session.
    async fn post(&self, body: &[u8]) -> Result<(Action, Option<String>), ServerError> {
        self.touch();
        let mut handler = self.handler.lock().await;
        let action = handler.handle_frame(body).await?;
        let identity = handler.session().identity().map(str::to_owned);
        Ok((action, identity))
    }

    fn touch(&self) {
        *self.last_seen.lock() = Instant::now();
    }

    /// Time since the peer last posted or fetched.
    pub fn idle_duration(&self) -> Duration {
        self.last_seen.lock().elapsed()
    }

    /// Frames waiting for a fetch.
    pub fn pending_frames(&self) -> usize {
        self.queue.ready()
    }

    fn close(&self) {
        self.queue.close();
    }
}

/// Registry of long-poll sessions keyed by identity.
pub struct LongPollRegistry {
    sessions: DashMap<String, Arc<LongPollSession>>,
    router: Arc<Router>,
    config: ProtocolConfig,
}

impl LongPollRegistry {
    pub fn new(router: Arc<Router>, config: ProtocolConfig) -> Self {
        Self {
            sessions: DashMap::new(),
            router,
            config,
        }
    }

    /// Opens a session from a posted handshake frame.
    ///
    /// Returns the status frame to answer with. The session is registered
    /// only when the handshake was accepted.
    pub async fn open(&self, body: &[u8]) -> Result<Bytes, ServerError> {
        let queue = Arc::new(PollQueue::new());
        let sink = Arc::new(PollQueueSink {
            queue: queue.clone(),
            delivery_timeout: self.config.delivery_timeout(),
        });
        let mut handler = SessionHandler::new(
            Session::new(TransportMode::Batching, None),
            self.router.clone(),
            sink,
            Duration::ZERO,
        );

        let reply = match handler.handle_frame(body).await? {
            Action::Reply(frame) => frame,
            Action::Nothing | Action::Close => return not_allowed(""),
        };

        if let Some(identity) = handler.session().identity().map(str::to_owned) {
            tracing::info!("Long-poll session {} opened", identity);
            let session = LongPollSession::new(
                identity.clone(),
                handler,
                queue,
                self.config.park_timeout(),
            );
            self.sessions.insert(identity, Arc::new(session));
        }
        Ok(reply)
    }

    /// Feeds a posted frame to the session named by `identity`.
    ///
    /// Returns the frame to answer the post with, if any. Results of posted
    /// batches are collected through [`LongPollRegistry::poll`].
    pub async fn post(&self, identity: &str, body: &[u8]) -> Result<Option<Bytes>, ServerError> {
        let Some(session) = self.session(identity) else {
            return not_allowed(identity).map(Some);
        };

        match session.post(body).await? {
            (Action::Close, _) => {
                self.remove(identity);
                Ok(None)
            }
            (Action::Reply(frame), Some(current)) if current != identity => {
                tracing::debug!("Long-poll session {} re-keyed as {}", identity, current);
                *session.identity.write() = current.clone();
                self.sessions.remove(identity);
                self.sessions.insert(current, session);
                Ok(Some(frame))
            }
            (Action::Reply(frame), _) => Ok(Some(frame)),
            (Action::Nothing, _) => Ok(None),
        }
    }

    /// Fetches the next frame for `identity`, parking until one is ready.
    pub async fn poll(&self, identity: &str) -> Result<Bytes, ServerError> {
        match self.session(identity) {
            Some(session) => session.poll().await,
            None => not_allowed(identity),
        }
    }

    pub fn session(&self, identity: &str) -> Option<Arc<LongPollSession>> {
        self.sessions.get(identity).map(|entry| entry.value().clone())
    }

    /// Removes a session and releases anything parked on it.
    pub fn remove(&self, identity: &str) -> bool {
        match self.sessions.remove(identity) {
            Some((_, session)) => {
                session.close();
                tracing::info!("Long-poll session {} closed", identity);
                true
            }
            None => false,
        }
    }

    /// Drops sessions the peer has not touched for `max_idle`.
    pub fn reap_idle(&self, max_idle: Duration) -> usize {
        let idle: Vec<String> = self
            .sessions
            .iter()
            .filter(|entry| entry.value().idle_duration() > max_idle)
            .map(|entry| entry.key().clone())
            .collect();
        idle.iter().filter(|identity| self.remove(identity)).count()
    }

    /// Closes every session.
    pub fn close_all(&self) {
        let identities: Vec<String> = self.sessions.iter().map(|e| e.key().clone()).collect();
        for identity in identities {
            self.remove(&identity);
        }
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

fn not_allowed(identity: &str) -> Result<Bytes, ServerError> {
    let status = StatusMessage::from_code(ErrorCode::NotAllowed, identity);
    Ok(Encoder::encode_status(&status)?)
}

//! Per-connection protocol handling.
//!
//! Transport-agnostic: the transport feeds inbound frames to
//! [`SessionHandler::handle_frame`] and writes back whatever [`Action`] says.
//! Frames produced later (responses, heartbeats) go through the session's
//! [`ResponseSink`].

use crate::error::ServerError;
use crate::heartbeat::HeartbeatScheduler;
use crate::router::{ResponseSink, Router};
use crate::session::{Session, TransportMode};
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use wiremux_protocol::{
    CloseMessage, Decoder, Encoder, ErrorCode, FrameKind, Handshake, Request, RequestMessage,
    ServerFrame, StatusMessage,
};

/// What the transport should do after a frame was handled.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    /// Nothing to write back.
    Nothing,
    /// Write this frame back to the peer.
    Reply(Bytes),
    /// The session is closed; drop the connection.
    Close,
}

/// Drives one session: handshake, batches, close.
pub struct SessionHandler {
    session: Session,
    router: Arc<Router>,
    sink: Arc<dyn ResponseSink>,
    heartbeat_interval: Duration,
    heartbeat: Option<HeartbeatScheduler>,
    calls: Vec<JoinHandle<()>>,
}

impl SessionHandler {
    /// Creates a handler. A zero heartbeat interval disables heartbeats.
    pub fn new(
        session: Session,
        router: Arc<Router>,
        sink: Arc<dyn ResponseSink>,
        heartbeat_interval: Duration,
    ) -> Self {
        Self {
            session,
            router,
            sink,
            heartbeat_interval,
            heartbeat: None,
            calls: Vec::new(),
        }
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Calls started and not yet finished.
    pub fn in_flight(&self) -> usize {
        self.calls.iter().filter(|h| !h.is_finished()).count()
    }

    /// Handles one inbound frame.
    ///
    /// Malformed frames are answered with a status frame; they never end the
    /// session.
    pub async fn handle_frame(&mut self, data: &[u8]) -> Result<Action, ServerError> {
        self.session.touch();

        let frame = match Decoder::decode_server(data) {
            Ok(frame) => frame,
            Err(e) => {
                let code = match Decoder::peek_kind(data) {
                    Ok(FrameKind::Handshake) => ErrorCode::BadRequest,
                    _ => ErrorCode::ProtocolError,
                };
                tracing::warn!("Rejecting frame ({}): {}", code, e);
                let identity = self.session.identity().unwrap_or_default().to_string();
                return self.status(code, identity);
            }
        };

        match frame {
            ServerFrame::Handshake(message) => self.on_handshake(message.handshake).await,
            ServerFrame::Requests(batch) => self.on_batch(batch).await,
            ServerFrame::Close(close) => Ok(self.on_close(close)),
        }
    }

    fn status(&self, code: ErrorCode, identity: String) -> Result<Action, ServerError> {
        let status = StatusMessage::from_code(code, identity);
        Ok(Action::Reply(Encoder::encode_status(&status)?))
    }

    async fn on_handshake(&mut self, handshake: Handshake) -> Result<Action, ServerError> {
        let previous = self.session.identity().map(str::to_owned);
        let identity = match self.session.accept_handshake(handshake) {
            Ok(identity) => identity,
            Err(e) => {
                tracing::warn!("Handshake rejected: {}", e);
                return self.status(e.error_code(), String::new());
            }
        };

        if let Some(previous) = previous {
            tracing::debug!("Identity {} superseded by {}", previous, identity);
            self.reset();
            self.sink.discard_pending();
        }
        tracing::info!("Session {} active ({:?})", identity, self.session.mode());

        if self.session.mode() == TransportMode::Streaming && !self.heartbeat_interval.is_zero() {
            self.heartbeat = Some(HeartbeatScheduler::start(
                identity.clone(),
                self.heartbeat_interval,
                self.sink.clone(),
            ));
        }

        let reply = Encoder::encode_status(&StatusMessage::ok(&identity))?;

        let delegated = self
            .session
            .handshake()
            .and_then(|handshake| delegated_request(&handshake));
        if let Some(request) = delegated {
            tracing::debug!("Running delegated handshake call {}", request.path);
            let batch = RequestMessage::new(identity, vec![request]);
            let handles = self
                .router
                .route(&self.session, batch, self.sink.clone())
                .await?;
            self.calls.extend(handles);
        }

        Ok(Action::Reply(reply))
    }

    async fn on_batch(&mut self, batch: RequestMessage) -> Result<Action, ServerError> {
        self.session.record_request();
        self.calls.retain(|h| !h.is_finished());

        match self
            .router
            .route(&self.session, batch, self.sink.clone())
            .await
        {
            Ok(handles) => {
                self.calls.extend(handles);
                Ok(Action::Nothing)
            }
            Err(ServerError::NotAllowed(identity)) => {
                tracing::warn!("Rejecting batch for identity {:?}", identity);
                self.status(ErrorCode::NotAllowed, identity)
            }
            Err(e) => Err(e),
        }
    }

    fn on_close(&mut self, close: CloseMessage) -> Action {
        if self.session.verify(close.identity()).is_err() {
            tracing::warn!("Ignoring close for unknown identity {:?}", close.identity());
            return Action::Nothing;
        }
        tracing::debug!("Session closed by peer: {}", close.close.reason);
        self.close();
        Action::Close
    }

    /// Resolves when a heartbeat could not be written. Pending otherwise.
    pub async fn heartbeat_failed(&mut self) -> ServerError {
        match self.heartbeat.as_mut() {
            Some(heartbeat) => {
                let e = heartbeat.failed().await;
                self.heartbeat = None;
                e
            }
            None => std::future::pending().await,
        }
    }

    /// Stops the heartbeat and abandons in-flight calls.
    fn reset(&mut self) {
        if let Some(heartbeat) = self.heartbeat.take() {
            heartbeat.stop();
        }
        for call in self.calls.drain(..) {
            call.abort();
        }
    }

    /// Closes the session and drops all per-session state.
    pub fn close(&mut self) {
        self.reset();
        if let Some(identity) = self.session.close() {
            tracing::debug!("Session {} closed", identity);
        }
    }
}

impl Drop for SessionHandler {
    fn drop(&mut self) {
        self.reset();
    }
}

/// Builds the call a handshake asks the server to run, if any.
fn delegated_request(handshake: &Handshake) -> Option<Request> {
    let path = handshake.path.clone()?;
    let mut request = Request::new(
        handshake.method.clone().unwrap_or_else(|| "POST".to_string()),
        path,
    )
    .with_data_format(handshake.data_format());
    request.uuid = handshake.uuid.clone();
    request.headers = handshake.headers.clone();
    request.query_string = handshake.query_string.clone();
    request.message_body = handshake.message_body.clone();
    Some(request)
}

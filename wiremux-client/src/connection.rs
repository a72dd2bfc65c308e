//! Connection management and batch dispatch.

use crate::error::ClientError;
use crate::pending::{decode_body, PendingCall, PendingCallTable};
use crate::session::{ClientSession, SessionState};
use crate::transport::Transport;
use futures::future::join_all;
use parking_lot::{Mutex as SyncMutex, RwLock};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, Mutex};
use wiremux_protocol::message::{Request, Response};
use wiremux_protocol::{
    ClientFrame, CloseMessage, Decoder, Encoder, Handshake, RequestMessage, ResponseMessage,
    StatusMessage, DEFAULT_DATA_FORMAT, DEFAULT_PORT,
};

/// Default read buffer size (8 KiB).
pub const DEFAULT_READ_BUFFER_SIZE: usize = 8 * 1024;

/// Minimum read buffer size (1 KiB).
pub const MIN_READ_BUFFER_SIZE: usize = 1024;

/// Maximum read buffer size (1 MiB).
pub const MAX_READ_BUFFER_SIZE: usize = 1024 * 1024;

/// Reason sent in a client-initiated close notice.
const CLOSE_REASON: &str = "Closed";

/// Connection configuration.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Server address.
    pub addr: SocketAddr,
    /// Bound on connecting plus the handshake round trip.
    pub connect_timeout: Duration,
    /// Bound on waiting for the responses of one `send`.
    pub request_timeout: Duration,
    /// Read buffer size for socket reads.
    pub read_buffer_size: usize,
    /// Default data format announced in the handshake.
    pub data_format: String,
    /// Call the server should run on our behalf when the session opens.
    pub handshake_request: Option<Request>,
}

impl ConnectionConfig {
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            connect_timeout: Duration::from_secs(30),
            request_timeout: Duration::from_secs(30),
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
            data_format: DEFAULT_DATA_FORMAT.to_string(),
            handshake_request: None,
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_read_buffer_size(mut self, size: usize) -> Self {
        self.read_buffer_size = size.clamp(MIN_READ_BUFFER_SIZE, MAX_READ_BUFFER_SIZE);
        self
    }

    pub fn with_data_format(mut self, data_format: impl Into<String>) -> Self {
        self.data_format = data_format.into();
        self
    }

    pub fn with_handshake_request(mut self, request: Request) -> Self {
        self.handshake_request = Some(request);
        self
    }

    /// Builds the handshake announced when the session opens.
    pub fn handshake(&self) -> Handshake {
        match &self.handshake_request {
            Some(request) => Handshake::from_request(request),
            None => Handshake {
                data_format: self.data_format.clone(),
                ..Default::default()
            },
        }
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self::new(SocketAddr::from(([127, 0, 0, 1], DEFAULT_PORT)))
    }
}

/// One logical wiremux connection.
///
/// Owns the session state, the pending-call table and the send lock. The
/// transport's read side feeds it through [`Connection::on_frame`] and
/// [`Connection::on_disconnect`].
pub struct Connection {
    config: ConnectionConfig,
    /// Write side. Holding this lock is the send lock.
    writer: Mutex<Option<Arc<dyn Transport>>>,
    session: RwLock<ClientSession>,
    pending: PendingCallTable,
    /// Waiter for the status answering an in-flight handshake.
    handshake: SyncMutex<Option<oneshot::Sender<StatusMessage>>>,
}

impl Connection {
    /// Creates a new connection (not yet open).
    pub fn new(config: ConnectionConfig) -> Self {
        Self {
            config,
            writer: Mutex::new(None),
            session: RwLock::new(ClientSession::new()),
            pending: PendingCallTable::new(),
            handshake: SyncMutex::new(None),
        }
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    pub fn state(&self) -> SessionState {
        self.session.read().state()
    }

    /// Returns whether the session is active.
    pub fn is_connected(&self) -> bool {
        self.session.read().is_active()
    }

    /// Identity issued by the server for the active session.
    pub fn identity(&self) -> Option<String> {
        self.session.read().identity().map(str::to_owned)
    }

    /// Returns the number of calls awaiting a response.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Attaches a transport and performs the handshake.
    ///
    /// Fails with [`ClientError::AlreadyOpen`] without writing anything if a
    /// handshake is in flight or the session is already active.
    pub async fn open(
        &self,
        transport: Arc<dyn Transport>,
        handshake: Handshake,
    ) -> Result<String, ClientError> {
        self.begin_open()?;
        self.complete_open(transport, handshake).await
    }

    /// Claims the session for a handshake.
    ///
    /// Fails with [`ClientError::AlreadyOpen`] if a handshake is in flight or
    /// the session is active. A successful claim must be followed by
    /// [`Connection::complete_open`] or [`Connection::abort_open`].
    pub(crate) fn begin_open(&self) -> Result<(), ClientError> {
        self.session.write().begin_handshake()
    }

    /// Releases a claim taken by [`Connection::begin_open`] that never reached
    /// the wire.
    pub(crate) fn abort_open(&self) {
        self.abort_handshake();
    }

    /// Sends the handshake over `transport` and waits for the server's status.
    pub(crate) async fn complete_open(
        &self,
        transport: Arc<dyn Transport>,
        handshake: Handshake,
    ) -> Result<String, ClientError> {
        let (tx, rx) = oneshot::channel();
        *self.handshake.lock() = Some(tx);

        let encoded = match Encoder::encode_handshake(&handshake) {
            Ok(encoded) => encoded,
            Err(e) => {
                self.abort_handshake();
                return Err(e.into());
            }
        };

        {
            let mut writer = self.writer.lock().await;
            *writer = Some(transport.clone());
            tracing::debug!("Sending handshake ({} bytes)", encoded.len());
            if let Err(e) = transport.write(encoded).await {
                writer.take();
                drop(writer);
                self.abort_handshake();
                return Err(e);
            }
        }

        let status = match tokio::time::timeout(self.config.connect_timeout, rx).await {
            Ok(Ok(status)) => status,
            Ok(Err(_)) => {
                self.invalidate("disconnected during handshake").await;
                return Err(ClientError::ConnectionClosed);
            }
            Err(_) => {
                tracing::debug!("Handshake timeout");
                self.abort_handshake();
                self.release_transport().await;
                return Err(ClientError::Timeout);
            }
        };

        let result = self.session.write().complete_handshake(&status);
        match result {
            Ok(identity) => {
                tracing::debug!("Session active, identity={}", identity);
                Ok(identity)
            }
            Err(e) => {
                tracing::debug!("Handshake rejected: {}", e);
                self.release_transport().await;
                Err(e)
            }
        }
    }

    fn abort_handshake(&self) {
        self.handshake.lock().take();
        self.session.write().close();
    }

    async fn release_transport(&self) {
        if let Some(transport) = self.writer.lock().await.take() {
            let _ = transport.shutdown().await;
        }
    }

    /// Writes one batch and returns a pending call per request, in order.
    ///
    /// Identifiers are assigned to requests that lack one. The send lock is
    /// held only while registering and writing, never while waiting.
    pub async fn dispatch(
        &self,
        mut requests: Vec<Request>,
    ) -> Result<Vec<PendingCall>, ClientError> {
        let writer = self.writer.lock().await;
        let transport = writer.as_ref().ok_or(ClientError::NotConnected)?.clone();
        let identity = self.identity().ok_or(ClientError::NotConnected)?;

        let mut calls = Vec::with_capacity(requests.len());
        for request in &mut requests {
            let id = request
                .uuid
                .get_or_insert_with(|| uuid::Uuid::new_v4().to_string())
                .clone();
            calls.push(self.pending.register(id)?);
        }

        let batch = RequestMessage::new(identity, requests);
        let encoded = Encoder::encode_requests(&batch)?;
        tracing::debug!(
            "Dispatching batch of {} request(s) ({} bytes)",
            calls.len(),
            encoded.len()
        );

        if let Err(e) = transport.write(encoded).await {
            drop(writer);
            tracing::debug!("Write failed: {}", e);
            drop(calls);
            self.invalidate("write failed").await;
            return Err(e);
        }

        Ok(calls)
    }

    /// Sends a batch and waits for every response.
    ///
    /// Responses are returned in submission order, whatever order they
    /// arrived in. Bounded by the configured request timeout.
    pub async fn send(&self, requests: Vec<Request>) -> Result<Vec<Response>, ClientError> {
        let calls = self.dispatch(requests).await?;
        let responses = tokio::time::timeout(self.config.request_timeout, join_all(calls))
            .await
            .map_err(|_| {
                tracing::debug!("Batch timed out");
                ClientError::Timeout
            })?;
        responses.into_iter().collect()
    }

    /// Sends a single request and waits for its response.
    pub async fn send_one(&self, request: Request) -> Result<Response, ClientError> {
        self.send(vec![request])
            .await?
            .pop()
            .ok_or(ClientError::ConnectionClosed)
    }

    /// Sends a batch and decodes each body into `T`.
    ///
    /// Structured request bodies are sent as JSON text. The outer result fails
    /// for connection-level problems. Each inner result carries that call's
    /// own status or decoding failure.
    pub async fn send_typed<T: DeserializeOwned>(
        &self,
        requests: Vec<Request>,
    ) -> Result<Vec<Result<T, ClientError>>, ClientError> {
        let requests = requests.into_iter().map(text_body).collect();
        let responses = self.send(requests).await?;
        Ok(responses.into_iter().map(decode_body).collect())
    }

    /// Handles one inbound frame. Never fails; bad frames are logged and dropped.
    pub async fn on_frame(&self, data: &[u8]) {
        let frame = match Decoder::decode_client(data) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!("Dropping undecodable frame: {}", e);
                return;
            }
        };

        match frame {
            ClientFrame::Heartbeat(heartbeat) => {
                tracing::trace!("Heartbeat {}", heartbeat.heartbeat);
            }
            ClientFrame::Status(status) => self.on_status(status),
            ClientFrame::Responses(batch) => self.on_responses(batch),
            ClientFrame::Close(close) => {
                let current = self.session.read().matches(close.identity());
                if current {
                    tracing::debug!("Session closed by peer: {}", close.close.reason);
                    self.invalidate("closed by peer").await;
                } else {
                    tracing::warn!("Ignoring close for unknown identity {}", close.identity());
                }
            }
        }
    }

    fn on_status(&self, status: StatusMessage) {
        if let Some(tx) = self.handshake.lock().take() {
            let _ = tx.send(status);
            return;
        }
        tracing::error!(
            "Server reported status {} {} (identity={})",
            status.status.status_code,
            status.status.reason_phrase,
            status.identity
        );
    }

    fn on_responses(&self, batch: ResponseMessage) {
        if !self.session.read().matches(&batch.identity) {
            tracing::warn!(
                "Dropping {} response(s) for stale identity {}",
                batch.responses.len(),
                batch.identity
            );
            return;
        }

        for response in batch.responses {
            let id = response.uuid.clone();
            if !self.pending.resolve(response) {
                tracing::warn!("No pending call for response id={}", id);
            }
        }
    }

    /// Transport-level disconnect.
    pub async fn on_disconnect(&self) {
        self.invalidate("transport disconnected").await;
    }

    /// Closes the session and fails every outstanding call.
    async fn invalidate(&self, why: &str) {
        let previous = self.session.write().close();
        self.handshake.lock().take();
        self.writer.lock().await.take();
        let failed = self.pending.clear();
        if previous != SessionState::Closed || failed > 0 {
            tracing::debug!(
                "Session invalidated ({}), failed {} pending call(s)",
                why,
                failed
            );
        }
    }

    /// Sends a close notice and closes the session.
    pub async fn close(&self) -> Result<(), ClientError> {
        tracing::debug!("Closing connection...");
        let identity = self.identity();
        let previous = self.session.write().close();

        let transport = self.writer.lock().await.take();
        if let Some(transport) = transport {
            if let (SessionState::Active, Some(identity)) = (previous, identity) {
                let notice = Encoder::encode_close(&CloseMessage::new(CLOSE_REASON, identity))?;
                if let Err(e) = transport.write(notice).await {
                    tracing::debug!("Failed to send close notice: {}", e);
                }
            }
            let _ = transport.shutdown().await;
        }

        self.handshake.lock().take();
        let failed = self.pending.clear();
        tracing::debug!("Connection closed, failed {} pending call(s)", failed);
        Ok(())
    }
}

/// Replaces a structured body with its JSON text. Text and absent bodies are
/// left alone.
pub(crate) fn text_body(mut request: Request) -> Request {
    if let Some(body) = request.message_body.take() {
        request.message_body = Some(match body {
            Value::String(_) | Value::Null => body,
            other => Value::String(other.to_string()),
        });
    }
    request
}

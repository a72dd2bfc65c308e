//! High-level client API over TCP.

use crate::connection::{text_body, Connection, ConnectionConfig};
use crate::error::ClientError;
use crate::pending::PendingCall;
use crate::transport::{read_frames, StreamTransport};
use serde::de::DeserializeOwned;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use wiremux_protocol::message::{Request, Response};

/// High-level client for a wiremux server.
pub struct Client {
    conn: Arc<Connection>,
    reader: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl Client {
    /// Creates a new client with the given configuration.
    pub fn new(config: ConnectionConfig) -> Self {
        Self {
            conn: Arc::new(Connection::new(config)),
            reader: parking_lot::Mutex::new(None),
        }
    }

    /// Connects to the server and opens a session.
    ///
    /// Returns the session identity issued by the server.
    pub async fn connect(&self) -> Result<String, ClientError> {
        // Claimed before dialing so a rejected connect leaves the live stream alone.
        self.conn.begin_open()?;
        let config = self.conn.config().clone();
        tracing::debug!("Connecting to {}...", config.addr);

        let stream = match tokio::time::timeout(
            config.connect_timeout,
            TcpStream::connect(config.addr),
        )
        .await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                tracing::debug!("Connection failed: {}", e);
                self.conn.abort_open();
                return Err(ClientError::Io(e));
            }
            Err(_) => {
                tracing::debug!("Connection timeout");
                self.conn.abort_open();
                return Err(ClientError::Timeout);
            }
        };
        stream.set_nodelay(true).ok();

        let (read_half, write_half) = stream.into_split();
        let reader = tokio::spawn(read_frames(
            self.conn.clone(),
            read_half,
            config.read_buffer_size,
        ));
        if let Some(previous) = self.reader.lock().replace(reader) {
            previous.abort();
        }

        self.conn
            .complete_open(Arc::new(StreamTransport::new(write_half)), config.handshake())
            .await
    }

    /// Returns whether the session is active.
    pub fn is_connected(&self) -> bool {
        self.conn.is_connected()
    }

    /// Identity of the active session.
    pub fn identity(&self) -> Option<String> {
        self.conn.identity()
    }

    /// Closes the session.
    pub async fn close(&self) -> Result<(), ClientError> {
        self.conn.close().await
    }

    /// Returns the underlying connection.
    pub fn connection(&self) -> Arc<Connection> {
        self.conn.clone()
    }

    /// Sends a batch and waits for all responses, in submission order.
    pub async fn send(&self, requests: Vec<Request>) -> Result<Vec<Response>, ClientError> {
        self.conn.send(requests).await
    }

    /// Sends one request and waits for its response.
    pub async fn send_one(&self, request: Request) -> Result<Response, ClientError> {
        self.conn.send_one(request).await
    }

    /// Sends a batch and returns one pending call per request.
    pub async fn send_async(
        &self,
        requests: Vec<Request>,
    ) -> Result<Vec<PendingCall>, ClientError> {
        self.conn.dispatch(requests).await
    }

    /// Sends a batch and decodes every body into `T`.
    pub async fn send_typed<T: DeserializeOwned>(
        &self,
        requests: Vec<Request>,
    ) -> Result<Vec<Result<T, ClientError>>, ClientError> {
        self.conn.send_typed(requests).await
    }

    /// Sends one request and decodes its body into `T`.
    ///
    /// A structured request body is sent as JSON text.
    pub async fn call<T: DeserializeOwned>(&self, request: Request) -> Result<T, ClientError> {
        let mut calls = self.conn.dispatch(vec![text_body(request)]).await?;
        let call = calls.pop().ok_or(ClientError::ConnectionClosed)?;
        tokio::time::timeout(self.conn.config().request_timeout, call.typed())
            .await
            .map_err(|_| ClientError::Timeout)?
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        if let Some(reader) = self.reader.lock().take() {
            reader.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionState;
    use std::time::Duration;

    #[test]
    fn test_client_creation() {
        let client = Client::new(ConnectionConfig::default());
        assert!(!client.is_connected());
        assert_eq!(client.identity(), None);
    }

    #[tokio::test]
    async fn test_second_connect_leaves_handshake_alone() {
        use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
        use wiremux_protocol::{Encoder, StatusMessage};

        // Answers the handshake only after a delay.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (read_half, mut write_half) = stream.into_split();
            let mut lines = BufReader::new(read_half).lines();
            lines.next_line().await.unwrap();
            tokio::time::sleep(Duration::from_millis(300)).await;
            let status = Encoder::encode_status(&StatusMessage::ok("abc")).unwrap();
            write_half.write_all(&status).await.unwrap();
            write_half.write_all(b"\n").await.unwrap();
            while let Ok(Some(_)) = lines.next_line().await {}
        });

        let client = Arc::new(Client::new(
            ConnectionConfig::new(addr).with_connect_timeout(Duration::from_secs(2)),
        ));
        let first = {
            let client = client.clone();
            tokio::spawn(async move { client.connect().await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert!(matches!(client.connect().await, Err(ClientError::AlreadyOpen)));
        assert_eq!(first.await.unwrap().unwrap(), "abc");
        assert_eq!(client.identity().as_deref(), Some("abc"));
    }

    #[tokio::test]
    async fn test_failed_dial_releases_claim() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let client = Client::new(ConnectionConfig::new(addr));
        assert!(client.connect().await.is_err());
        assert_eq!(client.connection().state(), SessionState::Closed);
    }

    #[tokio::test]
    async fn test_send_before_connect() {
        let client = Client::new(ConnectionConfig::default());
        assert!(matches!(
            client.send_one(Request::get("/")).await,
            Err(ClientError::NotConnected)
        ));
    }
}

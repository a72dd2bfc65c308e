//! TCP server implementation.
//!
//! Each connection is a streaming session: frames are newline-delimited JSON
//! in both directions.

use crate::config::{Config, ProtocolConfig};
use crate::error::ServerError;
use crate::executor::Executor;
use crate::handler::{Action, SessionHandler};
use crate::router::{ResponseSink, Router};
use crate::session::{Session, TransportMode};
use async_trait::async_trait;
use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use wiremux_protocol::codec::jsonl::{self, LineDecoder};
use wiremux_protocol::DEFAULT_PORT;

/// Frames a connection may have queued for writing before producers wait.
const OUTBOUND_CAPACITY: usize = 256;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to.
    pub bind_addr: SocketAddr,
    /// Idle connection timeout.
    pub idle_timeout: Duration,
    /// Maximum concurrent connections.
    pub max_connections: usize,
    /// Session timings.
    pub protocol: ProtocolConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], DEFAULT_PORT)),
            idle_timeout: Duration::from_secs(300),
            max_connections: 1000,
            protocol: ProtocolConfig::default(),
        }
    }
}

impl ServerConfig {
    pub fn new(bind_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            ..Default::default()
        }
    }

    /// Builds the server configuration from a loaded [`Config`].
    pub fn from_config(config: &Config) -> Self {
        Self {
            bind_addr: config.network.bind_addr,
            idle_timeout: config.network.idle_timeout(),
            max_connections: config.network.max_connections,
            protocol: config.protocol.clone(),
        }
    }

    pub fn with_protocol(mut self, protocol: ProtocolConfig) -> Self {
        self.protocol = protocol;
        self
    }

    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }
}

/// Server statistics.
#[derive(Debug, Default)]
pub struct ServerStats {
    pub connections_total: AtomicU64,
    pub connections_active: AtomicU64,
    pub frames_total: AtomicU64,
    pub errors_total: AtomicU64,
}

/// Writes frames produced off the read path into the connection's queue.
struct ConnectionSink {
    tx: mpsc::Sender<Bytes>,
}

#[async_trait]
impl ResponseSink for ConnectionSink {
    async fn send_frame(&self, frame: Bytes) -> Result<(), ServerError> {
        self.tx
            .send(frame)
            .await
            .map_err(|_| ServerError::ConnectionClosed)
    }
}

/// TCP server for wiremux.
pub struct Server {
    config: ServerConfig,
    router: Arc<Router>,
    stats: Arc<ServerStats>,
    shutdown: broadcast::Sender<()>,
    running: AtomicBool,
}

impl Server {
    /// Creates a new server running calls on `executor`.
    pub fn new(config: ServerConfig, executor: Arc<dyn Executor>) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        let router = Router::new(executor, config.protocol.call_timeout());
        Self {
            config,
            router: Arc::new(router),
            stats: Arc::new(ServerStats::default()),
            shutdown: shutdown_tx,
            running: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Router shared with other transports, such as long-poll.
    pub fn router(&self) -> Arc<Router> {
        self.router.clone()
    }

    /// Binds the configured address and runs the server.
    pub async fn run(&self) -> Result<(), ServerError> {
        let listener = TcpListener::bind(self.config.bind_addr).await?;
        self.serve(listener).await
    }

    /// Runs the server on an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), ServerError> {
        self.running.store(true, Ordering::SeqCst);
        tracing::info!("Server listening on {}", listener.local_addr()?);

        let mut shutdown_rx = self.shutdown.subscribe();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            if self.stats.connections_active.load(Ordering::Relaxed)
                                >= self.config.max_connections as u64
                            {
                                tracing::warn!("Connection limit reached, rejecting {}", addr);
                                continue;
                            }

                            self.stats.connections_total.fetch_add(1, Ordering::Relaxed);
                            self.stats.connections_active.fetch_add(1, Ordering::Relaxed);

                            let router = self.router.clone();
                            let stats = self.stats.clone();
                            let config = self.config.clone();
                            let mut conn_shutdown = self.shutdown.subscribe();

                            tokio::spawn(async move {
                                let result = Self::handle_connection(
                                    stream,
                                    addr,
                                    router,
                                    config,
                                    stats.clone(),
                                    &mut conn_shutdown,
                                )
                                .await;

                                if let Err(e) = result {
                                    tracing::debug!("Connection {} error: {}", addr, e);
                                    stats.errors_total.fetch_add(1, Ordering::Relaxed);
                                }

                                stats.connections_active.fetch_sub(1, Ordering::Relaxed);
                                tracing::info!("Client disconnected: {}", addr);
                            });
                        }
                        Err(e) => {
                            tracing::error!("Accept error: {}", e);
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    tracing::info!("Server shutting down");
                    break;
                }
            }
        }

        self.running.store(false, Ordering::SeqCst);
        Ok(())
    }

    /// Handles a single connection.
    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        router: Arc<Router>,
        config: ServerConfig,
        stats: Arc<ServerStats>,
        shutdown: &mut broadcast::Receiver<()>,
    ) -> Result<(), ServerError> {
        tracing::info!("Client connected: {}", addr);
        stream.set_nodelay(true)?;
        let (mut reader, mut writer) = stream.into_split();

        let (tx, mut outbound) = mpsc::channel::<Bytes>(OUTBOUND_CAPACITY);
        let sink: Arc<dyn ResponseSink> = Arc::new(ConnectionSink { tx });
        let mut handler = SessionHandler::new(
            Session::new(TransportMode::Streaming, Some(addr)),
            router,
            sink,
            config.protocol.heartbeat_interval(),
        );

        let mut decoder = LineDecoder::new();
        let mut buf = vec![0u8; 8192];

        loop {
            let idle_wait = config.idle_timeout.saturating_sub(handler.session().idle_duration());
            tokio::select! {
                biased;

                Some(frame) = outbound.recv() => {
                    tracing::trace!("[{}] Writing {} bytes", addr, frame.len());
                    writer.write_all(&jsonl::frame(&frame)).await?;
                }

                result = reader.read(&mut buf) => {
                    match result {
                        Ok(0) => {
                            tracing::debug!("[{}] Connection closed by client", addr);
                            return Ok(());
                        }
                        Ok(n) => {
                            tracing::trace!("[{}] Received {} bytes", addr, n);
                            decoder.extend(&buf[..n]);
                        }
                        Err(e) => {
                            tracing::debug!("[{}] Read error: {}", addr, e);
                            return Err(ServerError::Io(e));
                        }
                    }
                }

                e = handler.heartbeat_failed() => {
                    tracing::debug!("[{}] Heartbeat failed: {}", addr, e);
                    return Err(e);
                }

                // Measured from the last inbound frame; outbound heartbeats do not count.
                _ = tokio::time::sleep(idle_wait) => {
                    if handler.session().idle_duration() >= config.idle_timeout {
                        tracing::debug!("[{}] Idle timeout", addr);
                        return Ok(());
                    }
                }

                _ = shutdown.recv() => {
                    tracing::debug!("[{}] Shutdown signal received", addr);
                    handler.close();
                    return Err(ServerError::ShuttingDown);
                }
            }

            while let Some(line) = decoder.decode_line()? {
                stats.frames_total.fetch_add(1, Ordering::Relaxed);
                match handler.handle_frame(&line).await? {
                    Action::Nothing => {}
                    Action::Reply(frame) => {
                        writer.write_all(&jsonl::frame(&frame)).await?;
                    }
                    Action::Close => {
                        tracing::debug!("[{}] Session closed", addr);
                        return Ok(());
                    }
                }
            }
        }
    }

    /// Initiates server shutdown.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(());
    }

    /// Returns whether the server is running.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Returns server statistics.
    pub fn stats(&self) -> &ServerStats {
        &self.stats
    }
}

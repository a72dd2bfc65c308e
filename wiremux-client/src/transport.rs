//! Transport adapters.
//!
//! The connection never touches sockets directly. It writes whole frames through
//! a [`Transport`] and is fed inbound frames by whoever owns the read side.

use crate::connection::Connection;
use crate::error::ClientError;
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, Mutex};
use wiremux_protocol::codec::jsonl;

/// Write side of a connection. One call writes one complete frame.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn write(&self, frame: Bytes) -> Result<(), ClientError>;

    async fn shutdown(&self) -> Result<(), ClientError> {
        Ok(())
    }
}

/// Newline-delimited frames over a byte stream (TCP, pipes, duplex).
pub struct StreamTransport<W> {
    writer: Mutex<W>,
}

impl<W> StreamTransport<W>
where
    W: AsyncWrite + Unpin + Send,
{
    pub fn new(writer: W) -> Self {
        Self {
            writer: Mutex::new(writer),
        }
    }
}

#[async_trait]
impl<W> Transport for StreamTransport<W>
where
    W: AsyncWrite + Unpin + Send,
{
    async fn write(&self, frame: Bytes) -> Result<(), ClientError> {
        let mut writer = self.writer.lock().await;
        writer.write_all(&jsonl::frame(&frame)).await?;
        writer.flush().await?;
        Ok(())
    }

    async fn shutdown(&self) -> Result<(), ClientError> {
        self.writer.lock().await.shutdown().await?;
        Ok(())
    }
}

/// Message-oriented transport backed by a channel.
///
/// Fits transports that already preserve message boundaries, such as a
/// WebSocket sink driven by another task.
pub struct ChannelTransport {
    tx: mpsc::UnboundedSender<Bytes>,
}

impl ChannelTransport {
    /// Creates a transport and the receiver that observes its frames.
    pub fn pair() -> (Self, mpsc::UnboundedReceiver<Bytes>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl Transport for ChannelTransport {
    async fn write(&self, frame: Bytes) -> Result<(), ClientError> {
        self.tx
            .send(frame)
            .map_err(|_| ClientError::Transport("channel closed".to_string()))
    }
}

/// Reads newline-delimited frames and feeds them to the connection.
///
/// Runs until EOF or a read error, then reports the disconnect.
pub async fn read_frames<R>(conn: Arc<Connection>, mut reader: R, buffer_size: usize)
where
    R: AsyncRead + Unpin,
{
    let mut decoder = jsonl::LineDecoder::new();
    let mut buf = vec![0u8; buffer_size];

    'read: loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => {
                tracing::debug!("read_frames: connection closed by peer");
                break;
            }
            Ok(n) => n,
            Err(e) => {
                tracing::debug!("read_frames: read error: {}", e);
                break;
            }
        };

        decoder.extend(&buf[..n]);
        loop {
            match decoder.decode_line() {
                Ok(Some(frame)) => conn.on_frame(&frame).await,
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!("read_frames: unrecoverable framing error: {}", e);
                    break 'read;
                }
            }
        }
    }

    conn.on_disconnect().await;
}

//! Encoder and decoder for wiremux frames.

use crate::error::ProtocolError;
use crate::frame::{
    classify, split_length_prefix, ClientFrame, FrameKind, ServerFrame, LENGTH_DELIMITER,
};
use crate::message::{
    CloseMessage, Handshake, HandshakeMessage, Heartbeat, RequestMessage, ResponseMessage,
    StatusMessage,
};
use crate::MAX_FRAME_SIZE;
use bytes::Bytes;

/// Encodes messages into frame payloads.
pub struct Encoder;

impl Encoder {
    /// Encodes any JSON-serializable value into a frame payload.
    pub fn encode_json<T: serde::Serialize>(value: &T) -> Result<Bytes, ProtocolError> {
        let bytes = serde_json::to_vec(value)?;
        if bytes.len() > MAX_FRAME_SIZE {
            return Err(ProtocolError::FrameTooLarge {
                size: bytes.len(),
                max: MAX_FRAME_SIZE,
            });
        }
        Ok(Bytes::from(bytes))
    }

    pub fn encode_handshake(handshake: &Handshake) -> Result<Bytes, ProtocolError> {
        Self::encode_json(&HandshakeMessage::new(handshake.clone()))
    }

    pub fn encode_status(status: &StatusMessage) -> Result<Bytes, ProtocolError> {
        Self::encode_json(status)
    }

    pub fn encode_heartbeat(heartbeat: &Heartbeat) -> Result<Bytes, ProtocolError> {
        Self::encode_json(heartbeat)
    }

    pub fn encode_close(close: &CloseMessage) -> Result<Bytes, ProtocolError> {
        Self::encode_json(close)
    }

    pub fn encode_requests(batch: &RequestMessage) -> Result<Bytes, ProtocolError> {
        Self::encode_json(batch)
    }

    pub fn encode_responses(batch: &ResponseMessage) -> Result<Bytes, ProtocolError> {
        Self::encode_json(batch)
    }

    /// Prepends the length-tracking delimiter to an encoded payload.
    pub fn with_length_prefix(payload: &[u8]) -> Result<Bytes, ProtocolError> {
        let text = std::str::from_utf8(payload).map_err(|_| ProtocolError::InvalidUtf8)?;
        let framed = format!("{}{}{}", text.chars().count(), LENGTH_DELIMITER, text);
        Ok(Bytes::from(framed))
    }
}

/// Classifies and decodes inbound frames for either side of a connection.
pub struct Decoder;

impl Decoder {
    /// Validates size and encoding and strips the optional length prefix.
    fn payload(data: &[u8]) -> Result<&str, ProtocolError> {
        if data.len() > MAX_FRAME_SIZE {
            return Err(ProtocolError::FrameTooLarge {
                size: data.len(),
                max: MAX_FRAME_SIZE,
            });
        }
        let text = std::str::from_utf8(data).map_err(|_| ProtocolError::InvalidUtf8)?;
        split_length_prefix(text)
    }

    /// Returns the kind of a raw frame without decoding it.
    pub fn peek_kind(data: &[u8]) -> Result<FrameKind, ProtocolError> {
        classify(Self::payload(data)?)
    }

    /// Decodes a frame received by a client.
    pub fn decode_client(data: &[u8]) -> Result<ClientFrame, ProtocolError> {
        let payload = Self::payload(data)?;
        match classify(payload)? {
            FrameKind::Heartbeat => Ok(ClientFrame::Heartbeat(serde_json::from_str(payload)?)),
            FrameKind::Status => Ok(ClientFrame::Status(serde_json::from_str(payload)?)),
            FrameKind::Close => Ok(ClientFrame::Close(serde_json::from_str(payload)?)),
            FrameKind::Envelope => Ok(ClientFrame::Responses(serde_json::from_str(payload)?)),
            kind @ FrameKind::Handshake => Err(ProtocolError::UnexpectedFrame(kind)),
        }
    }

    /// Decodes a frame received by a server.
    pub fn decode_server(data: &[u8]) -> Result<ServerFrame, ProtocolError> {
        let payload = Self::payload(data)?;
        match classify(payload)? {
            FrameKind::Handshake => Ok(ServerFrame::Handshake(serde_json::from_str(payload)?)),
            FrameKind::Close => Ok(ServerFrame::Close(serde_json::from_str(payload)?)),
            FrameKind::Envelope => Ok(ServerFrame::Requests(serde_json::from_str(payload)?)),
            kind @ (FrameKind::Heartbeat | FrameKind::Status) => {
                Err(ProtocolError::UnexpectedFrame(kind))
            }
        }
    }
}

/// Newline-delimited framing for byte-stream transports.
pub mod jsonl {
    use super::*;
    use bytes::BytesMut;

    /// Encodes a value as a JSON line.
    pub fn encode<T: serde::Serialize>(value: &T) -> Result<Bytes, ProtocolError> {
        let mut bytes = serde_json::to_vec(value)?;
        bytes.push(b'\n');
        Ok(Bytes::from(bytes))
    }

    /// Appends the line terminator to an already encoded payload.
    pub fn frame(payload: &[u8]) -> Bytes {
        let mut buf = BytesMut::with_capacity(payload.len() + 1);
        buf.extend_from_slice(payload);
        buf.extend_from_slice(b"\n");
        buf.freeze()
    }

    /// Splits a byte stream into frame payloads.
    pub struct LineDecoder {
        buffer: BytesMut,
    }

    impl LineDecoder {
        pub fn new() -> Self {
            Self {
                buffer: BytesMut::with_capacity(8192),
            }
        }

        pub fn extend(&mut self, data: &[u8]) {
            self.buffer.extend_from_slice(data);
        }

        /// Returns the number of bytes currently buffered.
        pub fn buffered(&self) -> usize {
            self.buffer.len()
        }

        /// Returns the next complete line without its terminator.
        ///
        /// Blank lines are skipped.
        pub fn decode_line(&mut self) -> Result<Option<Bytes>, ProtocolError> {
            loop {
                let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') else {
                    if self.buffer.len() > MAX_FRAME_SIZE {
                        return Err(ProtocolError::FrameTooLarge {
                            size: self.buffer.len(),
                            max: MAX_FRAME_SIZE,
                        });
                    }
                    return Ok(None);
                };

                let mut line = self.buffer.split_to(pos + 1);
                line.truncate(pos);
                if line.last() == Some(&b'\r') {
                    line.truncate(pos - 1);
                }
                if line.iter().all(u8::is_ascii_whitespace) {
                    continue;
                }
                if line.len() > MAX_FRAME_SIZE {
                    return Err(ProtocolError::FrameTooLarge {
                        size: line.len(),
                        max: MAX_FRAME_SIZE,
                    });
                }
                return Ok(Some(line.freeze()));
            }
        }
    }

    impl Default for LineDecoder {
        fn default() -> Self {
            Self::new()
        }
    }
}

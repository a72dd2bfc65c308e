//! Frame classification.
//!
//! Each frame is a JSON object, optionally preceded by a length-tracking
//! delimiter of the form `<digits><->`. The kind of a frame is decided by a
//! cheap prefix check on its first key so that heartbeats and status frames
//! never pay for a full decode.

use crate::error::ProtocolError;
use crate::message::{
    CloseMessage, HandshakeMessage, Heartbeat, RequestMessage, ResponseMessage, StatusMessage,
};
use std::fmt;

/// Separator between a length prefix and the JSON payload.
pub const LENGTH_DELIMITER: &str = "<->";

/// Number of leading bytes inspected when classifying a frame.
const CLASSIFY_WINDOW: usize = 24;

/// Discriminated frame kinds, in classification priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameKind {
    Heartbeat,
    Status,
    Handshake,
    Close,
    /// Request or response batch.
    Envelope,
}

impl FrameKind {
    fn prefix(&self) -> Option<&'static str> {
        match self {
            FrameKind::Heartbeat => Some("{\"heartbeat\""),
            FrameKind::Status => Some("{\"status\""),
            FrameKind::Handshake => Some("{\"handshake\""),
            FrameKind::Close => Some("{\"close\""),
            FrameKind::Envelope => None,
        }
    }
}

impl fmt::Display for FrameKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrameKind::Heartbeat => write!(f, "heartbeat"),
            FrameKind::Status => write!(f, "status"),
            FrameKind::Handshake => write!(f, "handshake"),
            FrameKind::Close => write!(f, "close"),
            FrameKind::Envelope => write!(f, "envelope"),
        }
    }
}

/// Strips an optional `<digits><->` prefix and returns the JSON payload.
///
/// The declared length must equal the number of characters that follow the
/// delimiter.
pub fn split_length_prefix(text: &str) -> Result<&str, ProtocolError> {
    let digits = text.bytes().take_while(u8::is_ascii_digit).count();
    if digits == 0 || !text[digits..].starts_with(LENGTH_DELIMITER) {
        return Ok(text);
    }

    let payload = &text[digits + LENGTH_DELIMITER.len()..];
    let declared: usize = text[..digits]
        .parse()
        .map_err(|_| ProtocolError::UnknownFrame(text[..digits].to_string()))?;
    let actual = payload.chars().count();
    if declared != actual {
        return Err(ProtocolError::LengthMismatch { declared, actual });
    }
    Ok(payload)
}

/// Decides the kind of a frame from its leading bytes.
///
/// Whitespace inside the inspected window is ignored, so `{ "status" :` is
/// recognized the same as `{"status":`.
pub fn classify(payload: &str) -> Result<FrameKind, ProtocolError> {
    let trimmed = payload.trim_start();
    if trimmed.is_empty() {
        return Err(ProtocolError::EmptyFrame);
    }
    if !trimmed.starts_with('{') {
        let head: String = trimmed.chars().take(CLASSIFY_WINDOW).collect();
        return Err(ProtocolError::UnknownFrame(head));
    }

    let head: String = trimmed
        .chars()
        .take(CLASSIFY_WINDOW)
        .filter(|c| !c.is_whitespace())
        .collect();

    for kind in [
        FrameKind::Heartbeat,
        FrameKind::Status,
        FrameKind::Handshake,
        FrameKind::Close,
    ] {
        if let Some(prefix) = kind.prefix() {
            if head.starts_with(prefix) {
                return Ok(kind);
            }
        }
    }
    Ok(FrameKind::Envelope)
}

/// Frames a client can receive from a server.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientFrame {
    Heartbeat(Heartbeat),
    Status(StatusMessage),
    Responses(ResponseMessage),
    Close(CloseMessage),
}

impl ClientFrame {
    pub fn kind(&self) -> FrameKind {
        match self {
            ClientFrame::Heartbeat(_) => FrameKind::Heartbeat,
            ClientFrame::Status(_) => FrameKind::Status,
            ClientFrame::Responses(_) => FrameKind::Envelope,
            ClientFrame::Close(_) => FrameKind::Close,
        }
    }
}

/// Frames a server can receive from a client.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerFrame {
    Handshake(HandshakeMessage),
    Requests(RequestMessage),
    Close(CloseMessage),
}

impl ServerFrame {
    pub fn kind(&self) -> FrameKind {
        match self {
            ServerFrame::Handshake(_) => FrameKind::Handshake,
            ServerFrame::Requests(_) => FrameKind::Envelope,
            ServerFrame::Close(_) => FrameKind::Close,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_each_kind() {
        assert_eq!(
            classify(r#"{"heartbeat":"1","identity":"a"}"#).unwrap(),
            FrameKind::Heartbeat
        );
        assert_eq!(
            classify(r#"{"status":{"statusCode":200}}"#).unwrap(),
            FrameKind::Status
        );
        assert_eq!(
            classify(r#"{"handshake":{}}"#).unwrap(),
            FrameKind::Handshake
        );
        assert_eq!(classify(r#"{"close":{}}"#).unwrap(), FrameKind::Close);
        assert_eq!(
            classify(r#"{"identity":"a","requests":[]}"#).unwrap(),
            FrameKind::Envelope
        );
    }

    #[test]
    fn test_classify_ignores_whitespace() {
        assert_eq!(
            classify(r#"  { "status" : {"statusCode":200}}"#).unwrap(),
            FrameKind::Status
        );
        assert_eq!(
            classify("{\n\t\"heartbeat\" : \"5\"}").unwrap(),
            FrameKind::Heartbeat
        );
    }

    #[test]
    fn test_classify_rejects_garbage() {
        assert!(matches!(classify(""), Err(ProtocolError::EmptyFrame)));
        assert!(matches!(classify("   "), Err(ProtocolError::EmptyFrame)));
        assert!(matches!(
            classify("hello"),
            Err(ProtocolError::UnknownFrame(_))
        ));
    }

    #[test]
    fn test_length_prefix_stripped() {
        let body = r#"{"heartbeat":"1"}"#;
        let framed = format!("{}<->{}", body.len(), body);
        assert_eq!(split_length_prefix(&framed).unwrap(), body);
    }

    #[test]
    fn test_length_prefix_absent() {
        let body = r#"{"close":{}}"#;
        assert_eq!(split_length_prefix(body).unwrap(), body);
        // Digits without the delimiter are left alone.
        assert_eq!(split_length_prefix("123").unwrap(), "123");
    }

    #[test]
    fn test_length_prefix_mismatch() {
        let err = split_length_prefix(r#"99<->{"close":{}}"#).unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::LengthMismatch {
                declared: 99,
                actual: 12
            }
        ));
    }

    #[test]
    fn test_length_prefix_counts_chars() {
        let body = r#"{"heartbeat":"é"}"#;
        let framed = format!("{}<->{}", body.chars().count(), body);
        assert_eq!(split_length_prefix(&framed).unwrap(), body);
    }
}

//! Session management.

use crate::error::ServerError;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use uuid::Uuid;
use wiremux_protocol::{Handshake, PROTOCOL_VERSION};

/// How responses travel back to the peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransportMode {
    /// Full-duplex transport; each response is flushed on its own.
    #[default]
    Streaming,
    /// Request/response transport; a batch is answered by one envelope.
    Batching,
}

/// Session state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Connected, no accepted handshake yet.
    AwaitingHandshake,
    /// Handshake accepted, identity issued.
    Active,
    /// Closed by the peer or the server.
    Closed,
}

/// A server-side session.
pub struct Session {
    /// Remote address, when the transport has one.
    pub remote_addr: Option<SocketAddr>,

    mode: TransportMode,
    state: SessionState,
    identity: Option<String>,

    /// Handshake that opened the current identity.
    handshake: Option<Arc<Handshake>>,

    /// Batches received under the current identity.
    request_count: AtomicU64,

    created_at: Instant,
    last_activity: parking_lot::Mutex<Instant>,
}

impl Session {
    /// Creates a new session.
    pub fn new(mode: TransportMode, remote_addr: Option<SocketAddr>) -> Self {
        Self {
            remote_addr,
            mode,
            state: SessionState::AwaitingHandshake,
            identity: None,
            handshake: None,
            request_count: AtomicU64::new(0),
            created_at: Instant::now(),
            last_activity: parking_lot::Mutex::new(Instant::now()),
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn mode(&self) -> TransportMode {
        self.mode
    }

    /// Returns the active identity.
    pub fn identity(&self) -> Option<&str> {
        match self.state {
            SessionState::Active => self.identity.as_deref(),
            _ => None,
        }
    }

    /// Returns the handshake that opened the active identity.
    pub fn handshake(&self) -> Option<Arc<Handshake>> {
        self.handshake.clone()
    }

    /// Accepts a handshake and issues a fresh identity.
    ///
    /// Any previous identity is discarded. Fails when the peer speaks another
    /// protocol version; the session state is left unchanged in that case.
    pub fn accept_handshake(&mut self, handshake: Handshake) -> Result<String, ServerError> {
        if handshake.protocol_version.trim() != PROTOCOL_VERSION {
            return Err(ServerError::UnsupportedProtocol(
                handshake.protocol_version.clone(),
            ));
        }

        let identity = Uuid::new_v4().to_string();
        self.identity = Some(identity.clone());
        self.handshake = Some(Arc::new(handshake));
        self.state = SessionState::Active;
        self.request_count.store(0, Ordering::Relaxed);
        self.touch();
        Ok(identity)
    }

    /// Checks that `identity` names the active session.
    pub fn verify(&self, identity: &str) -> Result<(), ServerError> {
        match self.identity() {
            Some(active) if active == identity => Ok(()),
            _ => Err(ServerError::NotAllowed(identity.to_string())),
        }
    }

    /// Closes the session. Returns the identity that was active, if any.
    pub fn close(&mut self) -> Option<String> {
        let previous = self.identity().map(str::to_owned);
        self.state = SessionState::Closed;
        self.identity = None;
        self.handshake = None;
        previous
    }

    /// Records an inbound batch.
    pub fn record_request(&self) {
        self.request_count.fetch_add(1, Ordering::Relaxed);
        self.touch();
    }

    /// Marks the session as active now.
    pub fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    /// Returns the request count.
    pub fn request_count(&self) -> u64 {
        self.request_count.load(Ordering::Relaxed)
    }

    /// Returns the time since last activity.
    pub fn idle_duration(&self) -> Duration {
        self.last_activity.lock().elapsed()
    }

    /// Returns the session age.
    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_creation() {
        let session = Session::new(TransportMode::Streaming, None);
        assert_eq!(session.state(), SessionState::AwaitingHandshake);
        assert_eq!(session.identity(), None);
        assert!(session.verify("").is_err());
    }

    #[test]
    fn test_handshake_issues_identity() {
        let mut session = Session::new(TransportMode::Batching, None);
        let identity = session.accept_handshake(Handshake::default()).unwrap();

        assert_eq!(session.state(), SessionState::Active);
        assert_eq!(session.identity(), Some(identity.as_str()));
        assert!(session.verify(&identity).is_ok());
        assert!(matches!(
            session.verify("other"),
            Err(ServerError::NotAllowed(_))
        ));
        assert_eq!(session.mode(), TransportMode::Batching);
    }

    #[test]
    fn test_rehandshake_reissues_identity() {
        let mut session = Session::new(TransportMode::Streaming, None);
        let first = session.accept_handshake(Handshake::default()).unwrap();
        session.record_request();

        let second = session.accept_handshake(Handshake::default()).unwrap();
        assert_ne!(first, second);
        assert!(session.verify(&first).is_err());
        assert!(session.verify(&second).is_ok());
        assert_eq!(session.request_count(), 0);
    }

    #[test]
    fn test_unsupported_version() {
        let mut session = Session::new(TransportMode::Streaming, None);
        let handshake = Handshake {
            protocol_version: "2.0".to_string(),
            ..Default::default()
        };
        assert!(matches!(
            session.accept_handshake(handshake),
            Err(ServerError::UnsupportedProtocol(v)) if v == "2.0"
        ));
        assert_eq!(session.state(), SessionState::AwaitingHandshake);
    }

    #[test]
    fn test_close() {
        let mut session = Session::new(TransportMode::Streaming, None);
        let identity = session.accept_handshake(Handshake::default()).unwrap();
        assert_eq!(session.close(), Some(identity.clone()));
        assert_eq!(session.state(), SessionState::Closed);
        assert!(session.verify(&identity).is_err());
        assert!(session.handshake().is_none());
        assert_eq!(session.close(), None);
    }
}

//! Client-side session state machine.

use crate::error::ClientError;
use wiremux_protocol::StatusMessage;

/// Connection lifecycle as seen by the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No handshake has been attempted yet.
    Disconnected,
    /// Handshake sent, waiting for the server's status.
    Handshaking,
    /// Handshake accepted, identity assigned.
    Active,
    /// Closed by either side or by a transport failure.
    Closed,
}

/// Tracks the handshake state and the identity issued by the server.
///
/// The identity is only exposed while the session is active. Closing or
/// re-handshaking discards it, so responses carrying an older identity can
/// never match.
#[derive(Debug)]
pub struct ClientSession {
    state: SessionState,
    identity: Option<String>,
}

impl ClientSession {
    pub fn new() -> Self {
        Self {
            state: SessionState::Disconnected,
            identity: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_active(&self) -> bool {
        self.state == SessionState::Active
    }

    /// Returns the current identity while active.
    pub fn identity(&self) -> Option<&str> {
        match self.state {
            SessionState::Active => self.identity.as_deref(),
            _ => None,
        }
    }

    /// Returns whether `identity` names the active session.
    pub fn matches(&self, identity: &str) -> bool {
        self.identity() == Some(identity)
    }

    /// Enters `Handshaking`. Fails if a handshake is in flight or the session is open.
    pub fn begin_handshake(&mut self) -> Result<(), ClientError> {
        match self.state {
            SessionState::Handshaking | SessionState::Active => Err(ClientError::AlreadyOpen),
            SessionState::Disconnected | SessionState::Closed => {
                self.identity = None;
                self.state = SessionState::Handshaking;
                Ok(())
            }
        }
    }

    /// Applies the server's answer to the handshake.
    ///
    /// Codes below 400 activate the session with the returned identity; anything
    /// else closes it.
    pub fn complete_handshake(&mut self, status: &StatusMessage) -> Result<String, ClientError> {
        if self.state != SessionState::Handshaking {
            return Err(ClientError::NotConnected);
        }
        if status.is_success() {
            self.identity = Some(status.identity.clone());
            self.state = SessionState::Active;
            Ok(status.identity.clone())
        } else {
            self.close();
            Err(ClientError::HandshakeFailed {
                code: status.status.status_code,
                reason: status.status.reason_phrase.clone(),
            })
        }
    }

    /// Moves to `Closed` and forgets the identity. Returns the previous state.
    pub fn close(&mut self) -> SessionState {
        let previous = self.state;
        self.state = SessionState::Closed;
        self.identity = None;
        previous
    }
}

impl Default for ClientSession {
    fn default() -> Self {
        Self::new()
    }
}

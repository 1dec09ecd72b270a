//! Transport errors.

use std::io;

use termtalk_core::ProtocolError;
use thiserror::Error;

/// Errors that can occur during transport operations.
///
/// Every error ends the session it occurred on. The remote peer only ever
/// observes the connection closing.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Could not reach the remote address.
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// Protocol-level error from termtalk-core.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Socket error.
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    /// Peer closed the connection.
    #[error("peer disconnected")]
    PeerDisconnected,

    /// Session has been terminated or burned.
    #[error("session terminated")]
    SessionTerminated,
}

impl TransportError {
    /// The protocol error behind this one, if any.
    pub fn protocol(&self) -> Option<ProtocolError> {
        match self {
            Self::Protocol(e) => Some(*e),
            _ => None,
        }
    }

    /// Whether this error is a timeout (handshake or idle).
    pub fn is_timeout(&self) -> bool {
        matches!(
            self.protocol(),
            Some(ProtocolError::HandshakeTimeout | ProtocolError::IdleTimeout)
        )
    }
}

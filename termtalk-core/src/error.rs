//! Protocol errors.
//!
//! Every error is terminal for the connection it occurred on. Messages are
//! deliberately terse: they may end up in front of a remote peer's operator
//! and must not work as an oracle. Detailed reasons are logged locally.

use thiserror::Error;

/// All possible protocol errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ProtocolError {
    /// Key exchange failed: malformed or wrong-length peer key, a
    /// non-contributory shared secret, or a KDF failure.
    #[error("handshake failed")]
    HandshakeFailed,

    /// The peer did not complete the handshake within the deadline.
    #[error("handshake timeout")]
    HandshakeTimeout,

    /// A frame did not authenticate under the session key.
    ///
    /// Covers bad tags, truncated frames, bad encoding and wrong keys alike.
    #[error("authentication failed")]
    AuthenticationFailed,

    /// A frame exceeded the configured ceiling and was not decrypted.
    #[error("frame too large")]
    FrameTooLarge,

    /// Plaintext is empty.
    #[error("empty plaintext")]
    EmptyPlaintext,

    /// Plaintext does not fit in one frame.
    #[error("plaintext too large")]
    PlaintextTooLarge,

    /// Decrypted plaintext is not valid UTF-8.
    #[error("invalid utf-8")]
    InvalidUtf8,

    /// Operation not allowed in the current handshake state.
    #[error("unexpected state")]
    UnexpectedState,

    /// No frame arrived within the idle window.
    #[error("idle timeout")]
    IdleTimeout,

    /// The OS randomness source is unavailable.
    #[error("entropy source unavailable")]
    EntropyUnavailable,

    /// Session has already terminated.
    #[error("session terminated")]
    SessionTerminated,
}

//! Wire framing and bounds checking.
//!
//! Every unit on the wire is one base64 line:
//!
//! ```text
//! handshake:  base64( PUBLIC KEY (32B) )                         = 44 chars
//! message:    base64( NONCE (12B) | CIPHERTEXT (N B) | TAG (16B) )
//! ```
//!
//! The line terminator is added by the transport. Lengths are checked on
//! the encoded text first, so oversized input is rejected before any
//! decoding or decryption work is done.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use zeroize::Zeroizing;

use crate::error::ProtocolError;

/// X25519 public key length.
pub const PUBLIC_KEY_LEN: usize = 32;

/// Encoded length of a public key line (base64, padded).
pub const ENCODED_PUBLIC_KEY_LEN: usize = encoded_len(PUBLIC_KEY_LEN);

/// AEAD nonce width.
pub const NONCE_LEN: usize = 12;

/// AEAD tag width.
pub const TAG_LEN: usize = 16;

/// Per-frame overhead on top of the plaintext.
pub const FRAME_OVERHEAD: usize = NONCE_LEN + TAG_LEN;

/// Default ceiling for one decoded frame.
pub const DEFAULT_MAX_FRAME_LEN: usize = 64 * 1024;

/// Base64 length for `n` raw bytes (with padding).
pub const fn encoded_len(n: usize) -> usize {
    n.div_ceil(3) * 4
}

/// Longest line a peer may send when frames are capped at `max_frame_len`.
pub const fn max_line_len(max_frame_len: usize) -> usize {
    encoded_len(max_frame_len)
}

/// Largest plaintext that fits in a frame capped at `max_frame_len`.
pub const fn max_plaintext_len(max_frame_len: usize) -> usize {
    max_frame_len.saturating_sub(FRAME_OVERHEAD)
}

/// A decoded, not yet authenticated, message frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SealedFrame {
    nonce: [u8; NONCE_LEN],
    /// Ciphertext with the tag appended.
    body: Vec<u8>,
}

impl SealedFrame {
    /// Build a frame from its parts.
    pub fn new(nonce: [u8; NONCE_LEN], body: Vec<u8>) -> Self {
        Self { nonce, body }
    }

    /// Decode a wire line.
    ///
    /// # Errors
    ///
    /// - `FrameTooLarge` if the line implies a frame above `max_frame_len`.
    ///   Checked before decoding.
    /// - `AuthenticationFailed` for everything else (bad base64, frame
    ///   shorter than nonce + tag). Callers cannot tell these apart.
    pub fn decode(line: &str, max_frame_len: usize) -> Result<Self, ProtocolError> {
        if line.len() > max_line_len(max_frame_len) {
            return Err(ProtocolError::FrameTooLarge);
        }

        let raw = BASE64.decode(line.as_bytes()).map_err(|e| {
            tracing::debug!(error = %e, "frame is not valid base64");
            ProtocolError::AuthenticationFailed
        })?;

        if raw.len() > max_frame_len {
            return Err(ProtocolError::FrameTooLarge);
        }
        if raw.len() < FRAME_OVERHEAD {
            tracing::debug!(len = raw.len(), "frame shorter than nonce and tag");
            return Err(ProtocolError::AuthenticationFailed);
        }

        let mut nonce = [0u8; NONCE_LEN];
        nonce.copy_from_slice(&raw[..NONCE_LEN]);
        Ok(Self {
            nonce,
            body: raw[NONCE_LEN..].to_vec(),
        })
    }

    /// Encode to a wire line (without terminator).
    pub fn encode(&self) -> String {
        let mut raw = Vec::with_capacity(NONCE_LEN + self.body.len());
        raw.extend_from_slice(&self.nonce);
        raw.extend_from_slice(&self.body);
        BASE64.encode(raw)
    }

    /// The frame's nonce.
    pub fn nonce(&self) -> &[u8; NONCE_LEN] {
        &self.nonce
    }

    /// Ciphertext followed by the tag.
    pub fn body(&self) -> &[u8] {
        &self.body
    }
}

/// Encode a public key as a handshake line.
pub fn encode_public_key(key: &[u8; PUBLIC_KEY_LEN]) -> String {
    BASE64.encode(key)
}

/// Decode a handshake line into a public key.
///
/// The length is checked before decoding; anything other than exactly
/// [`ENCODED_PUBLIC_KEY_LEN`] characters that decode to exactly
/// [`PUBLIC_KEY_LEN`] bytes fails with `HandshakeFailed`.
pub fn decode_public_key(line: &str) -> Result<[u8; PUBLIC_KEY_LEN], ProtocolError> {
    if line.len() != ENCODED_PUBLIC_KEY_LEN {
        tracing::debug!(len = line.len(), "peer key line has wrong length");
        return Err(ProtocolError::HandshakeFailed);
    }

    let raw = Zeroizing::new(BASE64.decode(line.as_bytes()).map_err(|e| {
        tracing::debug!(error = %e, "peer key line is not valid base64");
        ProtocolError::HandshakeFailed
    })?);

    if raw.len() != PUBLIC_KEY_LEN {
        tracing::debug!(len = raw.len(), "peer key has wrong byte length");
        return Err(ProtocolError::HandshakeFailed);
    }

    let mut key = [0u8; PUBLIC_KEY_LEN];
    key.copy_from_slice(&raw);
    Ok(key)
}

/// Validate plaintext before encryption or after decryption.
///
/// # Errors
///
/// - `EmptyPlaintext` if empty
/// - `PlaintextTooLarge` if it cannot fit in one frame
/// - `InvalidUtf8` if not UTF-8
pub fn validate_plaintext(plaintext: &[u8], max_frame_len: usize) -> Result<&str, ProtocolError> {
    if plaintext.is_empty() {
        return Err(ProtocolError::EmptyPlaintext);
    }

    if plaintext.len() > max_plaintext_len(max_frame_len) {
        return Err(ProtocolError::PlaintextTooLarge);
    }

    std::str::from_utf8(plaintext).map_err(|_| ProtocolError::InvalidUtf8)
}

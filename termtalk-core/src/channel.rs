//! Authenticated encryption of application messages.
//!
//! ChaCha20-Poly1305 under the session key. Every frame carries a fresh
//! 12-byte nonce drawn from the OS CSPRNG; no counters, so nothing has to
//! survive a reconnect and ordering is never assumed.
//!
//! Decryption verifies the tag before any plaintext is returned. All
//! verification failures look the same to the caller.

use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use rand::rngs::OsRng;
use rand::RngCore;
use zeroize::Zeroizing;

use crate::error::ProtocolError;
use crate::frame::{validate_plaintext, SealedFrame, DEFAULT_MAX_FRAME_LEN, NONCE_LEN};
use crate::handshake::SessionKey;

/// Encrypting/decrypting end of one established session.
///
/// Owns the session key for the connection's lifetime. Not `Clone`.
pub struct SecureChannel {
    cipher: ChaCha20Poly1305,
    max_frame_len: usize,
}

impl SecureChannel {
    /// Build a channel with the default 64 KiB frame ceiling.
    pub fn new(key: SessionKey) -> Self {
        Self::with_max_frame_len(key, DEFAULT_MAX_FRAME_LEN)
    }

    /// Build a channel with a custom frame ceiling.
    pub fn with_max_frame_len(key: SessionKey, max_frame_len: usize) -> Self {
        let cipher = ChaCha20Poly1305::new(Key::from_slice(key.as_bytes()));
        // `key` drops here and zeroizes; the cipher keeps its own copy.
        Self {
            cipher,
            max_frame_len,
        }
    }

    /// Frame ceiling in decoded bytes.
    pub fn max_frame_len(&self) -> usize {
        self.max_frame_len
    }

    /// Encrypt a text message into a wire line.
    ///
    /// # Errors
    ///
    /// Rejects empty or oversized plaintext.
    pub fn encrypt_frame(&self, plaintext: &str) -> Result<String, ProtocolError> {
        validate_plaintext(plaintext.as_bytes(), self.max_frame_len)?;

        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);

        let body = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext.as_bytes())
            .map_err(|_| ProtocolError::PlaintextTooLarge)?;

        Ok(SealedFrame::new(nonce, body).encode())
    }

    /// Decrypt and authenticate a wire line.
    ///
    /// # Errors
    ///
    /// - `FrameTooLarge` before any decoding if the line is over the ceiling.
    /// - `AuthenticationFailed` for any decoding, length or tag failure, and
    ///   for authenticated plaintext that is not valid UTF-8.
    pub fn decrypt_frame(&self, line: &str) -> Result<Zeroizing<Vec<u8>>, ProtocolError> {
        let frame = SealedFrame::decode(line, self.max_frame_len)?;

        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(frame.nonce()), frame.body())
            .map(Zeroizing::new)
            .map_err(|_| {
                tracing::debug!("frame tag did not verify");
                ProtocolError::AuthenticationFailed
            })?;

        if let Err(e) = validate_plaintext(&plaintext, self.max_frame_len) {
            tracing::debug!(error = %e, "authenticated frame carried invalid plaintext");
            return Err(ProtocolError::AuthenticationFailed);
        }

        Ok(plaintext)
    }

    /// Decrypt a wire line into text.
    pub fn decrypt_text(&self, line: &str) -> Result<String, ProtocolError> {
        let plaintext = self.decrypt_frame(line)?;
        // validated as UTF-8 in decrypt_frame
        String::from_utf8(plaintext.to_vec()).map_err(|_| ProtocolError::AuthenticationFailed)
    }
}

impl std::fmt::Debug for SecureChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecureChannel")
            .field("max_frame_len", &self.max_frame_len)
            .finish_non_exhaustive()
    }
}

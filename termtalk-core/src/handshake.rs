//! Ephemeral X25519 handshake.
//!
//! One fixed suite: X25519 for agreement, HKDF-SHA256 for derivation. No
//! negotiation, no fallback. Each side sends its ephemeral public key once,
//! reads the peer's, and derives the session key.
//!
//! States:
//!
//! ```text
//! Idle → KeysGenerated → PublicKeySent → PeerKeyReceived → SecretDerived → SessionEstablished
//!   \__________________________ any error ______________________________→ Failed
//! ```
//!
//! This module does no I/O. The transport drives it and owns the deadline.

use std::fmt;

use hkdf::Hkdf;
use rand::rngs::OsRng;
use sha2::{Digest, Sha256};
use x25519_dalek::{EphemeralSecret, PublicKey};
use zeroize::Zeroizing;

use crate::error::ProtocolError;
use crate::frame::{decode_public_key, encode_public_key, PUBLIC_KEY_LEN};

/// HKDF info string. Versioned so a future suite derives unrelated keys.
pub const SESSION_KEY_CONTEXT: &[u8] = b"TermTalk v1 session key";

/// Session key length.
pub const SESSION_KEY_LEN: usize = 32;

/// Role in the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// The joining peer, who dialed.
    Initiator,
    /// The host, who accepted.
    Responder,
}

/// Handshake state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    /// Nothing generated yet.
    Idle,
    /// Ephemeral key pair exists.
    KeysGenerated,
    /// Our public key line has been handed out for sending.
    PublicKeySent,
    /// Peer public key passed validation.
    PeerKeyReceived,
    /// Shared secret computed, key pair consumed.
    SecretDerived,
    /// Session key handed to the caller. Terminal.
    SessionEstablished,
    /// Something went wrong. Terminal.
    Failed,
}

impl HandshakeState {
    /// Whether no further transitions are possible.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::SessionEstablished | Self::Failed)
    }
}

/// Symmetric session key. Zeroized on drop, never cloned.
pub struct SessionKey(Zeroizing<[u8; SESSION_KEY_LEN]>);

impl SessionKey {
    pub(crate) fn from_bytes(bytes: [u8; SESSION_KEY_LEN]) -> Self {
        Self(Zeroizing::new(bytes))
    }

    pub(crate) fn as_bytes(&self) -> &[u8; SESSION_KEY_LEN] {
        &self.0
    }
}

impl fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SessionKey([REDACTED])")
    }
}

/// Key-agreement primitive behind the handshake.
///
/// [`X25519`] is the only production implementation. The trait exists so
/// the state machine can be exercised with an instrumented primitive.
pub trait KeyAgreement: Sized {
    /// Generate a fresh ephemeral key pair.
    fn generate() -> Self;

    /// Public half, as sent on the wire.
    fn public_key(&self) -> [u8; PUBLIC_KEY_LEN];

    /// Consume the pair and compute the shared secret with `peer`.
    ///
    /// Returns `None` if the result is non-contributory.
    fn agree(self, peer: &[u8; PUBLIC_KEY_LEN]) -> Option<Zeroizing<[u8; 32]>>;
}

/// X25519 ephemeral key pair.
///
/// The secret half zeroizes on drop and is consumed by [`KeyAgreement::agree`].
pub struct X25519 {
    secret: EphemeralSecret,
    public: PublicKey,
}

impl KeyAgreement for X25519 {
    fn generate() -> Self {
        let secret = EphemeralSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    fn public_key(&self) -> [u8; PUBLIC_KEY_LEN] {
        self.public.to_bytes()
    }

    fn agree(self, peer: &[u8; PUBLIC_KEY_LEN]) -> Option<Zeroizing<[u8; 32]>> {
        let shared = self.secret.diffie_hellman(&PublicKey::from(*peer));
        if !shared.was_contributory() {
            return None;
        }
        Some(Zeroizing::new(*shared.as_bytes()))
    }
}

/// Handshake state machine for one connection attempt.
pub struct Handshake<K: KeyAgreement = X25519> {
    role: Role,
    state: HandshakeState,
    keypair: Option<K>,
    local_public: Option<[u8; PUBLIC_KEY_LEN]>,
    peer_public: Option<[u8; PUBLIC_KEY_LEN]>,
}

impl Handshake<X25519> {
    /// Start an X25519 handshake.
    pub fn new(role: Role) -> Self {
        Self::with_agreement(role)
    }
}

impl<K: KeyAgreement> Handshake<K> {
    /// Start a handshake over an arbitrary key-agreement primitive.
    pub fn with_agreement(role: Role) -> Self {
        Self {
            role,
            state: HandshakeState::Idle,
            keypair: None,
            local_public: None,
            peer_public: None,
        }
    }

    /// Current state.
    pub fn state(&self) -> HandshakeState {
        self.state
    }

    /// Our role.
    pub fn role(&self) -> Role {
        self.role
    }

    /// Whether the ephemeral key pair is still held.
    pub fn holds_keypair(&self) -> bool {
        self.keypair.is_some()
    }

    /// `Idle → KeysGenerated`.
    pub fn generate_keys(&mut self) -> Result<(), ProtocolError> {
        self.expect_state(HandshakeState::Idle)?;

        let keypair = K::generate();
        self.local_public = Some(keypair.public_key());
        self.keypair = Some(keypair);
        self.state = HandshakeState::KeysGenerated;
        Ok(())
    }

    /// `KeysGenerated → PublicKeySent`.
    ///
    /// Returns the line to send to the peer.
    pub fn public_key_line(&mut self) -> Result<String, ProtocolError> {
        self.expect_state(HandshakeState::KeysGenerated)?;

        let public = match self.local_public {
            Some(public) => public,
            None => return Err(self.fail_with(ProtocolError::UnexpectedState)),
        };
        self.state = HandshakeState::PublicKeySent;
        Ok(encode_public_key(&public))
    }

    /// `PublicKeySent → PeerKeyReceived`.
    ///
    /// The line is validated for exact length and encoding before the
    /// key-agreement primitive is touched.
    pub fn receive_peer_key(&mut self, line: &str) -> Result<(), ProtocolError> {
        self.expect_state(HandshakeState::PublicKeySent)?;

        match decode_public_key(line) {
            Ok(key) => {
                self.peer_public = Some(key);
                self.state = HandshakeState::PeerKeyReceived;
                Ok(())
            }
            Err(e) => Err(self.fail_with(e)),
        }
    }

    /// `PeerKeyReceived → SecretDerived → SessionEstablished`.
    ///
    /// Consumes the key pair whether or not derivation succeeds.
    pub fn derive_session_key(&mut self) -> Result<SessionKey, ProtocolError> {
        self.expect_state(HandshakeState::PeerKeyReceived)?;

        let (keypair, peer) = match (self.keypair.take(), self.peer_public) {
            (Some(k), Some(p)) => (k, p),
            _ => return Err(self.fail_with(ProtocolError::UnexpectedState)),
        };

        let shared = match keypair.agree(&peer) {
            Some(shared) => shared,
            None => {
                tracing::debug!("non-contributory shared secret");
                return Err(self.fail_with(ProtocolError::HandshakeFailed));
            }
        };
        self.state = HandshakeState::SecretDerived;

        let hkdf = Hkdf::<Sha256>::new(None, &shared[..]);
        let mut okm = Zeroizing::new([0u8; SESSION_KEY_LEN]);
        if hkdf.expand(SESSION_KEY_CONTEXT, &mut okm[..]).is_err() {
            return Err(self.fail_with(ProtocolError::HandshakeFailed));
        }

        self.state = HandshakeState::SessionEstablished;
        Ok(SessionKey::from_bytes(*okm))
    }

    /// Abort the handshake and drop any key material.
    ///
    /// No-op once established.
    pub fn fail(&mut self) {
        if self.state == HandshakeState::SessionEstablished {
            return;
        }
        self.keypair = None;
        self.state = HandshakeState::Failed;
    }

    /// Trust-on-first-use fingerprint.
    ///
    /// First 8 bytes of SHA256(initiator_pub || responder_pub) as hex. Both
    /// sides compute the same value; users may compare it out of band.
    /// Only available once established.
    pub fn fingerprint(&self) -> Option<String> {
        if self.state != HandshakeState::SessionEstablished {
            return None;
        }
        let local = self.local_public.as_ref()?;
        let peer = self.peer_public.as_ref()?;

        let mut hasher = Sha256::new();
        if self.role == Role::Initiator {
            hasher.update(local);
            hasher.update(peer);
        } else {
            hasher.update(peer);
            hasher.update(local);
        }
        let result = hasher.finalize();

        Some(hex::encode(&result[..8]))
    }

    fn expect_state(&mut self, expected: HandshakeState) -> Result<(), ProtocolError> {
        if self.state == expected {
            Ok(())
        } else {
            Err(self.fail_with(ProtocolError::UnexpectedState))
        }
    }

    fn fail_with(&mut self, error: ProtocolError) -> ProtocolError {
        self.fail();
        error
    }
}

impl<K: KeyAgreement> Drop for Handshake<K> {
    fn drop(&mut self) {
        if !self.state.is_terminal() {
            self.fail();
        }
    }
}

//! TermTalk Protocol Core
//!
//! I/O-free building blocks for the encrypted terminal chat.
//!
//! This crate provides:
//! - Ephemeral room and peer identifiers
//! - The X25519 handshake state machine and session key derivation
//! - Wire framing with strict bounds checking
//! - The AEAD secure channel
//!
//! # Security Invariants
//!
//! - One ephemeral key pair per handshake, consumed by key agreement
//! - Session keys are zeroized on drop and never cloned
//! - A fresh random nonce per frame
//! - Oversized input is rejected before decoding or decryption
//! - Failures are uniform towards the peer; reasons are only logged locally
//! - Direct use of `unsafe` is forbidden (#![forbid(unsafe_code)])

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::panic))]

pub mod channel;
pub mod error;
pub mod frame;
pub mod handshake;
pub mod identity;

pub use channel::SecureChannel;
pub use error::ProtocolError;
pub use frame::SealedFrame;
pub use handshake::{Handshake, HandshakeState, KeyAgreement, Role, SessionKey};
pub use identity::{PeerId, RoomId};

//! TermTalk Transport
//!
//! Async line-framed transport for TermTalk sessions.
//!
//! This crate wraps `termtalk-core` and provides a simple API for running
//! the key exchange over any byte stream and then exchanging sealed frames.
//!
//! # Security Invariants & Hard Failures
//!
//! Any error (protocol violation, failed authentication, timeout or
//! transport loss) results in **immediate session termination**.
//!
//! - **One Strike**: a frame that does not verify closes the session.
//! - **Bounded Reads**: lines longer than the frame ceiling are refused
//!   while buffering, before any decoding.
//! - **No Duplication**: `SecureSession` and `Message` do not implement `Clone`.
//! - **Zeroization**: key material and received plaintext are zeroized on drop.

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::panic))]

pub mod config;
pub mod dial;
pub mod error;
mod handshake;
mod link;
pub mod message;
pub mod session;

pub use config::{deadline_after, Role, SessionConfig};
pub use dial::{Dialer, Socks5Dialer, TcpDialer, DEFAULT_TOR_PORT};
pub use error::TransportError;
pub use message::Message;
pub use session::SecureSession;

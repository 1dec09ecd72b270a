//! TermTalk host.
//!
//! Accepts inbound connections for one room, gates them through admission
//! control, and tears everything down when the room expires or is closed.
//!
//! - [`admission`]: per-address and global ceilings, sliding-window rate limit
//! - [`room`]: room identity, TTL and membership
//! - [`registry`]: where joiners look a room up
//! - [`supervisor`]: accept loop and per-connection tasks
//! - [`host`]: everything above behind one handle

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]

pub mod admission;
pub mod config;
pub mod host;
pub mod registry;
pub mod room;
pub mod supervisor;

pub use admission::{AdmissionController, AdmissionLimits, AdmissionPermit, Rejection};
pub use config::{ConfigError, HostConfig};
pub use host::{Host, HostError};
pub use registry::{FileRegistry, MemoryRegistry, RegistryError, RegistryStore, RoomEntry};
pub use room::{Membership, Room, RoomError, RoomSettings, RoomState};
pub use supervisor::{
    ConnectionId, ConnectionRecord, ConnectionState, DisconnectReason, HostEvent,
};

//! Room lifecycle: identity, TTL, and live membership.
//!
//! ```text
//! Created ──activate()──> Active ──deadline──> Expired
//!                           └─────close()────> Closed
//! ```
//!
//! Expiry and close share one teardown. It flips the state under the
//! membership lock, so no join can land after it, then cancels every
//! member's token and waits for the members to leave.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use termtalk_core::{PeerId, RoomId};
use termtalk_transport::deadline_after;
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::registry::{RegistryError, RegistryStore, RoomEntry};

/// Lifecycle state of a room.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoomState {
    /// Built but not yet accepting members.
    Created,
    /// Accepting members until the deadline.
    Active,
    /// Torn down at the deadline.
    Expired,
    /// Torn down explicitly.
    Closed,
}

/// Errors from room operations.
#[derive(Debug, Error)]
pub enum RoomError {
    /// The room is not in the state the operation needs.
    #[error("room is {0:?}")]
    NotActive(RoomState),

    /// No free identifier after repeated draws.
    #[error("could not draw an unused identifier")]
    IdentifierExhausted,

    /// The registry refused the operation.
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

/// Where the room is advertised and how long it lives.
#[derive(Debug, Clone)]
pub struct RoomSettings {
    /// Address joiners should dial.
    pub host_address: String,
    /// Port joiners should dial.
    pub host_port: u16,
    /// Lifetime from activation.
    pub ttl: Duration,
    /// How long teardown waits for members to leave.
    pub drain_timeout: Duration,
}

struct Inner {
    state: RoomState,
    deadline: Option<Instant>,
    members: HashSet<PeerId>,
}

/// One hosted room.
pub struct Room {
    id: RoomId,
    settings: RoomSettings,
    inner: Mutex<Inner>,
    cancel: CancellationToken,
    torn_down: CancellationToken,
    member_count: watch::Sender<usize>,
    registry: Arc<dyn RegistryStore>,
}

impl Room {
    /// Create a room with an identifier the registry does not hold yet.
    pub fn new(
        settings: RoomSettings,
        registry: Arc<dyn RegistryStore>,
    ) -> Result<Arc<Self>, RoomError> {
        let id = RoomId::generate_unique(|candidate| registry.contains(candidate))
            .ok_or(RoomError::IdentifierExhausted)?;
        let (member_count, _) = watch::channel(0);

        Ok(Arc::new(Self {
            id,
            settings,
            inner: Mutex::new(Inner {
                state: RoomState::Created,
                deadline: None,
                members: HashSet::new(),
            }),
            cancel: CancellationToken::new(),
            torn_down: CancellationToken::new(),
            member_count,
            registry,
        }))
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Room identifier.
    pub fn id(&self) -> RoomId {
        self.id
    }

    /// Current state.
    pub fn state(&self) -> RoomState {
        self.lock().state
    }

    /// Whether the room accepts members.
    pub fn is_active(&self) -> bool {
        self.state() == RoomState::Active
    }

    /// Time left before expiry, once activated.
    pub fn remaining(&self) -> Option<Duration> {
        let deadline = self.lock().deadline?;
        Some(deadline.saturating_duration_since(Instant::now()))
    }

    /// Members currently in the room.
    pub fn member_count(&self) -> usize {
        *self.member_count.borrow()
    }

    /// Snapshot of member identifiers.
    pub fn members(&self) -> Vec<PeerId> {
        self.lock().members.iter().copied().collect()
    }

    /// Token cancelled when teardown starts.
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// `Created → Active`: advertise the room and start its timer.
    pub fn activate(self: &Arc<Self>) -> Result<(), RoomError> {
        let deadline = {
            let mut inner = self.lock();
            if inner.state != RoomState::Created {
                return Err(RoomError::NotActive(inner.state));
            }
            let deadline = deadline_after(Instant::now(), self.settings.ttl);
            inner.state = RoomState::Active;
            inner.deadline = Some(deadline);
            deadline
        };

        let entry = RoomEntry::new(
            self.settings.host_address.clone(),
            self.settings.host_port,
            self.settings.ttl,
        );
        if let Err(e) = self.registry.put(&self.id, entry) {
            self.lock().state = RoomState::Closed;
            self.cancel.cancel();
            self.torn_down.cancel();
            return Err(e.into());
        }

        let room = Arc::clone(self);
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => {
                    room.teardown(RoomState::Expired).await;
                }
                _ = room.cancel.cancelled() => {}
            }
        });

        tracing::info!(room = %self.id, ttl = ?self.settings.ttl, "room active");
        Ok(())
    }

    /// Add a member with a fresh peer identifier.
    ///
    /// Fails unless the room is `Active`. The membership leaves the room
    /// when dropped.
    pub fn join(self: &Arc<Self>) -> Result<Membership, RoomError> {
        let mut inner = self.lock();
        if inner.state != RoomState::Active {
            return Err(RoomError::NotActive(inner.state));
        }

        let peer = PeerId::generate_unique(|candidate| inner.members.contains(candidate))
            .ok_or(RoomError::IdentifierExhausted)?;
        inner.members.insert(peer);
        self.member_count.send_replace(inner.members.len());

        Ok(Membership {
            room: Arc::clone(self),
            peer,
            token: self.cancel.child_token(),
        })
    }

    fn leave(&self, peer: PeerId) {
        let mut inner = self.lock();
        if inner.members.remove(&peer) {
            self.member_count.send_replace(inner.members.len());
        }
    }

    /// Tear the room down now.
    pub async fn close(&self) {
        self.teardown(RoomState::Closed).await;
    }

    /// Wait until teardown has finished, whichever path started it.
    pub async fn wait_closed(&self) {
        self.torn_down.cancelled().await;
    }

    async fn teardown(&self, final_state: RoomState) {
        let already_down = {
            let mut inner = self.lock();
            match inner.state {
                RoomState::Created | RoomState::Active => {
                    inner.state = final_state;
                    false
                }
                RoomState::Expired | RoomState::Closed => true,
            }
        };
        if already_down {
            self.torn_down.cancelled().await;
            return;
        }

        self.cancel.cancel();

        let mut count = self.member_count.subscribe();
        let drained = tokio::time::timeout(self.settings.drain_timeout, count.wait_for(|n| *n == 0))
            .await
            .is_ok();
        if !drained {
            tracing::warn!(
                room = %self.id,
                remaining = self.member_count(),
                "members did not leave within the drain timeout"
            );
        }

        if let Err(e) = self.registry.delete(&self.id) {
            tracing::warn!(room = %self.id, error = %e, "failed to remove room from registry");
        }

        tracing::info!(room = %self.id, state = ?final_state, "room torn down");
        self.torn_down.cancel();
    }
}

impl std::fmt::Debug for Room {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Room")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("members", &self.member_count())
            .finish_non_exhaustive()
    }
}

/// A live seat in a room. Leaves the room on drop.
#[derive(Debug)]
pub struct Membership {
    room: Arc<Room>,
    peer: PeerId,
    token: CancellationToken,
}

impl Membership {
    /// This member's display identifier.
    pub fn peer(&self) -> PeerId {
        self.peer
    }

    /// Cancelled when the room is torn down.
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }
}

impl Drop for Membership {
    fn drop(&mut self) {
        self.room.leave(self.peer);
    }
}

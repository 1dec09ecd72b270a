//! Connection supervision: the accept loop and one task per socket.
//!
//! Every accepted socket goes through admission, then joins the room, then
//! gets its own task for the handshake and the message loop. The admission
//! permit and the room membership are guards owned by that task, so every
//! exit path gives both back.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use termtalk_core::{PeerId, ProtocolError};
use termtalk_transport::{Role, SecureSession, SessionConfig, TransportError};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::admission::{AdmissionController, AdmissionPermit};
use crate::room::{Membership, Room};

/// How often admission history and finished records are swept.
const PRUNE_INTERVAL: Duration = Duration::from_secs(10);

/// Pause after a failed accept (e.g. out of file descriptors).
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Process-local connection number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Where a connection is in its life.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Passed admission and joined the room.
    Admitted,
    /// Key exchange in progress.
    Handshaking,
    /// Session established; messages flowing.
    Established,
    /// Finished, for any reason.
    Closed,
    /// Turned away before any byte was sent.
    Rejected,
}

impl ConnectionState {
    /// Whether the connection no longer holds a socket.
    pub fn is_finished(self) -> bool {
        matches!(self, Self::Closed | Self::Rejected)
    }
}

/// What the host knows about one accepted socket.
#[derive(Debug, Clone)]
pub struct ConnectionRecord {
    /// Connection number.
    pub id: ConnectionId,
    /// Remote socket address.
    pub remote: SocketAddr,
    /// When the socket was accepted.
    pub accepted_at: Instant,
    /// Current state.
    pub state: ConnectionState,
    /// Peer identifier, once the socket joined the room.
    pub peer: Option<PeerId>,
    /// When the connection finished.
    pub ended_at: Option<Instant>,
}

/// Connections known to the supervisor, keyed by number.
pub type ConnectionTable = Arc<DashMap<ConnectionId, ConnectionRecord>>;

/// Why a member left.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// The room expired or was closed.
    RoomClosed,
    /// The peer closed the connection.
    PeerClosed,
    /// Handshake or idle deadline passed.
    TimedOut,
    /// Protocol violation or socket error.
    Failed(String),
}

impl From<TransportError> for DisconnectReason {
    fn from(e: TransportError) -> Self {
        match e {
            TransportError::PeerDisconnected => Self::PeerClosed,
            e if e.is_timeout() => Self::TimedOut,
            e => Self::Failed(e.to_string()),
        }
    }
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RoomClosed => f.write_str("room closed"),
            Self::PeerClosed => f.write_str("peer closed the connection"),
            Self::TimedOut => f.write_str("timed out"),
            Self::Failed(reason) => f.write_str(reason),
        }
    }
}

/// Something the host UI should show.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostEvent {
    /// A peer completed the handshake.
    PeerJoined {
        /// Peer identifier.
        peer: PeerId,
        /// Session fingerprint to compare out of band.
        fingerprint: String,
    },
    /// A peer sent a message.
    Message {
        /// Sender.
        peer: PeerId,
        /// Message text.
        text: String,
    },
    /// An established peer left.
    PeerLeft {
        /// Peer identifier.
        peer: PeerId,
        /// Why it left.
        reason: DisconnectReason,
    },
}

/// State shared by the accept loop and every connection task.
pub(crate) struct Shared {
    pub(crate) admission: Arc<AdmissionController>,
    pub(crate) room: Arc<Room>,
    pub(crate) connections: ConnectionTable,
    pub(crate) events: mpsc::Sender<HostEvent>,
    pub(crate) outbound: broadcast::Sender<Arc<str>>,
    pub(crate) session: SessionConfig,
}

impl Shared {
    fn set_state(&self, id: ConnectionId, state: ConnectionState) {
        if let Some(mut record) = self.connections.get_mut(&id) {
            record.state = state;
            if state.is_finished() {
                record.ended_at = Some(Instant::now());
            }
        }
    }

    fn state_of(&self, id: ConnectionId) -> Option<ConnectionState> {
        self.connections.get(&id).map(|record| record.state)
    }

    fn emit(&self, event: HostEvent) {
        if let Err(mpsc::error::TrySendError::Full(_)) = self.events.try_send(event) {
            tracing::warn!("host event queue full, dropping event");
        }
    }
}

/// Owns the listener and runs the accept loop until the room goes down.
pub(crate) struct Supervisor {
    listener: TcpListener,
    accept_timeout: Duration,
    shared: Arc<Shared>,
    next_id: u64,
}

impl Supervisor {
    pub(crate) fn new(listener: TcpListener, accept_timeout: Duration, shared: Arc<Shared>) -> Self {
        Self {
            listener,
            accept_timeout,
            shared,
            next_id: 1,
        }
    }

    pub(crate) async fn run(mut self) {
        let shutdown = self.shared.room.cancellation();
        let pruner = tokio::spawn(prune_loop(Arc::clone(&self.shared), shutdown.clone()));

        loop {
            let accepted = tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = tokio::time::timeout(self.accept_timeout, self.listener.accept()) => accepted,
            };

            match accepted {
                Err(_) => continue,
                Ok(Ok((stream, remote))) => self.dispatch(stream, remote),
                Ok(Err(e)) => {
                    tracing::warn!(error = %e, "accept failed");
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                }
            }
        }

        tracing::debug!(room = %self.shared.room.id(), "accept loop stopped");
        let _ = pruner.await;
    }

    fn dispatch(&mut self, stream: TcpStream, remote: SocketAddr) {
        let id = ConnectionId(self.next_id);
        self.next_id += 1;

        let mut record = ConnectionRecord {
            id,
            remote,
            accepted_at: Instant::now(),
            state: ConnectionState::Admitted,
            peer: None,
            ended_at: None,
        };

        let permit = match self.shared.admission.admit(remote.ip()) {
            Ok(permit) => permit,
            Err(rejection) => {
                tracing::info!(conn = %id, %remote, %rejection, "connection rejected");
                self.reject(record, stream);
                return;
            }
        };

        let membership = match self.shared.room.join() {
            Ok(membership) => membership,
            Err(e) => {
                tracing::debug!(conn = %id, %remote, error = %e, "room refused connection");
                self.reject(record, stream);
                return;
            }
        };

        record.peer = Some(membership.peer());
        self.shared.connections.insert(id, record);
        tracing::debug!(conn = %id, %remote, peer = %membership.peer(), "connection admitted");

        tokio::spawn(handle_connection(
            Arc::clone(&self.shared),
            id,
            stream,
            permit,
            membership,
        ));
    }

    fn reject(&self, mut record: ConnectionRecord, stream: TcpStream) {
        drop(stream);
        record.state = ConnectionState::Rejected;
        record.ended_at = Some(Instant::now());
        self.shared.connections.insert(record.id, record);
    }
}

async fn handle_connection(
    shared: Arc<Shared>,
    id: ConnectionId,
    stream: TcpStream,
    permit: AdmissionPermit,
    membership: Membership,
) {
    let peer = membership.peer();
    let token = membership.token().clone();
    shared.set_state(id, ConnectionState::Handshaking);

    // The socket lives inside `serve`; either branch finishing drops it.
    let reason = tokio::select! {
        _ = token.cancelled() => DisconnectReason::RoomClosed,
        reason = serve(&shared, id, peer, stream) => reason,
    };

    let was_established = shared.state_of(id) == Some(ConnectionState::Established);
    shared.set_state(id, ConnectionState::Closed);
    tracing::debug!(conn = %id, %peer, ip = %permit.ip(), %reason, "connection closed");

    if was_established {
        shared.emit(HostEvent::PeerLeft { peer, reason });
    }

    drop(permit);
    drop(membership);
}

async fn serve(shared: &Shared, id: ConnectionId, peer: PeerId, stream: TcpStream) -> DisconnectReason {
    if let Err(e) = stream.set_nodelay(true) {
        return TransportError::Io(e).into();
    }

    let mut session = match SecureSession::establish(stream, Role::Responder, &shared.session).await {
        Ok(session) => session,
        Err(e) => {
            tracing::debug!(conn = %id, %peer, error = %e, "handshake failed");
            return e.into();
        }
    };

    // Subscribe before announcing, so a broadcast sent in reaction to the
    // join event reaches this peer.
    let mut outbound = shared.outbound.subscribe();
    shared.set_state(id, ConnectionState::Established);
    shared.emit(HostEvent::PeerJoined {
        peer,
        fingerprint: session.fingerprint().to_string(),
    });

    loop {
        tokio::select! {
            inbound = session.recv() => match inbound {
                Ok(message) => shared.emit(HostEvent::Message {
                    peer,
                    text: message.into_string(),
                }),
                Err(e) => {
                    if e.protocol() == Some(ProtocolError::AuthenticationFailed) {
                        tracing::warn!(conn = %id, %peer, "frame failed authentication, closing");
                    }
                    return e.into();
                }
            },
            text = outbound.recv() => match text {
                Ok(text) => {
                    // A peer that stops reading must not outlive its idle window.
                    let deadline = session.idle_deadline();
                    if let Err(e) = session.send_text_until(&text, deadline).await {
                        tracing::debug!(conn = %id, %peer, error = %e, "outbound write failed");
                        return e.into();
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(conn = %id, %peer, skipped, "outbound messages dropped");
                }
                Err(broadcast::error::RecvError::Closed) => return DisconnectReason::RoomClosed,
            },
        }
    }
}

async fn prune_loop(shared: Arc<Shared>, shutdown: CancellationToken) {
    let mut interval = tokio::time::interval(PRUNE_INTERVAL);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = interval.tick() => {
                let now = Instant::now();
                let forgotten = shared.admission.prune(now);
                shared.connections.retain(|_, record| match record.ended_at {
                    Some(ended) => now.saturating_duration_since(ended) < PRUNE_INTERVAL,
                    None => true,
                });
                if forgotten > 0 {
                    tracing::debug!(forgotten, "pruned admission history");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disconnect_reason_from_transport() {
        assert_eq!(
            DisconnectReason::from(TransportError::PeerDisconnected),
            DisconnectReason::PeerClosed
        );
        assert_eq!(
            DisconnectReason::from(TransportError::Protocol(ProtocolError::IdleTimeout)),
            DisconnectReason::TimedOut
        );
        assert_eq!(
            DisconnectReason::from(TransportError::Protocol(ProtocolError::HandshakeTimeout)),
            DisconnectReason::TimedOut
        );
        assert!(matches!(
            DisconnectReason::from(TransportError::Protocol(ProtocolError::AuthenticationFailed)),
            DisconnectReason::Failed(_)
        ));
    }

    #[test]
    fn test_finished_states() {
        assert!(ConnectionState::Closed.is_finished());
        assert!(ConnectionState::Rejected.is_finished());
        assert!(!ConnectionState::Established.is_finished());
        assert_eq!(ConnectionId(7).to_string(), "#7");
    }
}

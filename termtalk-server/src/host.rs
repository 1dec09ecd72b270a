//! The hosting side as one handle.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use termtalk_core::frame::validate_plaintext;
use termtalk_core::identity::probe_entropy;
use termtalk_core::{ProtocolError, RoomId};
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

use crate::admission::{AdmissionController, AdmissionLimits};
use crate::config::{ConfigError, HostConfig};
use crate::registry::RegistryStore;
use crate::room::{Room, RoomError, RoomSettings};
use crate::supervisor::{ConnectionRecord, ConnectionTable, HostEvent, Shared, Supervisor};

/// Events buffered for the host UI before new ones are dropped.
const EVENT_QUEUE_DEPTH: usize = 256;

/// Outbound messages buffered per connection before it lags.
const OUTBOUND_QUEUE_DEPTH: usize = 32;

/// Fatal errors starting a host.
#[derive(Debug, Error)]
pub enum HostError {
    /// The configuration is invalid.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The OS randomness source does not answer.
    #[error("entropy source unavailable")]
    EntropyUnavailable,

    /// The listener could not be bound.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        /// Address that was requested.
        addr: String,
        /// Underlying error.
        #[source]
        source: io::Error,
    },

    /// The room could not be created or advertised.
    #[error(transparent)]
    Room(#[from] RoomError),
}

/// A running host: one room, its listener and its connections.
pub struct Host {
    room: Arc<Room>,
    admission: Arc<AdmissionController>,
    connections: ConnectionTable,
    outbound: broadcast::Sender<Arc<str>>,
    local_addr: SocketAddr,
    max_frame_len: usize,
    accept_task: JoinHandle<()>,
}

impl Host {
    /// Bind, open a room and start accepting.
    ///
    /// Returns the host handle and the stream of [`HostEvent`]s.
    pub async fn start(
        config: HostConfig,
        registry: Arc<dyn RegistryStore>,
    ) -> Result<(Self, mpsc::Receiver<HostEvent>), HostError> {
        config.validate()?;
        probe_entropy().map_err(|_| HostError::EntropyUnavailable)?;

        let addr = config.listen_address();
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|source| HostError::Bind {
                addr: addr.clone(),
                source,
            })?;
        let local_addr = listener
            .local_addr()
            .map_err(|source| HostError::Bind { addr, source })?;

        let room = Room::new(
            RoomSettings {
                host_address: config.bind_address.clone(),
                host_port: local_addr.port(),
                ttl: config.ttl(),
                drain_timeout: config.drain_timeout(),
            },
            registry,
        )?;
        room.activate()?;

        let admission = Arc::new(AdmissionController::new(AdmissionLimits::from(&config)));
        let connections = ConnectionTable::default();
        let (events, events_rx) = mpsc::channel(EVENT_QUEUE_DEPTH);
        let (outbound, _) = broadcast::channel(OUTBOUND_QUEUE_DEPTH);

        let shared = Arc::new(Shared {
            admission: Arc::clone(&admission),
            room: Arc::clone(&room),
            connections: Arc::clone(&connections),
            events,
            outbound: outbound.clone(),
            session: config.session_config(),
        });
        let supervisor = Supervisor::new(listener, config.accept_timeout(), shared);
        let accept_task = tokio::spawn(supervisor.run());

        tracing::info!(room = %room.id(), addr = %local_addr, "hosting");

        let host = Self {
            room,
            admission,
            connections,
            outbound,
            local_addr,
            max_frame_len: config.max_frame_len,
            accept_task,
        };
        Ok((host, events_rx))
    }

    /// The room's identifier.
    pub fn room_id(&self) -> RoomId {
        self.room.id()
    }

    /// The room.
    pub fn room(&self) -> &Arc<Room> {
        &self.room
    }

    /// Address the listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Send `text` to every established peer.
    ///
    /// Returns how many sessions will receive it.
    pub fn broadcast(&self, text: &str) -> Result<usize, ProtocolError> {
        validate_plaintext(text.as_bytes(), self.max_frame_len)?;
        Ok(self.outbound.send(Arc::from(text)).unwrap_or(0))
    }

    /// Snapshot of known connections, oldest first.
    pub fn connections(&self) -> Vec<ConnectionRecord> {
        let mut records: Vec<_> = self
            .connections
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        records.sort_by_key(|record| record.id);
        records
    }

    /// Open (admitted, not yet released) connections.
    pub fn open_connections(&self) -> usize {
        self.admission.open_connections()
    }

    /// Wait until the room has been torn down.
    pub async fn closed(&self) {
        self.room.wait_closed().await;
    }

    /// Close the room, drop every connection and stop accepting.
    pub async fn shutdown(self) {
        self.room.close().await;
        if let Err(e) = self.accept_task.await {
            tracing::warn!(error = %e, "accept loop ended abnormally");
        }
    }
}

impl std::fmt::Debug for Host {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Host")
            .field("room", &self.room)
            .field("local_addr", &self.local_addr)
            .finish_non_exhaustive()
    }
}

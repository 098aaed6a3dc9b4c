//! Connection handles and the registry of live connections.
//!
//! Each connection owns a bounded mpsc channel for outbound frames (the
//! receiver is drained by the transport's write loop) and a slot holding the
//! session attached once the peer authenticates. The slot is an
//! `ArcSwapOption` so request admission can read it without locking.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use arc_swap::ArcSwapOption;
use dashmap::DashMap;
use optrack_core::PeerRoles;
use tokio::sync::mpsc;

use super::config::ConnectionConfig;
use super::session::Session;

/// Unique identifier for a connection, assigned by the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(pub u64);

/// Frame to be written to a connection.
#[derive(Debug)]
pub enum OutboundMessage {
    /// An encoded message.
    Binary(Vec<u8>),
    /// A close frame with an optional reason.
    Close(Option<String>),
}

/// Error returned when sending to a connection fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendError {
    /// The channel stayed full for the whole timeout.
    Timeout,
    /// The write loop has exited; the receiver was dropped.
    Disconnected,
    /// The channel is full (non-blocking `try_send` only).
    Full,
}

/// Handle to a single transport connection.
#[derive(Debug)]
pub struct ConnectionHandle {
    pub id: ConnectionId,
    tx: mpsc::Sender<OutboundMessage>,
    peer_roles: PeerRoles,
    session: ArcSwapOption<Session>,
    pub connected_at: Instant,
}

impl ConnectionHandle {
    /// Builds a handle that is not tracked by any registry.
    #[must_use]
    pub fn new(
        id: ConnectionId,
        peer_roles: PeerRoles,
        config: &ConnectionConfig,
    ) -> (Self, mpsc::Receiver<OutboundMessage>) {
        let (tx, rx) = mpsc::channel(config.outbound_channel_capacity);
        let handle = Self {
            id,
            tx,
            peer_roles,
            session: ArcSwapOption::empty(),
            connected_at: Instant::now(),
        };
        (handle, rx)
    }

    /// Roles the peer declared on this connection.
    #[must_use]
    pub fn peer_roles(&self) -> PeerRoles {
        self.peer_roles
    }

    /// The session currently attached, as a new shared reference.
    #[must_use]
    pub fn attached_session(&self) -> Option<Arc<Session>> {
        self.session.load_full()
    }

    /// Attaches `session`, returning whatever was attached before.
    pub fn attach_session(&self, session: Arc<Session>) -> Option<Arc<Session>> {
        self.session.swap(Some(session))
    }

    pub fn detach_session(&self) -> Option<Arc<Session>> {
        self.session.swap(None)
    }

    /// Enqueues a frame without blocking.
    ///
    /// # Errors
    ///
    /// Returns `SendError::Full` if the channel is at capacity and
    /// `SendError::Disconnected` if the write loop has gone away.
    pub fn try_send(&self, msg: OutboundMessage) -> Result<(), SendError> {
        self.tx.try_send(msg).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => SendError::Full,
            mpsc::error::TrySendError::Closed(_) => SendError::Disconnected,
        })
    }

    /// Sends a frame, waiting up to `timeout` for channel capacity.
    ///
    /// # Errors
    ///
    /// Returns `SendError::Timeout` if the channel remains full for the
    /// entire timeout and `SendError::Disconnected` if the receiver has been
    /// dropped.
    pub async fn send_timeout(
        &self,
        msg: OutboundMessage,
        timeout: Duration,
    ) -> Result<(), SendError> {
        match tokio::time::timeout(timeout, self.tx.send(msg)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(SendError::Disconnected),
            Err(_) => Err(SendError::Timeout),
        }
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        !self.tx.is_closed()
    }
}

/// Thread-safe registry of all active connections.
#[derive(Debug)]
pub struct ConnectionRegistry {
    connections: DashMap<ConnectionId, Arc<ConnectionHandle>>,
    next_id: AtomicU64,
}

impl ConnectionRegistry {
    /// Creates a new empty registry.
    ///
    /// Connection IDs start at 1 (0 is reserved as "no connection").
    #[must_use]
    pub fn new() -> Self {
        Self {
            connections: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    /// Registers a new connection, returning its handle and the receiver the
    /// write loop should drain.
    pub fn register(
        &self,
        peer_roles: PeerRoles,
        config: &ConnectionConfig,
    ) -> (Arc<ConnectionHandle>, mpsc::Receiver<OutboundMessage>) {
        let id = ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (handle, rx) = ConnectionHandle::new(id, peer_roles, config);
        let handle = Arc::new(handle);
        self.connections.insert(id, Arc::clone(&handle));
        tracing::debug!(connection = id.0, roles = %peer_roles, "connection registered");
        (handle, rx)
    }

    pub fn remove(&self, id: ConnectionId) -> Option<Arc<ConnectionHandle>> {
        self.connections.remove(&id).map(|(_, handle)| handle)
    }

    pub fn get(&self, id: ConnectionId) -> Option<Arc<ConnectionHandle>> {
        self.connections.get(&id).map(|r| r.value().clone())
    }

    #[must_use]
    pub fn count(&self) -> usize {
        self.connections.len()
    }

    /// Removes every connection and returns the handles, for shutdown.
    ///
    /// Connections registered while the drain runs may survive it.
    pub fn drain_all(&self) -> Vec<Arc<ConnectionHandle>> {
        let ids: Vec<ConnectionId> = self.connections.iter().map(|entry| *entry.key()).collect();
        let handles: Vec<_> = ids
            .into_iter()
            .filter_map(|id| self.remove(id))
            .collect();
        tracing::debug!(drained = handles.len(), "connections drained");
        handles
    }

    /// Counts connections whose declared roles include `role`.
    #[must_use]
    pub fn count_by_role(&self, role: PeerRoles) -> usize {
        self.connections
            .iter()
            .filter(|entry| entry.value().peer_roles.contains(role))
            .count()
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

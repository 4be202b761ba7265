//! Registry of live connections.
//!
//! The registry is the only structure shared by every worker: entries are added
//! when a worker adopts a connection and removed when it closes. Each entry
//! holds the sending side of the connection's bounded outbound queue, so
//! pushes from any thread end up on the worker that owns the socket.

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, Instant, SystemTime};

use tokio::sync::Notify;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use crate::framing::Frame;

/// Unique identifier for a connection within a server session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Atomic generator for monotonically increasing [`ConnectionId`]s.
pub struct IdGenerator {
    next: AtomicU64,
}

impl IdGenerator {
    /// Create a new generator starting at 1.
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }

    /// Return the next unique [`ConnectionId`].
    pub fn next_id(&self) -> ConnectionId {
        ConnectionId(self.next.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for IdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

/// Metadata of one open transport session.
#[derive(Debug)]
pub struct Connection {
    id: ConnectionId,
    remote_addr: SocketAddr,
    created_at: SystemTime,
    opened: Instant,
    /// Milliseconds since `opened` at the last inbound frame.
    last_activity_ms: AtomicU64,
}

impl Connection {
    /// Create connection metadata stamped with the current time.
    pub fn new(id: ConnectionId, remote_addr: SocketAddr) -> Self {
        Self {
            id,
            remote_addr,
            created_at: SystemTime::now(),
            opened: Instant::now(),
            last_activity_ms: AtomicU64::new(0),
        }
    }

    /// Connection identifier.
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Peer address.
    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    /// Wall-clock time the connection was accepted.
    pub fn created_at(&self) -> SystemTime {
        self.created_at
    }

    /// Record inbound activity.
    pub fn touch(&self) {
        let elapsed = self.opened.elapsed().as_millis() as u64;
        self.last_activity_ms.fetch_max(elapsed, Ordering::Relaxed);
    }

    /// Instant of the last inbound activity (the accept time if none yet).
    pub fn last_activity(&self) -> Instant {
        self.opened + Duration::from_millis(self.last_activity_ms.load(Ordering::Relaxed))
    }

    /// Time since the last inbound activity.
    pub fn idle_for(&self) -> Duration {
        self.last_activity().elapsed()
    }
}

/// Default capacity of each connection's outbound queue.
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

/// Errors returned by registry operations.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// The registry is at capacity.
    #[error("connection limit of {0} reached")]
    LimitReached(usize),
    /// The id is already registered.
    #[error("{0} is already registered")]
    Duplicate(ConnectionId),
    /// No live connection with that id.
    #[error("{0} is not connected")]
    NotConnected(ConnectionId),
    /// The connection's outbound queue is full; its reader is not keeping up.
    #[error("outbound queue of {0} is full")]
    QueueFull(ConnectionId),
}

/// Receiving side of a registered connection, owned by its worker task.
pub struct Mailbox {
    /// Frames queued for the socket, in dispatch order.
    pub frames: mpsc::Receiver<Frame>,
    /// Signalled by [`ConnectionRegistry::close`].
    pub close: Arc<Notify>,
}

struct Entry {
    connection: Arc<Connection>,
    outbound: mpsc::Sender<Frame>,
    close: Arc<Notify>,
}

/// Thread-safe map of live connections keyed by [`ConnectionId`].
pub struct ConnectionRegistry {
    inner: RwLock<HashMap<ConnectionId, Entry>>,
    max_connections: usize,
    queue_capacity: usize,
}

impl ConnectionRegistry {
    /// Create a new registry with the given capacity limit.
    pub fn new(max_connections: usize) -> Self {
        Self {
            inner: RwLock::new(HashMap::new()),
            max_connections,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }

    /// Bound each connection's outbound queue to `capacity` frames (min 1).
    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity.max(1);
        self
    }

    /// Per-connection outbound queue bound.
    pub fn queue_capacity(&self) -> usize {
        self.queue_capacity
    }

    /// Register a connection and hand back the receiving side of its queue.
    pub fn register(&self, connection: Arc<Connection>) -> Result<Mailbox, RegistryError> {
        let mut map = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        if map.len() >= self.max_connections {
            return Err(RegistryError::LimitReached(self.max_connections));
        }
        let id = connection.id();
        if map.contains_key(&id) {
            return Err(RegistryError::Duplicate(id));
        }
        let (outbound, frames) = mpsc::channel(self.queue_capacity);
        let close = Arc::new(Notify::new());
        map.insert(
            id,
            Entry {
                connection,
                outbound,
                close: Arc::clone(&close),
            },
        );
        Ok(Mailbox { frames, close })
    }

    /// Remove a connection by ID.
    pub fn evict(&self, id: ConnectionId) -> Option<Arc<Connection>> {
        self.inner
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id)
            .map(|entry| entry.connection)
    }

    /// Look up connection metadata.
    pub fn get(&self, id: ConnectionId) -> Option<Arc<Connection>> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .map(|entry| Arc::clone(&entry.connection))
    }

    /// Whether the connection is live.
    pub fn contains(&self, id: ConnectionId) -> bool {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(&id)
    }

    /// Queue a frame for the connection's worker without waiting.
    ///
    /// Fails with [`RegistryError::QueueFull`] when the queue is at capacity,
    /// and with [`RegistryError::NotConnected`] if the connection is unknown
    /// or its worker has stopped draining the queue.
    pub fn send(&self, id: ConnectionId, frame: Frame) -> Result<(), RegistryError> {
        let map = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        let entry = map.get(&id).ok_or(RegistryError::NotConnected(id))?;
        entry.outbound.try_send(frame).map_err(|e| match e {
            TrySendError::Full(_) => RegistryError::QueueFull(id),
            TrySendError::Closed(_) => RegistryError::NotConnected(id),
        })
    }

    /// Ask the connection's worker to close it. Frames still queued are
    /// not written.
    pub fn close(&self, id: ConnectionId) -> Result<(), RegistryError> {
        let map = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        let entry = map.get(&id).ok_or(RegistryError::NotConnected(id))?;
        entry.close.notify_one();
        Ok(())
    }

    /// Ids of every live connection.
    pub fn ids(&self) -> Vec<ConnectionId> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .copied()
            .collect()
    }

    /// Return the number of live connections.
    pub fn len(&self) -> usize {
        self.inner.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Return whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

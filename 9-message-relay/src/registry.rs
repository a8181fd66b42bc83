use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use parking_lot::Mutex;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::debug;

pub type ConnectionId = u64;

/// A frame queued for a connection's writer task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Close { code: u16, reason: String },
}

/// Outcome of pushing a frame onto a connection's outbound queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Push {
    Queued,
    /// The writer task is gone; the socket is closed or closing.
    Closed,
    /// The client is not draining its queue; the frame was dropped.
    Full,
}

/// Handle to one live client connection.
///
/// Cloning the handle clones the sender side of the connection's outbound
/// queue. The writer task owns the receiver, so `is_open` turns false as soon
/// as that task exits.
#[derive(Debug, Clone)]
pub struct Connection {
    id: ConnectionId,
    user_id: String,
    device_id: String,
    outbound: mpsc::Sender<Frame>,
}

impl Connection {
    pub fn new(
        id: ConnectionId,
        user_id: impl Into<String>,
        device_id: impl Into<String>,
        outbound: mpsc::Sender<Frame>,
    ) -> Self {
        Self {
            id,
            user_id: user_id.into(),
            device_id: device_id.into(),
            outbound,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn is_open(&self) -> bool {
        !self.outbound.is_closed()
    }

    /// Queues a frame without waiting on the client.
    pub fn push(&self, frame: Frame) -> Push {
        match self.outbound.try_send(frame) {
            Ok(()) => Push::Queued,
            Err(TrySendError::Closed(_)) => Push::Closed,
            Err(TrySendError::Full(_)) => Push::Full,
        }
    }
}

#[derive(Default)]
struct Tables {
    by_user: HashMap<String, Connection>,
    by_device: HashMap<String, Connection>,
}

/// Maps user and device identifiers to their most recent connection.
///
/// Both maps are last-write-wins: registering a second connection under an
/// existing key replaces the previous handle without closing it.
pub struct Registry {
    tables: Mutex<Tables>,
    next_id: AtomicU64,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    pub fn new() -> Self {
        Self {
            tables: Mutex::new(Tables::default()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn next_id(&self) -> ConnectionId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Tracks `connection` under its user and device identifiers. The entries
    /// are removed when the returned guard is dropped.
    pub fn register(self: &Arc<Self>, connection: Connection) -> Registration {
        let registration = Registration {
            registry: Arc::clone(self),
            id: connection.id,
            user_id: connection.user_id.clone(),
            device_id: connection.device_id.clone(),
        };

        let mut tables = self.tables.lock();
        if let Some(previous) = tables
            .by_user
            .insert(connection.user_id.clone(), connection.clone())
        {
            debug!(
                user_id = %connection.user_id,
                previous = previous.id,
                current = connection.id,
                "replacing connection for user"
            );
        }
        tables
            .by_device
            .insert(connection.device_id.clone(), connection);

        registration
    }

    pub fn lookup_by_user(&self, user_id: &str) -> Option<Connection> {
        self.tables.lock().by_user.get(user_id).cloned()
    }

    pub fn lookup_by_device(&self, device_id: &str) -> Option<Connection> {
        self.tables.lock().by_device.get(device_id).cloned()
    }

    /// Drops the entries for `user_id` and `device_id` that still point at
    /// connection `id`. Entries taken over by a newer connection are kept.
    /// Returns whether anything was removed.
    pub fn remove(&self, id: ConnectionId, user_id: &str, device_id: &str) -> bool {
        let mut tables = self.tables.lock();
        let user_removed = remove_if_current(&mut tables.by_user, user_id, id);
        let device_removed = remove_if_current(&mut tables.by_device, device_id, id);
        user_removed || device_removed
    }

    /// Number of users with a tracked connection.
    pub fn user_count(&self) -> usize {
        self.tables.lock().by_user.len()
    }

    /// Queues a close frame on every tracked connection.
    pub fn close_all(&self, code: u16, reason: &str) -> usize {
        let connections: HashMap<ConnectionId, Connection> = {
            let tables = self.tables.lock();
            tables
                .by_user
                .values()
                .chain(tables.by_device.values())
                .map(|connection| (connection.id, connection.clone()))
                .collect()
        };

        connections
            .values()
            .filter(|connection| {
                let frame = Frame::Close {
                    code,
                    reason: reason.to_string(),
                };
                connection.push(frame) == Push::Queued
            })
            .count()
    }
}

fn remove_if_current(table: &mut HashMap<String, Connection>, key: &str, id: ConnectionId) -> bool {
    match table.get(key) {
        Some(current) if current.id == id => table.remove(key).is_some(),
        _ => false,
    }
}

/// Keeps a connection registered for as long as it is alive.
#[must_use = "dropping the registration unregisters the connection"]
pub struct Registration {
    registry: Arc<Registry>,
    id: ConnectionId,
    user_id: String,
    device_id: String,
}

impl Drop for Registration {
    fn drop(&mut self) {
        if self.registry.remove(self.id, &self.user_id, &self.device_id) {
            debug!(
                connection = self.id,
                user_id = %self.user_id,
                device_id = %self.device_id,
                "connection unregistered"
            );
        }
    }
}

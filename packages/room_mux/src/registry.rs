//! Connection Registry
//!
//! Maps connection ids to their outbound transport, identity and room
//! memberships, and keeps the reverse room → members index used by fan-out.
//!
//! Lock order is always `connections` before `members`; nothing locks them
//! the other way round.

use dashmap::DashMap;
use std::collections::HashSet;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::Payload;
use crate::error::{DeliveryError, RegistryError};

/// Unique identifier for one transport session.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Write side of a connection: a bounded outbound queue plus a kick signal
/// the transport task watches to drop the socket.
#[derive(Clone, Debug)]
pub struct Transport {
    tx: mpsc::Sender<Payload>,
    kick: CancellationToken,
}

impl Transport {
    /// Create a transport with an outbound queue of `capacity` frames.
    /// The receiver is drained by whoever owns the socket.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Payload>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            Self {
                tx,
                kick: CancellationToken::new(),
            },
            rx,
        )
    }

    /// Cancelled when the registry gives up on this connection.
    pub fn kicked(&self) -> CancellationToken {
        self.kick.clone()
    }

    /// Non-blocking enqueue of one frame.
    pub fn send(&self, payload: Payload) -> Result<(), DeliveryError> {
        match self.tx.try_send(payload) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.kick.cancel();
                Err(DeliveryError::Overflow)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(DeliveryError::ConnectionGone),
        }
    }
}

struct ConnectionEntry {
    transport: Transport,
    identity: Option<String>,
    rooms: HashSet<String>,
    closing: bool,
}

/// Registry of live connections and their room memberships.
#[derive(Default)]
pub struct ConnectionRegistry {
    connections: DashMap<ConnectionId, ConnectionEntry>,
    members: DashMap<String, HashSet<ConnectionId>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, id: ConnectionId, transport: Transport) {
        let entry = ConnectionEntry {
            transport,
            identity: None,
            rooms: HashSet::new(),
            closing: false,
        };
        if self.connections.insert(id, entry).is_some() {
            warn!(conn_id = %id, "Connection id registered twice, replacing transport");
        }
        debug!(conn_id = %id, "Registered connection");
    }

    /// Remove a connection. Returns the rooms it still belonged to, which is
    /// empty when the caller ran `leave_all` first.
    pub fn unregister(&self, id: ConnectionId) -> Vec<String> {
        let Some((_, entry)) = self.connections.remove(&id) else {
            return Vec::new();
        };
        let leftover: Vec<String> = entry.rooms.into_iter().collect();
        for room in &leftover {
            self.drop_member(room, id);
        }
        if !leftover.is_empty() {
            warn!(conn_id = %id, rooms = ?leftover, "Unregistered connection that still had memberships");
        }
        debug!(conn_id = %id, "Unregistered connection");
        leftover
    }

    pub fn contains(&self, id: ConnectionId) -> bool {
        self.connections.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    pub fn set_identity(&self, id: ConnectionId, subject: impl Into<String>) -> bool {
        match self.connections.get_mut(&id) {
            Some(mut entry) => {
                entry.identity = Some(subject.into());
                true
            }
            None => false,
        }
    }

    pub fn identity(&self, id: ConnectionId) -> Option<String> {
        self.connections.get(&id)?.identity.clone()
    }

    /// Rooms the connection currently belongs to.
    pub fn rooms_of(&self, id: ConnectionId) -> Vec<String> {
        self.connections
            .get(&id)
            .map(|entry| entry.rooms.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Mark the connection as closing so no further memberships are accepted.
    /// Returns true for the caller that flipped the flag.
    pub fn begin_close(&self, id: ConnectionId) -> bool {
        match self.connections.get_mut(&id) {
            Some(mut entry) if !entry.closing => {
                entry.closing = true;
                true
            }
            _ => false,
        }
    }

    /// Record `id` as a member of `room`. Returns false if it already was.
    pub fn add_membership(&self, id: ConnectionId, room: &str) -> Result<bool, RegistryError> {
        let mut entry = self
            .connections
            .get_mut(&id)
            .ok_or(RegistryError::UnknownConnection)?;
        if entry.closing {
            return Err(RegistryError::Closing);
        }
        if !entry.rooms.insert(room.to_string()) {
            return Ok(false);
        }
        self.members.entry(room.to_string()).or_default().insert(id);
        Ok(true)
    }

    /// Drop `id` from `room`. Returns true if the membership existed.
    pub fn remove_membership(&self, id: ConnectionId, room: &str) -> bool {
        let removed = self
            .connections
            .get_mut(&id)
            .map(|mut entry| entry.rooms.remove(room))
            .unwrap_or(false);
        self.drop_member(room, id);
        removed
    }

    fn drop_member(&self, room: &str, id: ConnectionId) {
        if let Some(mut set) = self.members.get_mut(room) {
            set.remove(&id);
        }
        self.members.remove_if(room, |_, set| set.is_empty());
    }

    /// Point-in-time copy of the members of `room`.
    pub fn membership_snapshot(&self, room: &str) -> Vec<ConnectionId> {
        self.members
            .get(room)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Best-effort, non-blocking write to one connection.
    pub fn deliver(&self, id: ConnectionId, payload: Payload) -> Result<(), DeliveryError> {
        // Clone the sender out so no map lock is held during the send.
        let transport = match self.connections.get(&id) {
            Some(entry) => entry.transport.clone(),
            None => return Err(DeliveryError::ConnectionGone),
        };
        transport.send(payload)
    }

    /// Deliver to every registered connection. Returns how many accepted it.
    pub fn broadcast(&self, payload: Payload) -> usize {
        let targets: Vec<Transport> = self
            .connections
            .iter()
            .filter(|entry| !entry.closing)
            .map(|entry| entry.transport.clone())
            .collect();
        targets
            .into_iter()
            .filter(|transport| transport.send(payload.clone()).is_ok())
            .count()
    }
}

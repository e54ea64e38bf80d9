//! Who is online.
//!
//! Tracks authenticated connections independently of room membership and
//! announces every change to all connected sockets.

use dashmap::DashMap;
use room_mux::{ConnectionId, ConnectionRegistry, Payload};
use std::sync::Arc;
use tracing::debug;

use crate::gateway::protocol::ServerEvent;

pub struct Presence {
    registry: Arc<ConnectionRegistry>,
    subjects: DashMap<ConnectionId, String>,
}

impl Presence {
    pub fn new(registry: Arc<ConnectionRegistry>) -> Self {
        Self {
            registry,
            subjects: DashMap::new(),
        }
    }

    /// Record `conn` as signed in as `subject`. Re-authenticating as the same
    /// subject is not a change.
    pub fn connected(&self, subject: &str, conn: ConnectionId) {
        let previous = self.subjects.insert(conn, subject.to_string());
        if previous.as_deref() != Some(subject) {
            debug!(conn_id = %conn, subject = %subject, "User online");
            self.announce();
        }
    }

    pub fn disconnected(&self, conn: ConnectionId) {
        if let Some((_, subject)) = self.subjects.remove(&conn) {
            debug!(conn_id = %conn, subject = %subject, "User offline");
            self.announce();
        }
    }

    /// Sorted and deduplicated; one user on two sockets is listed once.
    pub fn online(&self) -> Vec<String> {
        let mut users: Vec<String> = self.subjects.iter().map(|e| e.value().clone()).collect();
        users.sort();
        users.dedup();
        users
    }

    fn announce(&self) {
        let frame = ServerEvent::StatusChanged {
            online_users: self.online(),
        };
        let reached = self.registry.broadcast(Payload::from(frame.to_json()));
        debug!(reached, "Presence change broadcast");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use room_mux::Transport;

    fn setup() -> (Presence, Arc<ConnectionRegistry>) {
        let registry = Arc::new(ConnectionRegistry::new());
        (Presence::new(registry.clone()), registry)
    }

    fn frame(payload: Payload) -> serde_json::Value {
        serde_json::from_str(&payload).unwrap()
    }

    #[test]
    fn online_is_sorted_and_deduplicated() {
        let (presence, _) = setup();
        presence.connected("zed", ConnectionId::new());
        presence.connected("amy", ConnectionId::new());
        presence.connected("amy", ConnectionId::new());
        assert_eq!(presence.online(), vec!["amy".to_string(), "zed".to_string()]);
    }

    #[test]
    fn changes_are_broadcast_to_every_connection() {
        let (presence, registry) = setup();
        let watcher = ConnectionId::new();
        let (transport, mut rx) = Transport::channel(8);
        registry.register(watcher, transport);

        let alice = ConnectionId::new();
        presence.connected("alice", alice);
        let got = frame(rx.try_recv().unwrap());
        assert_eq!(got["event"], "user.statusChanged");
        assert_eq!(got["onlineUsers"], serde_json::json!(["alice"]));

        // Same subject again on the same socket: nothing new to say.
        presence.connected("alice", alice);
        assert!(rx.try_recv().is_err());

        presence.disconnected(alice);
        let got = frame(rx.try_recv().unwrap());
        assert_eq!(got["onlineUsers"], serde_json::json!([]));
    }

    #[test]
    fn unknown_disconnect_is_silent() {
        let (presence, registry) = setup();
        let watcher = ConnectionId::new();
        let (transport, mut rx) = Transport::channel(8);
        registry.register(watcher, transport);

        presence.disconnected(ConnectionId::new());
        assert!(rx.try_recv().is_err());
        assert!(presence.online().is_empty());
    }

    #[test]
    fn user_stays_online_while_another_socket_remains() {
        let (presence, _) = setup();
        let (a, b) = (ConnectionId::new(), ConnectionId::new());
        presence.connected("alice", a);
        presence.connected("alice", b);
        presence.disconnected(a);
        assert_eq!(presence.online(), vec!["alice".to_string()]);
    }
}

//! Server metrics for observability
//!
//! Gateway-level counters. Room and upstream counters live in the
//! multiplexer and are folded into the snapshot.

use room_mux::MuxStatsSnapshot;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Server-wide metrics
#[derive(Debug, Default)]
pub struct ServerMetrics {
    // Connection metrics
    /// Currently open client sockets
    pub active_connections: AtomicU64,
    /// Total client sockets since server start
    pub total_connections: AtomicU64,
    /// Sockets dropped because their outbound queue overflowed
    pub connections_kicked: AtomicU64,

    // Message metrics
    /// Client frames received
    pub frames_received: AtomicU64,
    /// Frames written to client sockets
    pub frames_sent: AtomicU64,
    /// Chat messages accepted and published to the broker
    pub messages_published: AtomicU64,

    // Error metrics
    /// Open or publish failures against the broker
    pub broker_errors: AtomicU64,
    /// Rejected logins, registrations and tokens
    pub auth_failures: AtomicU64,
    /// Malformed or unknown client frames
    pub protocol_errors: AtomicU64,
    /// Socket read/write failures
    pub websocket_errors: AtomicU64,

    /// Server start time (for uptime calculation)
    start_time: Option<Instant>,
}

impl ServerMetrics {
    pub fn new() -> Self {
        Self {
            start_time: Some(Instant::now()),
            ..Default::default()
        }
    }

    // Connection tracking
    pub fn connection_opened(&self) {
        self.active_connections.fetch_add(1, Ordering::Relaxed);
        self.total_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        self.active_connections.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn connection_kicked(&self) {
        self.connections_kicked.fetch_add(1, Ordering::Relaxed);
    }

    // Message tracking
    pub fn frame_received(&self) {
        self.frames_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn frame_sent(&self) {
        self.frames_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn message_published(&self) {
        self.messages_published.fetch_add(1, Ordering::Relaxed);
    }

    // Error tracking
    pub fn broker_error(&self) {
        self.broker_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn auth_failure(&self) {
        self.auth_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn protocol_error(&self) {
        self.protocol_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn websocket_error(&self) {
        self.websocket_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Get uptime in seconds
    pub fn uptime_secs(&self) -> u64 {
        self.start_time.map(|t| t.elapsed().as_secs()).unwrap_or(0)
    }

    /// Create a snapshot of all metrics
    pub fn snapshot(&self, rooms: MuxStatsSnapshot) -> MetricsSnapshot {
        MetricsSnapshot {
            uptime_secs: self.uptime_secs(),
            connections: ConnectionMetrics {
                active: self.active_connections.load(Ordering::Relaxed),
                total: self.total_connections.load(Ordering::Relaxed),
                kicked: self.connections_kicked.load(Ordering::Relaxed),
            },
            messages: MessageMetrics {
                received: self.frames_received.load(Ordering::Relaxed),
                sent: self.frames_sent.load(Ordering::Relaxed),
                published: self.messages_published.load(Ordering::Relaxed),
            },
            errors: ErrorMetrics {
                broker: self.broker_errors.load(Ordering::Relaxed),
                auth: self.auth_failures.load(Ordering::Relaxed),
                protocol: self.protocol_errors.load(Ordering::Relaxed),
                websocket: self.websocket_errors.load(Ordering::Relaxed),
            },
            rooms,
        }
    }
}

/// Serializable snapshot of server metrics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub uptime_secs: u64,
    pub connections: ConnectionMetrics,
    pub messages: MessageMetrics,
    pub errors: ErrorMetrics,
    pub rooms: MuxStatsSnapshot,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionMetrics {
    pub active: u64,
    pub total: u64,
    pub kicked: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageMetrics {
    pub received: u64,
    pub sent: u64,
    pub published: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorMetrics {
    pub broker: u64,
    pub auth: u64,
    pub protocol: u64,
    pub websocket: u64,
}

/// Health check response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthStatus {
    pub status: String,
    pub rooms: RoomHealth,
    pub connections: u64,
    pub uptime_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoomHealth {
    pub open: u64,
    pub lost: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_tracking() {
        let m = ServerMetrics::new();
        m.connection_opened();
        m.connection_opened();
        m.connection_closed();
        m.connection_kicked();

        let snap = m.snapshot(MuxStatsSnapshot::default());
        assert_eq!(snap.connections.active, 1);
        assert_eq!(snap.connections.total, 2);
        assert_eq!(snap.connections.kicked, 1);
    }

    #[test]
    fn test_error_and_message_counters() {
        let m = ServerMetrics::new();
        m.frame_received();
        m.frame_sent();
        m.message_published();
        m.broker_error();
        m.auth_failure();
        m.protocol_error();
        m.websocket_error();

        let snap = m.snapshot(MuxStatsSnapshot::default());
        assert_eq!(snap.messages.received, 1);
        assert_eq!(snap.messages.sent, 1);
        assert_eq!(snap.messages.published, 1);
        assert_eq!(snap.errors.broker, 1);
        assert_eq!(snap.errors.auth, 1);
        assert_eq!(snap.errors.protocol, 1);
        assert_eq!(snap.errors.websocket, 1);
    }

    #[test]
    fn test_snapshot_serializes_room_stats() {
        let m = ServerMetrics::new();
        let rooms = MuxStatsSnapshot {
            upstreams_opened: 3,
            upstreams_closed: 1,
            ..Default::default()
        };
        let json = serde_json::to_value(m.snapshot(rooms)).unwrap();
        assert_eq!(json["rooms"]["upstreams_opened"], 3);
        assert_eq!(json["connections"]["active"], 0);
    }
}

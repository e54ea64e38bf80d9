//! Error types for the broker bridge, registry and multiplexer.

use crate::registry::ConnectionId;

/// Failures reported by a [`BrokerBridge`](crate::BrokerBridge) implementation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BrokerError {
    /// Open or publish could not reach the broker.
    #[error("broker unavailable: {0}")]
    Unavailable(String),

    /// `close` was called on a subscription handle that was already closed.
    #[error("subscription for room {room} already closed")]
    AlreadyClosed { room: String },
}

/// Failures of a single delivery attempt to one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum DeliveryError {
    /// The transport is closed or the connection was never registered.
    #[error("connection gone")]
    ConnectionGone,

    /// The outbound queue is full; the connection has been kicked.
    #[error("outbound queue full")]
    Overflow,
}

/// Membership changes refused by the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("unknown connection")]
    UnknownConnection,

    #[error("connection is closing")]
    Closing,
}

#[derive(Debug, thiserror::Error)]
pub enum MuxError {
    /// The upstream subscription could not be opened, or a publish failed.
    #[error("broker unavailable for room {room}: {source}")]
    BrokerUnavailable {
        room: String,
        #[source]
        source: BrokerError,
    },

    /// The connection is unknown to the registry or is being torn down.
    #[error("connection {0} is gone")]
    ConnectionGone(ConnectionId),

    /// Room state disagrees with itself. Only reachable through a bug in the
    /// per-room serialization.
    #[error("invariant violated for room {room}: {detail}")]
    InvariantViolation { room: String, detail: String },

    #[error("multiplexer is shutting down")]
    ShuttingDown,
}

impl MuxError {
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::BrokerUnavailable { .. } => "broker_unavailable",
            Self::ConnectionGone(_) => "connection_gone",
            Self::InvariantViolation { .. } => "invariant_violation",
            Self::ShuttingDown => "shutting_down",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_codes() {
        let err = MuxError::BrokerUnavailable {
            room: "lobby".into(),
            source: BrokerError::Unavailable("refused".into()),
        };
        assert_eq!(err.error_code(), "broker_unavailable");
        assert_eq!(MuxError::ShuttingDown.error_code(), "shutting_down");
        assert_eq!(
            MuxError::ConnectionGone(ConnectionId::new()).error_code(),
            "connection_gone"
        );
    }

    #[test]
    fn broker_unavailable_keeps_source() {
        let err = MuxError::BrokerUnavailable {
            room: "lobby".into(),
            source: BrokerError::Unavailable("refused".into()),
        };
        let source = std::error::Error::source(&err).unwrap();
        assert_eq!(source.to_string(), "broker unavailable: refused");
        assert!(err.to_string().contains("lobby"));
    }
}

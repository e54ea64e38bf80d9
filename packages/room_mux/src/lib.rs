//! Room Mux - room subscription multiplexing for a pub/sub chat relay
//!
//! Keeps exactly one upstream broker subscription per room no matter how many
//! local connections are in it, fans every broker payload out to those
//! connections, and closes the upstream when the last one leaves. It knows
//! nothing about HTTP, WebSockets or credentials.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use room_mux::{ConnectionId, ConnectionRegistry, LocalBroker, Payload, RoomMultiplexer, Transport};
//!
//! #[tokio::main]
//! async fn main() {
//!     let mux = RoomMultiplexer::new(
//!         Arc::new(LocalBroker::new()),
//!         Arc::new(ConnectionRegistry::new()),
//!     );
//!
//!     let conn = ConnectionId::new();
//!     let (transport, mut outbound) = Transport::channel(64);
//!     mux.registry().register(conn, transport);
//!
//!     mux.join("lobby", conn).await.unwrap();
//!     mux.publish("lobby", Payload::from("hi")).await.unwrap();
//!
//!     if let Some(frame) = outbound.recv().await {
//!         println!("{conn} got {frame}");
//!     }
//!
//!     mux.disconnect(conn).await;
//! }
//! ```

pub mod broker;
mod dispatcher;
mod error;
mod multiplexer;
mod registry;
mod stats;

use std::sync::Arc;

/// One text frame, shared by every recipient of a fan-out.
pub type Payload = Arc<str>;

pub use broker::{
    BrokerBridge, LocalBroker, LocalBrokerOptions, Subscription, SubscriptionFeed,
    SubscriptionHandle, SubscriptionStream,
};
pub use error::{BrokerError, DeliveryError, MuxError, RegistryError};
pub use multiplexer::{
    JoinOutcome, LeaveOutcome, RoomMultiplexer, RoomNotice, RoomSnapshot, ShutdownReport,
    UpstreamState,
};
pub use registry::{ConnectionId, ConnectionRegistry, Transport};
pub use stats::{MuxStats, MuxStatsSnapshot};

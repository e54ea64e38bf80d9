//! Fan-out Dispatcher
//!
//! One task per open upstream subscription. Each payload is delivered to a
//! snapshot of the room's members; a failing member never holds up the rest.

use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace};

use crate::Payload;
use crate::broker::SubscriptionStream;
use crate::error::{BrokerError, MuxError};
use crate::multiplexer::{RoomNotice, WeakMultiplexer};
use crate::registry::{ConnectionId, ConnectionRegistry};
use crate::stats::MuxStats;

pub(crate) struct Dispatcher {
    pub room: String,
    pub stream: SubscriptionStream,
    /// Cancelled when the owning handle is closed or dropped.
    pub closed: CancellationToken,
    pub registry: Arc<ConnectionRegistry>,
    pub stats: Arc<MuxStats>,
    pub notices: broadcast::Sender<RoomNotice>,
    pub mux: WeakMultiplexer,
}

impl Dispatcher {
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) {
        debug!(room = %self.room, "Dispatcher started");
        while let Some(payload) = self.stream.recv().await {
            MuxStats::bump(&self.stats.payloads_received);
            self.fan_out(payload);
        }

        if self.closed.is_cancelled() {
            debug!(room = %self.room, "Dispatcher finished");
            return;
        }

        let err = MuxError::BrokerUnavailable {
            room: self.room.clone(),
            source: BrokerError::Unavailable("upstream subscription ended".into()),
        };
        error!(room = %self.room, error = %err, "Upstream subscription lost");
        MuxStats::bump(&self.stats.upstreams_lost);
        let _ = self.notices.send(RoomNotice::UpstreamLost {
            room: self.room.clone(),
        });
    }

    fn fan_out(&self, payload: Payload) {
        let members = self.registry.membership_snapshot(&self.room);
        let mut delivered = 0u64;
        for conn in members {
            match self.registry.deliver(conn, payload.clone()) {
                Ok(()) => delivered += 1,
                Err(err) => {
                    MuxStats::bump(&self.stats.delivery_failures);
                    debug!(room = %self.room, conn_id = %conn, error = %err, "Delivery failed, evicting connection");
                    self.evict(conn);
                }
            }
        }
        MuxStats::add(&self.stats.deliveries, delivered);
        trace!(room = %self.room, delivered, "Fan-out pass complete");
    }

    /// Schedule a disconnect. Only the first failure for a connection spawns one.
    fn evict(&self, conn: ConnectionId) {
        if !self.registry.begin_close(conn) {
            return;
        }
        let Some(mux) = self.mux.upgrade() else {
            return;
        };
        tokio::spawn(async move {
            mux.disconnect(conn).await;
        });
    }
}

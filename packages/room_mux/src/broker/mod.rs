//! Broker Bridge
//!
//! Capability abstraction over the pub/sub backend. A bridge knows rooms and
//! payloads, nothing about client connections.

mod local;

pub use local::{LocalBroker, LocalBrokerOptions};

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::Payload;
use crate::error::BrokerError;

#[async_trait]
pub trait BrokerBridge: Send + Sync + 'static {
    /// Fire-and-forget publish. Not retried here.
    async fn publish(&self, room: &str, payload: Payload) -> Result<(), BrokerError>;

    /// Open a subscription that yields every payload published to `room` from
    /// the moment this call returns `Ok`. No replay of earlier payloads.
    async fn open_subscription(&self, room: &str) -> Result<Subscription, BrokerError>;
}

/// A freshly opened upstream subscription, split into its closable handle and
/// its payload stream.
#[derive(Debug)]
pub struct Subscription {
    pub handle: SubscriptionHandle,
    pub stream: SubscriptionStream,
}

impl Subscription {
    /// Build a subscription plus the feed its producer drives. `buffer` bounds
    /// how many payloads may sit between producer and consumer.
    pub fn channel(room: &str, buffer: usize) -> (Self, SubscriptionFeed) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        let (released_tx, released_rx) = oneshot::channel();
        let cancel = CancellationToken::new();

        let subscription = Self {
            handle: SubscriptionHandle {
                room: room.to_string(),
                cancel: cancel.clone(),
                released: Some(released_rx),
                closed: false,
            },
            stream: SubscriptionStream { rx },
        };
        let feed = SubscriptionFeed {
            tx,
            cancel,
            released: released_tx,
        };
        (subscription, feed)
    }
}

/// Owner's side of an upstream subscription.
#[derive(Debug)]
pub struct SubscriptionHandle {
    room: String,
    cancel: CancellationToken,
    released: Option<oneshot::Receiver<()>>,
    closed: bool,
}

impl SubscriptionHandle {
    pub fn room(&self) -> &str {
        &self.room
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Release the upstream resource and wait until the producer confirms it
    /// let go. A second call reports `AlreadyClosed` and changes nothing.
    pub async fn close(&mut self) -> Result<(), BrokerError> {
        if self.closed {
            return Err(BrokerError::AlreadyClosed {
                room: self.room.clone(),
            });
        }
        self.closed = true;
        self.cancel.cancel();
        if let Some(released) = self.released.take() {
            // A producer that died without confirming has released too.
            let _ = released.await;
        }
        debug!(room = %self.room, "Upstream subscription released");
        Ok(())
    }

    /// Token cancelled once `close` (or drop) has been requested.
    pub(crate) fn close_signal(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        if !self.closed {
            self.cancel.cancel();
        }
    }
}

/// Consumer's side: payloads in broker order. Ends when the producer goes
/// away, whether through `close` or an upstream failure.
#[derive(Debug)]
pub struct SubscriptionStream {
    rx: mpsc::Receiver<Payload>,
}

impl SubscriptionStream {
    pub async fn recv(&mut self) -> Option<Payload> {
        self.rx.recv().await
    }
}

/// Producer's side, held by the task that pumps payloads from the backend.
#[derive(Debug)]
pub struct SubscriptionFeed {
    tx: mpsc::Sender<Payload>,
    cancel: CancellationToken,
    released: oneshot::Sender<()>,
}

impl SubscriptionFeed {
    /// Forward one payload. Returns false once the subscription was closed or
    /// its consumer is gone, after which the producer should stop.
    pub async fn push(&self, payload: Payload) -> bool {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => false,
            sent = self.tx.send(payload) => sent.is_ok(),
        }
    }

    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Confirm the upstream resource is gone. Ends the stream and wakes a
    /// pending `close`.
    pub fn release(self) {
        let _ = self.released.send(());
    }
}

//! In-process broker: one `tokio::sync::broadcast` channel per room.
//!
//! Serves single-node deployments and the broker hub. The availability switch
//! and `sever` exist so callers can exercise outage paths.

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, warn};

use super::{BrokerBridge, Subscription};
use crate::Payload;
use crate::error::BrokerError;

#[derive(Debug, Clone)]
pub struct LocalBrokerOptions {
    /// Per-room broadcast capacity. Slow subscriptions skip ahead past this.
    pub channel_capacity: usize,
    /// Payloads buffered between a subscription's pump and its consumer.
    pub subscription_buffer: usize,
    /// Artificial latency before a subscription is acknowledged.
    pub open_delay: Duration,
    /// Artificial latency before a closed subscription confirms release.
    pub release_delay: Duration,
}

impl Default for LocalBrokerOptions {
    fn default() -> Self {
        Self {
            channel_capacity: 1024,
            subscription_buffer: 256,
            open_delay: Duration::ZERO,
            release_delay: Duration::ZERO,
        }
    }
}

struct Shared {
    channels: DashMap<String, broadcast::Sender<Payload>>,
    options: LocalBrokerOptions,
    available: AtomicBool,
    opened: AtomicU64,
    published: AtomicU64,
}

#[derive(Clone)]
pub struct LocalBroker {
    shared: Arc<Shared>,
}

impl Default for LocalBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalBroker {
    pub fn new() -> Self {
        Self::with_options(LocalBrokerOptions::default())
    }

    pub fn with_options(options: LocalBrokerOptions) -> Self {
        Self {
            shared: Arc::new(Shared {
                channels: DashMap::new(),
                options,
                available: AtomicBool::new(true),
                opened: AtomicU64::new(0),
                published: AtomicU64::new(0),
            }),
        }
    }

    /// Toggle reachability. While unavailable, opens and publishes fail with
    /// `BrokerError::Unavailable`; existing subscriptions keep flowing.
    pub fn set_available(&self, available: bool) {
        self.shared.available.store(available, Ordering::SeqCst);
    }

    pub fn is_available(&self) -> bool {
        self.shared.available.load(Ordering::SeqCst)
    }

    /// Drop the room's channel, ending every live subscription on it as if
    /// the upstream connection had died. Returns false if nothing was open.
    pub fn sever(&self, room: &str) -> bool {
        let severed = self.shared.channels.remove(room).is_some();
        if severed {
            warn!(room = %room, "Severed broker channel");
        }
        severed
    }

    /// Live subscriptions on `room`.
    pub fn active_subscriptions(&self, room: &str) -> usize {
        self.shared
            .channels
            .get(room)
            .map(|tx| tx.receiver_count())
            .unwrap_or(0)
    }

    /// Rooms with at least one live subscription.
    pub fn active_rooms(&self) -> usize {
        self.shared
            .channels
            .iter()
            .filter(|entry| entry.value().receiver_count() > 0)
            .count()
    }

    /// Subscriptions opened over the broker's lifetime.
    pub fn total_opened(&self) -> u64 {
        self.shared.opened.load(Ordering::Relaxed)
    }

    pub fn total_published(&self) -> u64 {
        self.shared.published.load(Ordering::Relaxed)
    }

    fn check_available(&self) -> Result<(), BrokerError> {
        if self.is_available() {
            Ok(())
        } else {
            Err(BrokerError::Unavailable("local broker offline".into()))
        }
    }
}

#[async_trait]
impl BrokerBridge for LocalBroker {
    async fn publish(&self, room: &str, payload: Payload) -> Result<(), BrokerError> {
        self.check_available()?;
        self.shared.published.fetch_add(1, Ordering::Relaxed);
        // Clone the sender out so the map shard is not held across send.
        let sender = self.shared.channels.get(room).map(|tx| tx.clone());
        if let Some(sender) = sender {
            // Err only means nobody is listening right now.
            let _ = sender.send(payload);
        }
        Ok(())
    }

    async fn open_subscription(&self, room: &str) -> Result<Subscription, BrokerError> {
        self.check_available()?;
        let options = &self.shared.options;
        if !options.open_delay.is_zero() {
            tokio::time::sleep(options.open_delay).await;
            self.check_available()?;
        }

        // Subscribe under the entry lock so a concurrent cleanup cannot remove
        // the channel between lookup and subscribe.
        let mut receiver = self
            .shared
            .channels
            .entry(room.to_string())
            .or_insert_with(|| broadcast::channel(options.channel_capacity.max(1)).0)
            .subscribe();
        self.shared.opened.fetch_add(1, Ordering::Relaxed);

        let (subscription, feed) = Subscription::channel(room, options.subscription_buffer);
        let shared = self.shared.clone();
        let room = room.to_string();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = feed.cancelled() => break,
                    received = receiver.recv() => match received {
                        Ok(payload) => {
                            if !feed.push(payload).await {
                                break;
                            }
                        }
                        Err(RecvError::Lagged(skipped)) => {
                            warn!(room = %room, skipped, "Subscription lagged behind broker channel");
                        }
                        Err(RecvError::Closed) => {
                            debug!(room = %room, "Broker channel closed under subscription");
                            break;
                        }
                    }
                }
            }

            drop(receiver);
            shared
                .channels
                .remove_if(&room, |_, tx| tx.receiver_count() == 0);
            let release_delay = shared.options.release_delay;
            if !release_delay.is_zero() {
                tokio::time::sleep(release_delay).await;
            }
            feed.release();
        });

        debug!(room = %subscription.handle.room(), "Opened local subscription");
        Ok(subscription)
    }
}

//! Multiplexer counters

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct MuxStats {
    // Upstream lifecycle
    pub upstreams_opened: AtomicU64,
    pub upstreams_closed: AtomicU64,
    /// Subscriptions that ended without being closed
    pub upstreams_lost: AtomicU64,
    pub open_failures: AtomicU64,

    // Traffic
    pub publish_failures: AtomicU64,
    /// Payloads pulled off upstream subscriptions
    pub payloads_received: AtomicU64,
    /// Successful per-connection deliveries
    pub deliveries: AtomicU64,
    /// Deliveries that found the connection gone or overflowing
    pub delivery_failures: AtomicU64,
}

impl MuxStats {
    pub(crate) fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn add(counter: &AtomicU64, n: u64) {
        if n > 0 {
            counter.fetch_add(n, Ordering::Relaxed);
        }
    }

    pub fn snapshot(&self) -> MuxStatsSnapshot {
        MuxStatsSnapshot {
            upstreams_opened: self.upstreams_opened.load(Ordering::Relaxed),
            upstreams_closed: self.upstreams_closed.load(Ordering::Relaxed),
            upstreams_lost: self.upstreams_lost.load(Ordering::Relaxed),
            open_failures: self.open_failures.load(Ordering::Relaxed),
            publish_failures: self.publish_failures.load(Ordering::Relaxed),
            payloads_received: self.payloads_received.load(Ordering::Relaxed),
            deliveries: self.deliveries.load(Ordering::Relaxed),
            delivery_failures: self.delivery_failures.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MuxStatsSnapshot {
    pub upstreams_opened: u64,
    pub upstreams_closed: u64,
    pub upstreams_lost: u64,
    pub open_failures: u64,
    pub publish_failures: u64,
    pub payloads_received: u64,
    pub deliveries: u64,
    pub delivery_failures: u64,
}

impl MuxStatsSnapshot {
    /// Upstream subscriptions currently held, as far as the counters know.
    pub fn upstreams_active(&self) -> u64 {
        self.upstreams_opened.saturating_sub(self.upstreams_closed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reflects_counters() {
        let stats = MuxStats::default();
        MuxStats::bump(&stats.upstreams_opened);
        MuxStats::bump(&stats.upstreams_opened);
        MuxStats::bump(&stats.upstreams_closed);
        MuxStats::add(&stats.deliveries, 3);

        let snap = stats.snapshot();
        assert_eq!(snap.upstreams_opened, 2);
        assert_eq!(snap.upstreams_active(), 1);
        assert_eq!(snap.deliveries, 3);
        assert_eq!(snap.delivery_failures, 0);
    }
}

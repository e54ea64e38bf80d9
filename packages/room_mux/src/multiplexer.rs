//! Room Subscription Multiplexer
//!
//! Holds, per room, the set of interested local connections and at most one
//! upstream broker subscription. The first join opens it, the last leave
//! closes it.
//!
//! Every room has its own async mutex, held across the broker open/close
//! await, so operations on one room are linearized while different rooms run
//! in parallel. A slot that has been torn down is marked retired and removed
//! from the table; anyone who was queued on its lock retries on a fresh slot.

use dashmap::DashMap;
use futures::StreamExt;
use futures::future::join_all;
use futures::stream::FuturesUnordered;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{Mutex, broadcast};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::Payload;
use crate::broker::{BrokerBridge, Subscription, SubscriptionHandle};
use crate::dispatcher::Dispatcher;
use crate::error::{MuxError, RegistryError};
use crate::registry::{ConnectionId, ConnectionRegistry};
use crate::stats::{MuxStats, MuxStatsSnapshot};

const NOTICE_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UpstreamState {
    Closed,
    Opening,
    Open,
    Closing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinOutcome {
    AlreadyMember,
    /// Added to a room whose upstream was already open.
    Joined,
    /// First member; this join opened the upstream.
    Opened,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaveOutcome {
    NotMember,
    Left,
    /// Last member; this leave closed the upstream.
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoomNotice {
    /// The broker ended a subscription nobody closed. Members stay joined but
    /// receive nothing until the room is reopened.
    UpstreamLost { room: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RoomSnapshot {
    pub room: String,
    pub subscribers: usize,
    pub state: UpstreamState,
    pub upstream_open: bool,
    /// The dispatcher exited while the handle was still held.
    pub upstream_lost: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ShutdownReport {
    /// Rooms whose upstream closed within the drain timeout.
    pub closed: Vec<String>,
    /// Rooms force-closed at the deadline.
    pub forced: Vec<String>,
}

impl ShutdownReport {
    pub fn is_clean(&self) -> bool {
        self.forced.is_empty()
    }
}

struct RoomSlot {
    state: UpstreamState,
    subscribers: HashSet<ConnectionId>,
    upstream: Option<SubscriptionHandle>,
    dispatcher: Option<JoinHandle<()>>,
    retired: bool,
}

impl RoomSlot {
    fn new() -> Self {
        Self {
            state: UpstreamState::Closed,
            subscribers: HashSet::new(),
            upstream: None,
            dispatcher: None,
            retired: false,
        }
    }

    fn upstream_lost(&self) -> bool {
        self.upstream.is_some()
            && self
                .dispatcher
                .as_ref()
                .is_some_and(|dispatcher| dispatcher.is_finished())
    }
}

type SlotRef = Arc<Mutex<RoomSlot>>;

struct Inner {
    broker: Arc<dyn BrokerBridge>,
    registry: Arc<ConnectionRegistry>,
    rooms: DashMap<String, SlotRef>,
    notices: broadcast::Sender<RoomNotice>,
    shutting_down: AtomicBool,
    stats: Arc<MuxStats>,
}

/// Cheap to clone; all clones share one room table.
#[derive(Clone)]
pub struct RoomMultiplexer {
    inner: Arc<Inner>,
}

/// Non-owning reference held by dispatcher tasks.
#[derive(Clone)]
pub(crate) struct WeakMultiplexer {
    inner: Weak<Inner>,
}

impl WeakMultiplexer {
    pub fn upgrade(&self) -> Option<RoomMultiplexer> {
        self.inner.upgrade().map(|inner| RoomMultiplexer { inner })
    }
}

impl RoomMultiplexer {
    pub fn new(broker: Arc<dyn BrokerBridge>, registry: Arc<ConnectionRegistry>) -> Self {
        let (notices, _) = broadcast::channel(NOTICE_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                broker,
                registry,
                rooms: DashMap::new(),
                notices,
                shutting_down: AtomicBool::new(false),
                stats: Arc::new(MuxStats::default()),
            }),
        }
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.inner.registry
    }

    pub fn stats(&self) -> MuxStatsSnapshot {
        self.inner.stats.snapshot()
    }

    pub fn subscribe_notices(&self) -> broadcast::Receiver<RoomNotice> {
        self.inner.notices.subscribe()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.shutting_down.load(Ordering::SeqCst)
    }

    /// Number of room records, including ones mid-transition.
    pub fn room_count(&self) -> usize {
        self.inner.rooms.len()
    }

    pub(crate) fn downgrade(&self) -> WeakMultiplexer {
        WeakMultiplexer {
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Add `conn` to `room`. The first member opens the upstream subscription
    /// before this returns; a failed open leaves no trace of the attempt.
    ///
    /// The room change runs on its own task and completes even if the caller
    /// stops waiting for it.
    pub async fn join(&self, room: &str, conn: ConnectionId) -> Result<JoinOutcome, MuxError> {
        let mux = self.clone();
        let key = room.to_string();
        let task = tokio::spawn(async move { mux.join_room(&key, conn).await });
        self.settle(room, task).await
    }

    async fn join_room(&self, room: &str, conn: ConnectionId) -> Result<JoinOutcome, MuxError> {
        loop {
            self.ensure_running()?;
            let slot = self.slot_for(room);
            let mut guard = slot.lock().await;
            if guard.retired {
                continue;
            }
            if self.is_shutting_down() {
                self.retire_if_empty(room, &slot, &mut guard);
                return Err(MuxError::ShuttingDown);
            }
            self.check_invariant(room, &guard)?;

            if guard.subscribers.contains(&conn) {
                return Ok(JoinOutcome::AlreadyMember);
            }

            match self.inner.registry.add_membership(conn, room) {
                Ok(true) => {}
                Ok(false) => {
                    self.retire_if_empty(room, &slot, &mut guard);
                    return Err(self.violation(
                        room,
                        format!("registry lists {conn} as a member but the room does not"),
                    ));
                }
                Err(RegistryError::UnknownConnection | RegistryError::Closing) => {
                    self.retire_if_empty(room, &slot, &mut guard);
                    return Err(MuxError::ConnectionGone(conn));
                }
            }

            let reopening = guard.upstream_lost();
            if guard.upstream.is_some() && !reopening {
                guard.subscribers.insert(conn);
                debug!(room = %room, conn_id = %conn, members = guard.subscribers.len(), "Joined room");
                return Ok(JoinOutcome::Joined);
            }

            // A lost upstream is replaced only once its successor is open, so
            // existing members never sit in a room without a handle.
            if reopening {
                info!(room = %room, conn_id = %conn, "Reopening lost upstream subscription");
            } else {
                guard.state = UpstreamState::Opening;
            }
            match self.inner.broker.open_subscription(room).await {
                Ok(Subscription { handle, stream }) => {
                    if reopening {
                        self.close_upstream(room, &mut guard).await;
                    }
                    let dispatcher = Dispatcher {
                        room: room.to_string(),
                        stream,
                        closed: handle.close_signal(),
                        registry: self.inner.registry.clone(),
                        stats: self.inner.stats.clone(),
                        notices: self.inner.notices.clone(),
                        mux: self.downgrade(),
                    };
                    guard.dispatcher = Some(dispatcher.spawn());
                    guard.upstream = Some(handle);
                    guard.state = UpstreamState::Open;
                    guard.subscribers.insert(conn);
                    MuxStats::bump(&self.inner.stats.upstreams_opened);
                    info!(room = %room, conn_id = %conn, "Opened upstream subscription");
                    return Ok(JoinOutcome::Opened);
                }
                Err(source) => {
                    self.inner.registry.remove_membership(conn, room);
                    if !reopening {
                        guard.state = UpstreamState::Closed;
                        self.retire(room, &slot, &mut guard);
                    }
                    MuxStats::bump(&self.inner.stats.open_failures);
                    warn!(room = %room, conn_id = %conn, error = %source, "Failed to open upstream subscription");
                    return Err(MuxError::BrokerUnavailable {
                        room: room.to_string(),
                        source,
                    });
                }
            }
        }
    }

    /// Remove `conn` from `room`. The last member closes the upstream and the
    /// room record goes away. Like `join`, runs to completion on its own task.
    pub async fn leave(&self, room: &str, conn: ConnectionId) -> Result<LeaveOutcome, MuxError> {
        let mux = self.clone();
        let key = room.to_string();
        let task = tokio::spawn(async move { mux.leave_room(&key, conn).await });
        self.settle(room, task).await
    }

    async fn leave_room(&self, room: &str, conn: ConnectionId) -> Result<LeaveOutcome, MuxError> {
        loop {
            let Some(slot) = self.existing_slot(room) else {
                return Ok(LeaveOutcome::NotMember);
            };
            let mut guard = slot.lock().await;
            if guard.retired {
                continue;
            }
            self.check_invariant(room, &guard)?;

            if !guard.subscribers.remove(&conn) {
                return Ok(LeaveOutcome::NotMember);
            }
            if !self.inner.registry.remove_membership(conn, room) {
                debug!(room = %room, conn_id = %conn, "Connection already unregistered while leaving");
            }

            if !guard.subscribers.is_empty() {
                debug!(room = %room, conn_id = %conn, members = guard.subscribers.len(), "Left room");
                return Ok(LeaveOutcome::Left);
            }

            self.close_upstream(room, &mut guard).await;
            self.retire(room, &slot, &mut guard);
            return Ok(LeaveOutcome::Closed);
        }
    }

    /// Leave every room `conn` belongs to. Returns how many memberships were
    /// removed.
    pub async fn leave_all(&self, conn: ConnectionId) -> usize {
        let rooms = self.inner.registry.rooms_of(conn);
        if rooms.is_empty() {
            return 0;
        }
        let results = join_all(rooms.iter().map(|room| self.leave(room, conn))).await;

        let mut left = 0;
        for (room, result) in rooms.iter().zip(results) {
            match result {
                Ok(LeaveOutcome::NotMember) => {}
                Ok(_) => left += 1,
                Err(err) => {
                    warn!(room = %room, conn_id = %conn, error = %err, "Leave failed during leave_all")
                }
            }
        }
        left
    }

    /// Publish to the broker regardless of local interest. Takes no room lock.
    pub async fn publish(&self, room: &str, payload: Payload) -> Result<(), MuxError> {
        self.ensure_running()?;
        self.inner
            .broker
            .publish(room, payload)
            .await
            .map_err(|source| {
                MuxStats::bump(&self.inner.stats.publish_failures);
                MuxError::BrokerUnavailable {
                    room: room.to_string(),
                    source,
                }
            })
    }

    /// Tear a connection down: refuse new joins, leave every room, then drop
    /// it from the registry. Safe to call more than once.
    pub async fn disconnect(&self, conn: ConnectionId) -> usize {
        self.inner.registry.begin_close(conn);
        let left = self.leave_all(conn).await;
        self.inner.registry.unregister(conn);
        debug!(conn_id = %conn, rooms_left = left, "Disconnected");
        left
    }

    /// Settled view of the room table.
    pub async fn rooms(&self) -> Vec<RoomSnapshot> {
        let slots: Vec<(String, SlotRef)> = self
            .inner
            .rooms
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();

        let mut snapshots = Vec::with_capacity(slots.len());
        for (room, slot) in slots {
            let guard = slot.lock().await;
            if guard.retired {
                continue;
            }
            snapshots.push(RoomSnapshot {
                room,
                subscribers: guard.subscribers.len(),
                state: guard.state,
                upstream_open: guard.upstream.is_some(),
                upstream_lost: guard.upstream_lost(),
            });
        }
        snapshots.sort_by(|a, b| a.room.cmp(&b.room));
        snapshots
    }

    /// Members of `room` according to the room record.
    pub async fn subscribers(&self, room: &str) -> Vec<ConnectionId> {
        let Some(slot) = self.existing_slot(room) else {
            return Vec::new();
        };
        let guard = slot.lock().await;
        if guard.retired {
            return Vec::new();
        }
        guard.subscribers.iter().copied().collect()
    }

    /// Close every upstream, waiting up to `drain_timeout` for them to
    /// release. Whatever is left afterwards is dropped without waiting and
    /// reported in `forced`.
    pub async fn shutdown(&self, drain_timeout: Duration) -> ShutdownReport {
        if self.inner.shutting_down.swap(true, Ordering::SeqCst) {
            debug!("Shutdown already in progress");
        }
        let slots: Vec<(String, SlotRef)> = self
            .inner
            .rooms
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();
        info!(rooms = slots.len(), ?drain_timeout, "Draining room subscriptions");

        let mut report = ShutdownReport::default();
        let mut pending: FuturesUnordered<_> = slots
            .into_iter()
            .map(|(room, slot)| async move { self.drain_slot(room, slot).await })
            .collect();

        let drained = tokio::time::timeout(drain_timeout, async {
            while let Some(closed) = pending.next().await {
                if let Some(room) = closed {
                    report.closed.push(room);
                }
            }
        })
        .await;
        drop(pending);

        if drained.is_err() {
            report.forced = self.force_close_remaining();
        }
        report.closed.sort();
        report.forced.sort();

        if report.is_clean() {
            info!(closed = report.closed.len(), "Room subscriptions drained");
        } else {
            warn!(
                closed = report.closed.len(),
                forced = report.forced.len(),
                "Drain timed out, remaining upstreams force-closed"
            );
        }
        report
    }

    async fn drain_slot(&self, room: String, slot: SlotRef) -> Option<String> {
        let mut guard = slot.lock().await;
        if guard.retired {
            return None;
        }
        let had_upstream = guard.upstream.is_some();
        if had_upstream {
            self.close_upstream(&room, &mut guard).await;
        }
        self.release_members(&room, &mut guard);
        self.retire(&room, &slot, &mut guard);
        had_upstream.then_some(room)
    }

    fn force_close_remaining(&self) -> Vec<String> {
        let slots: Vec<(String, SlotRef)> = self
            .inner
            .rooms
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();

        let mut forced = Vec::with_capacity(slots.len());
        for (room, slot) in slots {
            match slot.try_lock() {
                Ok(mut guard) => {
                    if let Some(dispatcher) = guard.dispatcher.take() {
                        dispatcher.abort();
                    }
                    // Dropping an unclosed handle releases it without waiting.
                    guard.upstream = None;
                    guard.state = UpstreamState::Closed;
                    self.release_members(&room, &mut guard);
                    self.retire(&room, &slot, &mut guard);
                }
                Err(_) => {
                    self.inner
                        .rooms
                        .remove_if(&room, |_, current| Arc::ptr_eq(current, &slot));
                }
            }
            warn!(room = %room, "Upstream force-closed after drain timeout");
            forced.push(room);
        }
        forced
    }

    fn release_members(&self, room: &str, slot: &mut RoomSlot) {
        for conn in slot.subscribers.drain() {
            self.inner.registry.remove_membership(conn, room);
        }
    }

    async fn close_upstream(&self, room: &str, slot: &mut RoomSlot) {
        slot.state = UpstreamState::Closing;
        if let Some(mut handle) = slot.upstream.take() {
            if let Err(err) = handle.close().await {
                warn!(room = %room, error = %err, "Upstream close reported an error");
            }
        }
        if let Some(dispatcher) = slot.dispatcher.take() {
            if let Err(err) = dispatcher.await {
                error!(room = %room, error = %err, "Dispatcher task failed");
            }
        }
        slot.state = UpstreamState::Closed;
        MuxStats::bump(&self.inner.stats.upstreams_closed);
        info!(room = %room, "Closed upstream subscription");
    }

    async fn settle<T>(
        &self,
        room: &str,
        task: JoinHandle<Result<T, MuxError>>,
    ) -> Result<T, MuxError> {
        match task.await {
            Ok(result) => result,
            Err(err) => Err(self.violation(room, format!("room task failed: {err}"))),
        }
    }

    fn ensure_running(&self) -> Result<(), MuxError> {
        if self.is_shutting_down() {
            Err(MuxError::ShuttingDown)
        } else {
            Ok(())
        }
    }

    fn slot_for(&self, room: &str) -> SlotRef {
        self.inner
            .rooms
            .entry(room.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(RoomSlot::new())))
            .clone()
    }

    fn existing_slot(&self, room: &str) -> Option<SlotRef> {
        self.inner.rooms.get(room).map(|entry| entry.value().clone())
    }

    /// Mark the slot dead and drop it from the table. Must be called with the
    /// slot's lock held.
    fn retire(&self, room: &str, slot: &SlotRef, guard: &mut RoomSlot) {
        guard.retired = true;
        self.inner
            .rooms
            .remove_if(room, |_, current| Arc::ptr_eq(current, slot));
    }

    fn retire_if_empty(&self, room: &str, slot: &SlotRef, guard: &mut RoomSlot) {
        if guard.subscribers.is_empty() && guard.upstream.is_none() {
            self.retire(room, slot, guard);
        }
    }

    fn check_invariant(&self, room: &str, slot: &RoomSlot) -> Result<(), MuxError> {
        let detail = match (slot.subscribers.is_empty(), slot.upstream.is_some()) {
            (false, false) => "subscribers present without an upstream subscription",
            (true, true) => "upstream subscription held with no subscribers",
            _ => return Ok(()),
        };
        Err(self.violation(room, detail.to_string()))
    }

    fn violation(&self, room: &str, detail: String) -> MuxError {
        error!(room = %room, detail = %detail, "Room invariant violated");
        MuxError::InvariantViolation {
            room: room.to_string(),
            detail,
        }
    }
}

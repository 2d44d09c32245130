//! # Connection Handle and Outbound Queue
//!
//! A `ConnectionHandle` is the shared, registry-visible half of a WebSocket
//! session. The dispatcher pushes into its [`OutboundQueue`]; exactly one
//! delivery worker pops from it. Socket I/O never happens here.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::core::event::Event;
use crate::core::scope::Scope;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique session identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Allocates the next identifier from the process-wide counter.
    pub fn next() -> Self {
        Self(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl From<u64> for ConnectionId {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Session lifecycle: `Connecting -> Active -> Draining -> Closed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum ConnectionState {
    Connecting = 0,
    /// Registered and receiving events.
    Active = 1,
    /// Close requested or deregistered; the worker may still be flushing.
    Draining = 2,
    /// The delivery worker has finished.
    Closed = 3,
}

impl ConnectionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Connecting,
            1 => Self::Active,
            2 => Self::Draining,
            _ => Self::Closed,
        }
    }
}

/// Why a session is being torn down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    /// The peer closed the socket or the read half failed.
    ClientGone,
    /// The dispatcher gave up on a session that stopped draining its queue.
    Backpressure,
    /// The gateway is shutting down.
    Shutdown,
    /// Explicit server-side disconnect.
    Requested,
    /// A write to the socket failed or timed out.
    TransportError,
}

impl CloseReason {
    /// Remaining queued frames are flushed before closing.
    pub fn drains(self) -> bool {
        matches!(self, Self::Shutdown | Self::Requested)
    }

    /// WebSocket close frame to send, if the socket is still usable.
    pub fn close_frame(self) -> Option<(u16, &'static str)> {
        match self {
            Self::Backpressure => Some((1013, "slow consumer: outbound queue overflow")),
            Self::Shutdown => Some((1001, "server shutting down")),
            Self::Requested => Some((1000, "closed by server")),
            Self::ClientGone | Self::TransportError => None,
        }
    }
}

/// What to do when a session's queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Reject the incoming event for this session only.
    #[default]
    DropNewest,
    /// Evict the oldest queued event to make room for the incoming one.
    DropOldest,
}

/// Result of a non-blocking push.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Queued,
    /// Queue was full; the incoming event was discarded.
    DroppedNewest,
    /// Queue was full; the oldest event was evicted and the new one queued.
    DroppedOldest,
    /// The queue has been torn down.
    Closed,
}

impl PushOutcome {
    pub fn is_drop(self) -> bool {
        matches!(self, Self::DroppedNewest | Self::DroppedOldest)
    }
}

/// Bounded FIFO between the dispatcher (single writer) and a delivery worker
/// (single reader).
pub struct OutboundQueue {
    items: Mutex<VecDeque<Arc<Event>>>,
    capacity: usize,
    notify: Notify,
    closed: AtomicBool,
}

impl OutboundQueue {
    /// `capacity` is clamped to at least one slot.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            items: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            notify: Notify::new(),
            closed: AtomicBool::new(false),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Never blocks. The queue never holds more than `capacity` events.
    pub fn try_push(&self, event: Arc<Event>, policy: OverflowPolicy) -> PushOutcome {
        let outcome = {
            let mut items = self.lock();
            if self.is_closed() {
                return PushOutcome::Closed;
            }
            if items.len() < self.capacity {
                items.push_back(event);
                PushOutcome::Queued
            } else {
                match policy {
                    OverflowPolicy::DropNewest => return PushOutcome::DroppedNewest,
                    OverflowPolicy::DropOldest => {
                        items.pop_front();
                        items.push_back(event);
                        PushOutcome::DroppedOldest
                    }
                }
            }
        };
        self.notify.notify_one();
        outcome
    }

    pub fn try_pop(&self) -> Option<Arc<Event>> {
        self.lock().pop_front()
    }

    /// Waits for the next event. Returns `None` once the queue is closed and
    /// empty. Cancel-safe: dropping the future loses nothing.
    pub async fn pop(&self) -> Option<Arc<Event>> {
        loop {
            if let Some(event) = self.try_pop() {
                return Some(event);
            }
            if self.is_closed() {
                return None;
            }
            // notify_one stores a permit when nobody waits, so a push racing
            // with the checks above still wakes us.
            self.notify.notified().await;
        }
    }

    /// Tears the queue down, discarding whatever is still queued. Returns the
    /// number of discarded events.
    pub fn close(&self) -> usize {
        let discarded = {
            let mut items = self.lock();
            self.closed.store(true, Ordering::Release);
            let n = items.len();
            items.clear();
            n
        };
        self.notify.notify_one();
        discarded
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<Arc<Event>>> {
        self.items.lock().expect("outbound queue lock poisoned")
    }
}

/// Shared view of one session, referenced by the registry and the dispatcher.
pub struct ConnectionHandle {
    id: ConnectionId,
    scope: Scope,
    queue: Arc<OutboundQueue>,
    state: AtomicU8,
    consecutive_drops: AtomicU32,
    degraded: AtomicBool,
    close_token: CancellationToken,
    close_reason: OnceLock<CloseReason>,
    connected_at: DateTime<Utc>,
}

impl ConnectionHandle {
    /// Creates a session in `Connecting` state with a fresh id.
    pub fn new(scope: Scope, queue_capacity: usize) -> Arc<Self> {
        Self::with_id(ConnectionId::next(), scope, queue_capacity)
    }

    pub fn with_id(id: ConnectionId, scope: Scope, queue_capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            id,
            scope,
            queue: Arc::new(OutboundQueue::new(queue_capacity)),
            state: AtomicU8::new(ConnectionState::Connecting as u8),
            consecutive_drops: AtomicU32::new(0),
            degraded: AtomicBool::new(false),
            close_token: CancellationToken::new(),
            close_reason: OnceLock::new(),
            connected_at: Utc::now(),
        })
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn scope(&self) -> &Scope {
        &self.scope
    }

    pub fn queue(&self) -> &Arc<OutboundQueue> {
        &self.queue
    }

    pub fn connected_at(&self) -> DateTime<Utc> {
        self.connected_at
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn set_state(&self, state: ConnectionState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Moves `from` to `to` only if the session is still in `from`.
    pub fn transition(&self, from: ConnectionState, to: ConnectionState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Relaxed)
    }

    pub fn consecutive_drops(&self) -> u32 {
        self.consecutive_drops.load(Ordering::Relaxed)
    }

    /// Records one dropped event; returns the length of the current streak.
    pub(crate) fn record_drop(&self) -> u32 {
        self.degraded.store(true, Ordering::Relaxed);
        self.consecutive_drops.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub(crate) fn record_delivery(&self) {
        if self.consecutive_drops.swap(0, Ordering::Relaxed) > 0 {
            self.degraded.store(false, Ordering::Relaxed);
        }
    }

    /// Asks the delivery worker to close the session. The first reason wins;
    /// returns `false` if a close had already been requested.
    pub fn request_close(&self, reason: CloseReason) -> bool {
        let first = self.close_reason.set(reason).is_ok();
        self.close_token.cancel();
        first
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        self.close_reason.get().copied()
    }

    pub fn is_close_requested(&self) -> bool {
        self.close_token.is_cancelled()
    }

    /// Resolves once a close has been requested.
    pub async fn closed(&self) {
        self.close_token.cancelled().await
    }
}

impl fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("id", &self.id)
            .field("scope", &self.scope)
            .field("state", &self.state())
            .field("queued", &self.queue.len())
            .field("consecutive_drops", &self.consecutive_drops())
            .finish()
    }
}

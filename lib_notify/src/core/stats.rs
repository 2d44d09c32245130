//! # Operational Signals
//!
//! Counters and events external monitoring consumes: a dropped-event counter
//! per scope, global dispatch counters, and a broadcast stream of degraded /
//! force-closed session notifications.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;
use tokio::sync::broadcast;

use crate::core::connection::ConnectionId;
use crate::core::scope::Scope;

const SIGNAL_CAPACITY: usize = 256;

/// Session health notifications emitted by the dispatcher.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "signal", rename_all = "snake_case")]
pub enum OperationalSignal {
    /// First drop of a streak: the session's queue is full.
    Degraded {
        connection_id: ConnectionId,
        scope: Scope,
    },
    /// The drop streak reached the threshold and the session was closed.
    ForcedClose {
        connection_id: ConnectionId,
        scope: Scope,
        consecutive_drops: u32,
    },
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ScopeDrops {
    pub tenant_id: String,
    pub workspace_id: String,
    pub dropped: u64,
}

/// Point-in-time copy of the counters.
#[derive(Debug, Clone, Default, Serialize)]
pub struct StatsSnapshot {
    pub events_received: u64,
    pub events_without_subscribers: u64,
    pub events_requeued: u64,
    pub deliveries_enqueued: u64,
    pub deliveries_dropped: u64,
    pub connections_force_closed: u64,
    pub dropped_by_scope: Vec<ScopeDrops>,
}

pub struct DispatchStats {
    events_received: AtomicU64,
    events_without_subscribers: AtomicU64,
    events_requeued: AtomicU64,
    deliveries_enqueued: AtomicU64,
    deliveries_dropped: AtomicU64,
    connections_force_closed: AtomicU64,
    dropped_by_scope: Mutex<HashMap<Scope, u64>>,
    signals: broadcast::Sender<OperationalSignal>,
}

impl Default for DispatchStats {
    fn default() -> Self {
        let (signals, _) = broadcast::channel(SIGNAL_CAPACITY);
        Self {
            events_received: AtomicU64::new(0),
            events_without_subscribers: AtomicU64::new(0),
            events_requeued: AtomicU64::new(0),
            deliveries_enqueued: AtomicU64::new(0),
            deliveries_dropped: AtomicU64::new(0),
            connections_force_closed: AtomicU64::new(0),
            dropped_by_scope: Mutex::new(HashMap::new()),
            signals,
        }
    }
}

impl DispatchStats {
    /// Subscribes to degraded / forced-close notifications. Slow subscribers
    /// lag and skip; they never slow the dispatcher down.
    pub fn subscribe(&self) -> broadcast::Receiver<OperationalSignal> {
        self.signals.subscribe()
    }

    pub(crate) fn event_received(&self) {
        self.events_received.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn no_subscribers(&self) {
        self.events_without_subscribers.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn requeued(&self) {
        self.events_requeued.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn enqueued(&self, n: u64) {
        self.deliveries_enqueued.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn dropped(&self, scope: &Scope) {
        self.deliveries_dropped.fetch_add(1, Ordering::Relaxed);
        let mut by_scope = self.dropped_by_scope.lock().expect("stats lock poisoned");
        *by_scope.entry(scope.clone()).or_insert(0) += 1;
    }

    pub(crate) fn force_closed(&self) {
        self.connections_force_closed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn emit(&self, signal: OperationalSignal) {
        // No subscribers is fine.
        let _ = self.signals.send(signal);
    }

    /// Dropped-event count for one scope.
    pub fn dropped_for(&self, scope: &Scope) -> u64 {
        self.dropped_by_scope
            .lock()
            .expect("stats lock poisoned")
            .get(scope)
            .copied()
            .unwrap_or(0)
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let mut dropped_by_scope: Vec<ScopeDrops> = self
            .dropped_by_scope
            .lock()
            .expect("stats lock poisoned")
            .iter()
            .map(|(scope, dropped)| ScopeDrops {
                tenant_id: scope.tenant_id().to_string(),
                workspace_id: scope.workspace_id().to_string(),
                dropped: *dropped,
            })
            .collect();
        dropped_by_scope.sort_by(|a, b| b.dropped.cmp(&a.dropped));

        StatsSnapshot {
            events_received: self.events_received.load(Ordering::Relaxed),
            events_without_subscribers: self.events_without_subscribers.load(Ordering::Relaxed),
            events_requeued: self.events_requeued.load(Ordering::Relaxed),
            deliveries_enqueued: self.deliveries_enqueued.load(Ordering::Relaxed),
            deliveries_dropped: self.deliveries_dropped.load(Ordering::Relaxed),
            connections_force_closed: self.connections_force_closed.load(Ordering::Relaxed),
            dropped_by_scope,
        }
    }
}

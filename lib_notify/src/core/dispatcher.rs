//! # Scope-Keyed Fanout Dispatcher
//!
//! The `Dispatcher` takes each decoded event, resolves the sessions
//! registered under the event's scope and hands the event to each of them.
//!
//! ## Core Design Principles:
//!
//! 1.  **Zero-Copy Fan-out**: the event is wrapped in an `Arc` once and every
//!     session queue receives a pointer to the same allocation, including the
//!     pre-rendered outbound frame.
//!
//! 2.  **Never Block the Stream**: every enqueue is a `try_push` on a bounded
//!     queue. One slow session can cost itself events; it can never stall
//!     delivery to anyone else.
//!
//! 3.  **Bounded Failure for Slow Clients**: a full queue drops according to
//!     the configured [`OverflowPolicy`] and marks the session degraded. After
//!     `max_consecutive_drops` drops in a row the session is force-closed and
//!     deregistered instead of being allowed to lag forever.
//!
//! 4.  **Ack on Attempt**: the upstream delivery is acknowledged once fanout
//!     was attempted for every resolved session, zero sessions included.
//!     Per-session delivery is best-effort.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::core::connection::{CloseReason, ConnectionHandle, OverflowPolicy, PushOutcome};
use crate::core::event::{Event, Outcome};
use crate::core::registry::Registry;
use crate::core::stats::{DispatchStats, OperationalSignal};
use crate::ingestors::{EventSource, SourceError};

/// Queue sizing and backpressure policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatcherConfig {
    /// Capacity of every session's outbound queue.
    pub queue_capacity: usize,
    pub overflow_policy: OverflowPolicy,
    /// Consecutive drops after which a session is force-closed. Clamped to at
    /// least one.
    pub max_consecutive_drops: u32,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 256,
            overflow_policy: OverflowPolicy::DropNewest,
            max_consecutive_drops: 64,
        }
    }
}

/// What happened to one event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchReport {
    /// Sessions registered under the scope at lookup time.
    pub matched: usize,
    pub enqueued: usize,
    pub dropped: usize,
    pub forced_closed: usize,
    pub outcome: Outcome,
}

impl DispatchReport {
    fn settled(outcome: Outcome) -> Self {
        Self {
            matched: 0,
            enqueued: 0,
            dropped: 0,
            forced_closed: 0,
            outcome,
        }
    }
}

pub struct Dispatcher {
    registry: Arc<Registry>,
    config: DispatcherConfig,
    stats: Arc<DispatchStats>,
    closed: AtomicBool,
}

impl Dispatcher {
    pub fn new(registry: Arc<Registry>, config: DispatcherConfig) -> Self {
        Self {
            registry,
            config,
            stats: Arc::new(DispatchStats::default()),
            closed: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn stats(&self) -> &Arc<DispatchStats> {
        &self.stats
    }

    /// Stops accepting events; anything dispatched afterwards is requeued.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Fans one event out to its scope. Never blocks.
    pub fn dispatch(&self, event: Event) -> DispatchReport {
        if self.is_closed() {
            self.stats.requeued();
            log::debug!("Dispatcher closed; requeueing {}", event.delivery_tag());
            return DispatchReport::settled(Outcome::Requeue);
        }

        self.stats.event_received();
        let targets = self.registry.lookup(event.scope());
        if targets.is_empty() {
            self.stats.no_subscribers();
            log::trace!("No subscribers for {} ({})", event.scope(), event.event_type());
            return DispatchReport::settled(Outcome::Ack);
        }

        let event = Arc::new(event);
        let max_drops = self.config.max_consecutive_drops.max(1);
        let mut report = DispatchReport {
            matched: targets.len(),
            ..DispatchReport::settled(Outcome::Ack)
        };

        for session in &targets {
            match session.queue().try_push(Arc::clone(&event), self.config.overflow_policy) {
                PushOutcome::Queued => {
                    session.record_delivery();
                    report.enqueued += 1;
                }
                PushOutcome::Closed => {
                    log::trace!("{} queue already torn down; skipping", session.id());
                }
                dropped => {
                    if dropped == PushOutcome::DroppedOldest {
                        report.enqueued += 1;
                    }
                    report.dropped += 1;
                    self.stats.dropped(event.scope());

                    let streak = session.record_drop();
                    if streak == 1 {
                        log::warn!("{} in {} is degraded: outbound queue full", session.id(), session.scope());
                        self.stats.emit(OperationalSignal::Degraded {
                            connection_id: session.id(),
                            scope: session.scope().clone(),
                        });
                    }
                    if streak >= max_drops {
                        self.force_close(session, streak);
                        report.forced_closed += 1;
                    }
                }
            }
        }

        self.stats.enqueued(report.enqueued as u64);
        report
    }

    fn force_close(&self, session: &Arc<ConnectionHandle>, streak: u32) {
        session.request_close(CloseReason::Backpressure);
        self.registry.deregister(session.id());
        self.stats.force_closed();
        self.stats.emit(OperationalSignal::ForcedClose {
            connection_id: session.id(),
            scope: session.scope().clone(),
            consecutive_drops: streak,
        });
        log::warn!(
            "Force-closing {} in {} after {} consecutive drops",
            session.id(),
            session.scope(),
            streak
        );
    }

    /// Consumes `source` until it ends or `shutdown` fires.
    ///
    /// Each event is settled before the next one is pulled, so at most one
    /// delivery is ever in flight and nothing is left unsettled on exit.
    pub async fn run<S: EventSource>(&self, source: &mut S, shutdown: CancellationToken) -> Result<(), SourceError> {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => {
                log::info!("Shutdown requested before the event source started");
                self.close();
                return source.stop().await;
            }
            started = source.start() => started?,
        }
        log::info!("Dispatcher started");

        let result = loop {
            let next = tokio::select! {
                biased;
                _ = shutdown.cancelled() => None,
                next = source.next_event() => Some(next),
            };
            let Some(next) = next else {
                log::info!("Dispatcher received shutdown signal");
                break Ok(());
            };

            match next {
                Ok(Some(event)) => {
                    let tag = event.delivery_tag().clone();
                    let report = self.dispatch(event);
                    log::trace!("Dispatched {}: {:?}", tag, report);
                    if let Err(e) = source.settle(tag.clone(), report.outcome).await {
                        // Left unsettled upstream; the broker redelivers it.
                        log::warn!("Failed to settle {} as {:?}: {}", tag, report.outcome, e);
                    }
                }
                Ok(None) => {
                    log::info!("Event source ended");
                    break Ok(());
                }
                Err(e) => {
                    log::error!("Event source failed: {}", e);
                    break Err(e);
                }
            }
        };

        self.close();
        let stopped = source.stop().await;
        log::info!("Dispatcher stopped");
        result.and(stopped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::connection::ConnectionState;
    use crate::core::connection::tests::test_event;
    use crate::core::scope::Scope;

    fn scope(t: &str, w: &str) -> Scope {
        Scope::new(t, w).unwrap()
    }

    fn dispatcher(capacity: usize, max_drops: u32, policy: OverflowPolicy) -> Dispatcher {
        Dispatcher::new(
            Arc::new(Registry::new()),
            DispatcherConfig {
                queue_capacity: capacity,
                overflow_policy: policy,
                max_consecutive_drops: max_drops,
            },
        )
    }

    fn owned(event: Arc<Event>) -> Event {
        Arc::try_unwrap(event).unwrap()
    }

    fn register(d: &Dispatcher, s: &Scope) -> Arc<ConnectionHandle> {
        let handle = ConnectionHandle::new(s.clone(), d.config().queue_capacity);
        d.registry().register(Arc::clone(&handle)).unwrap();
        handle
    }

    #[test]
    fn routes_only_to_matching_scope() {
        let d = dispatcher(8, 4, OverflowPolicy::DropNewest);
        let a = register(&d, &scope("t1", "w1"));
        let b = register(&d, &scope("t1", "w1"));
        let other = register(&d, &scope("t1", "w2"));

        let report = d.dispatch(owned(test_event(&scope("t1", "w1"), 1)));
        assert_eq!(report.matched, 2);
        assert_eq!(report.enqueued, 2);
        assert_eq!(report.outcome, Outcome::Ack);
        assert_eq!(a.queue().len(), 1);
        assert_eq!(b.queue().len(), 1);
        assert!(other.queue().is_empty());
    }

    #[test]
    fn zero_subscribers_still_ack() {
        let d = dispatcher(8, 4, OverflowPolicy::DropNewest);
        let report = d.dispatch(owned(test_event(&scope("nobody", "home"), 1)));
        assert_eq!(report.outcome, Outcome::Ack);
        assert_eq!(report.matched, 0);
        assert_eq!(d.stats().snapshot().events_without_subscribers, 1);
    }

    #[test]
    fn closes_after_exactly_threshold_drops() {
        let (capacity, threshold) = (4, 3);
        let d = dispatcher(capacity, threshold, OverflowPolicy::DropNewest);
        let s = scope("t", "w");
        let slow = register(&d, &s);
        let mut signals = d.stats().subscribe();

        for seq in 0..capacity as u64 {
            assert_eq!(d.dispatch(owned(test_event(&s, seq))).enqueued, 1);
        }
        for drop_no in 1..threshold {
            let report = d.dispatch(owned(test_event(&s, 100 + drop_no as u64)));
            assert_eq!(report.dropped, 1);
            assert_eq!(report.forced_closed, 0);
            assert!(d.registry().contains(slow.id()));
            assert!(slow.is_degraded());
            assert!(slow.queue().len() <= capacity);
        }

        let report = d.dispatch(owned(test_event(&s, 999)));
        assert_eq!(report.forced_closed, 1);
        assert!(!d.registry().contains(slow.id()));
        assert_eq!(slow.close_reason(), Some(CloseReason::Backpressure));
        assert_eq!(slow.state(), ConnectionState::Draining);
        assert_eq!(slow.queue().len(), capacity);
        assert_eq!(d.stats().dropped_for(&s), threshold as u64);

        assert!(matches!(signals.try_recv().unwrap(), OperationalSignal::Degraded { .. }));
        assert!(matches!(
            signals.try_recv().unwrap(),
            OperationalSignal::ForcedClose { consecutive_drops, .. } if consecutive_drops == threshold
        ));

        // Further events for the scope no longer reach the closed session.
        assert_eq!(d.dispatch(owned(test_event(&s, 1000))).matched, 0);
    }

    #[test]
    fn successful_enqueue_resets_the_streak() {
        let d = dispatcher(1, 2, OverflowPolicy::DropNewest);
        let s = scope("t", "w");
        let session = register(&d, &s);

        d.dispatch(owned(test_event(&s, 1)));
        d.dispatch(owned(test_event(&s, 2)));
        assert_eq!(session.consecutive_drops(), 1);

        session.queue().try_pop();
        d.dispatch(owned(test_event(&s, 3)));
        assert_eq!(session.consecutive_drops(), 0);
        assert!(!session.is_degraded());

        d.dispatch(owned(test_event(&s, 4)));
        assert!(d.registry().contains(session.id()));
    }

    #[test]
    fn drop_oldest_keeps_newest_and_counts_drops() {
        let d = dispatcher(2, 10, OverflowPolicy::DropOldest);
        let s = scope("t", "w");
        let session = register(&d, &s);
        for seq in 1..=5 {
            d.dispatch(owned(test_event(&s, seq)));
        }
        assert_eq!(session.queue().len(), 2);
        assert_eq!(session.consecutive_drops(), 3);
        let snapshot = d.stats().snapshot();
        assert_eq!(snapshot.deliveries_dropped, 3);
        assert_eq!(snapshot.deliveries_enqueued, 5);
    }

    #[test]
    fn closed_dispatcher_requeues() {
        let d = dispatcher(8, 4, OverflowPolicy::DropNewest);
        let s = scope("t", "w");
        let session = register(&d, &s);
        d.close();
        let report = d.dispatch(owned(test_event(&s, 1)));
        assert_eq!(report.outcome, Outcome::Requeue);
        assert!(session.queue().is_empty());
    }
}

//! # In-Process Event Source
//!
//! A bounded tokio channel standing in for a broker. Publishers push
//! [`RawDelivery`] values through a [`ChannelPublisher`]; every settlement the
//! dispatcher makes is reported on an unbounded stream of [`Settlement`]s, so
//! callers can observe Ack / Nack / Requeue exactly as a broker would see them.

use std::collections::HashSet;

use serde_json::Value;
use tokio::sync::mpsc;

use crate::core::event::{DeliveryTag, Event, Outcome};
use crate::ingestors::{Admission, EventSource, RawDelivery, SourceError, TopicFilter, admit};

/// One delivery settled by the consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settlement {
    pub delivery_tag: DeliveryTag,
    pub outcome: Outcome,
}

#[derive(Debug, Clone)]
pub struct ChannelPublisher {
    tx: mpsc::Sender<RawDelivery>,
}

impl ChannelPublisher {
    /// Waits for room in the channel. Fails once the source is stopped.
    pub async fn publish(&self, delivery: RawDelivery) -> Result<(), SourceError> {
        self.tx.send(delivery).await.map_err(|_| SourceError::Stopped)
    }

    pub async fn publish_json(&self, routing_key: &str, body: &Value) -> Result<(), SourceError> {
        self.publish(RawDelivery::json(routing_key, body)).await
    }
}

pub struct ChannelSource {
    rx: mpsc::Receiver<RawDelivery>,
    bindings: TopicFilter,
    settlements: mpsc::UnboundedSender<Settlement>,
    in_flight: HashSet<DeliveryTag>,
    next_tag: u64,
    started: bool,
    stopped: bool,
}

/// Builds a source holding at most `capacity` unconsumed deliveries, its
/// publisher and the settlement stream.
pub fn channel_source(
    capacity: usize,
    bindings: TopicFilter,
) -> (ChannelSource, ChannelPublisher, mpsc::UnboundedReceiver<Settlement>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let (settlements, settled) = mpsc::unbounded_channel();
    let source = ChannelSource {
        rx,
        bindings,
        settlements,
        in_flight: HashSet::new(),
        next_tag: 0,
        started: false,
        stopped: false,
    };
    (source, ChannelPublisher { tx }, settled)
}

impl ChannelSource {
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    fn next_tag(&mut self) -> DeliveryTag {
        self.next_tag += 1;
        DeliveryTag::new(self.next_tag.to_string())
    }

    fn report(&self, delivery_tag: DeliveryTag, outcome: Outcome) {
        // Nobody watching settlements is fine.
        let _ = self.settlements.send(Settlement { delivery_tag, outcome });
    }
}

impl EventSource for ChannelSource {
    async fn start(&mut self) -> Result<(), SourceError> {
        if self.stopped {
            return Err(SourceError::Stopped);
        }
        self.started = true;
        log::debug!("Channel source started with bindings {:?}", self.bindings.patterns());
        Ok(())
    }

    async fn next_event(&mut self) -> Result<Option<Event>, SourceError> {
        if !self.started {
            return Err(SourceError::Stopped);
        }
        loop {
            if self.stopped {
                return Ok(None);
            }
            let Some(raw) = self.rx.recv().await else {
                return Ok(None);
            };
            let tag = self.next_tag();
            match admit(&self.bindings, raw, tag.clone()) {
                Admission::Accept(event) => {
                    self.in_flight.insert(tag);
                    return Ok(Some(event));
                }
                Admission::Unbound => self.report(tag, Outcome::Ack),
                Admission::Reject(_) => self.report(tag, Outcome::Nack),
            }
        }
    }

    async fn settle(&mut self, tag: DeliveryTag, outcome: Outcome) -> Result<(), SourceError> {
        if !self.in_flight.remove(&tag) {
            return Err(SourceError::UnknownTag(tag));
        }
        self.report(tag, outcome);
        Ok(())
    }

    async fn stop(&mut self) -> Result<(), SourceError> {
        if self.stopped {
            return Ok(());
        }
        self.stopped = true;
        self.rx.close();

        // Nothing unsettled may vanish: hand it back as a broker would.
        let unsettled: Vec<DeliveryTag> = self.in_flight.drain().collect();
        let mut returned = unsettled.len();
        for tag in unsettled {
            self.report(tag, Outcome::Requeue);
        }
        while self.rx.try_recv().is_ok() {
            let tag = self.next_tag();
            self.report(tag, Outcome::Requeue);
            returned += 1;
        }
        log::info!("Channel source stopped; {} deliveries returned unsettled", returned);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn body(t: &str, w: &str, seq: u64) -> Value {
        json!({"tenant_id": t, "workspace_id": w, "seq": seq})
    }

    #[tokio::test]
    async fn yields_bound_events_and_reports_settlements() {
        let (mut source, publisher, mut settled) = channel_source(16, TopicFilter::match_all());
        source.start().await.unwrap();

        publisher.publish_json("acme.workspace.created.v1", &body("t", "w", 1)).await.unwrap();
        let event = source.next_event().await.unwrap().unwrap();
        assert_eq!(event.scope().workspace_id(), "w");
        assert_eq!(source.in_flight(), 1);

        source.settle(event.delivery_tag().clone(), Outcome::Ack).await.unwrap();
        assert_eq!(
            settled.recv().await.unwrap(),
            Settlement {
                delivery_tag: event.delivery_tag().clone(),
                outcome: Outcome::Ack
            }
        );

        // Exactly once.
        assert!(matches!(
            source.settle(event.delivery_tag().clone(), Outcome::Ack).await,
            Err(SourceError::UnknownTag(_))
        ));
    }

    #[tokio::test]
    async fn decode_failures_are_nacked_and_unbound_keys_acked() {
        let (mut source, publisher, mut settled) = channel_source(16, TopicFilter::new(["*.workspace.*.v1"]));
        source.start().await.unwrap();

        publisher.publish(RawDelivery::new("acme.workspace.created.v1", "{oops")).await.unwrap();
        publisher.publish_json("acme.billing.charged.v1", &body("t", "w", 2)).await.unwrap();
        publisher.publish_json("acme.workspace.updated.v1", &body("t", "w", 3)).await.unwrap();

        let event = source.next_event().await.unwrap().unwrap();
        assert_eq!(event.routing_key(), "acme.workspace.updated.v1");

        let first = settled.recv().await.unwrap();
        let second = settled.recv().await.unwrap();
        assert_eq!((first.delivery_tag.as_str(), first.outcome), ("1", Outcome::Nack));
        assert_eq!((second.delivery_tag.as_str(), second.outcome), ("2", Outcome::Ack));
        assert_eq!(event.delivery_tag().as_str(), "3");
    }

    #[tokio::test]
    async fn stop_requeues_everything_unsettled() {
        let (mut source, publisher, mut settled) = channel_source(16, TopicFilter::match_all());
        source.start().await.unwrap();
        for seq in 0..3 {
            publisher.publish_json("k", &body("t", "w", seq)).await.unwrap();
        }
        let held = source.next_event().await.unwrap().unwrap();

        source.stop().await.unwrap();
        assert!(source.next_event().await.unwrap().is_none());
        assert!(publisher.publish_json("k", &body("t", "w", 9)).await.is_err());

        let mut outcomes = Vec::new();
        while let Ok(s) = settled.try_recv() {
            outcomes.push(s);
        }
        assert_eq!(outcomes.len(), 3);
        assert!(outcomes.iter().all(|s| s.outcome == Outcome::Requeue));
        assert_eq!(outcomes[0].delivery_tag, *held.delivery_tag());
    }

    #[tokio::test]
    async fn ends_when_every_publisher_is_gone() {
        let (mut source, publisher, _settled) = channel_source(4, TopicFilter::match_all());
        source.start().await.unwrap();
        drop(publisher);
        assert!(source.next_event().await.unwrap().is_none());
    }
}

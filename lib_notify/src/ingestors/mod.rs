//! # Event Sources
//!
//! Upstream adapters that feed the dispatcher. Each one turns broker
//! deliveries into decoded [`Event`]s and settles every delivery exactly once
//! with the [`Outcome`] the dispatcher reports back.
//!
//! ## Contained Modules:
//! - **`decode`**: delivery body to `Event`, including scope extraction.
//! - **`topic`**: AMQP-style binding patterns selecting which routing keys are
//!   consumed at all.
//! - **`channel`**: an in-process source fed through a tokio channel. Used by
//!   tests and by embedders that already hold the events.
//! - **`redis_streams`** (feature `redis`): a Redis Streams consumer-group
//!   source with reconnect backoff and a dead-letter stream.
//!
//! Deliveries that fail to decode are Nacked inside the source and never reach
//! the dispatcher. Deliveries whose routing key matches no binding are Acked
//! and skipped.

#![forbid(unsafe_code)]
#![warn(rust_2018_idioms, unused_qualifications)]

use std::future::Future;

use bytes::Bytes;
use serde_json::{Map, Value};
use thiserror::Error;

use crate::core::event::{DeliveryTag, Event, Outcome};

#[cfg(feature = "redis")]
pub mod backoff;
pub mod channel;
pub mod decode;
#[cfg(feature = "redis")]
pub mod redis_streams;
pub mod topic;

pub use channel::{ChannelPublisher, ChannelSource, Settlement, channel_source};
pub use decode::{DecodeError, decode_delivery};
pub use topic::{DEFAULT_BINDINGS, TopicFilter};

#[cfg(feature = "redis")]
pub use backoff::Backoff;
#[cfg(feature = "redis")]
pub use redis_streams::{RedisSourceConfig, RedisStreamSource};

#[derive(Debug, Error)]
pub enum SourceError {
    /// The broker could not be reached or dropped the connection.
    #[error("broker connection error: {0}")]
    Connection(String),

    /// The broker answered with something the source cannot use.
    #[error("broker protocol error: {0}")]
    Protocol(String),

    #[error("event source is stopped")]
    Stopped,

    #[error("unknown or already settled delivery tag {0}")]
    UnknownTag(DeliveryTag),
}

#[cfg(feature = "redis")]
impl From<redis::RedisError> for SourceError {
    fn from(e: redis::RedisError) -> Self {
        if e.is_io_error() || e.is_connection_dropped() || e.is_connection_refusal() || e.is_timeout() {
            SourceError::Connection(e.to_string())
        } else {
            SourceError::Protocol(e.to_string())
        }
    }
}

/// A delivery as the broker handed it over, before decoding.
#[derive(Debug, Clone, Default)]
pub struct RawDelivery {
    pub routing_key: String,
    pub content_type: Option<String>,
    pub headers: Map<String, Value>,
    pub body: Bytes,
}

impl RawDelivery {
    pub fn new(routing_key: impl Into<String>, body: impl Into<Bytes>) -> Self {
        Self {
            routing_key: routing_key.into(),
            body: body.into(),
            ..Self::default()
        }
    }

    /// Serializes `body` and wraps it with `routing_key`.
    pub fn json(routing_key: impl Into<String>, body: &Value) -> Self {
        Self::new(routing_key, body.to_string())
    }
}

/// Upstream the dispatcher consumes.
///
/// The stream is lazy and infinite: `next_event` waits for the next routable
/// event and only yields `Ok(None)` once the source has been stopped or its
/// feed is gone for good. Every event returned must be settled exactly once.
pub trait EventSource: Send {
    /// Connects and prepares the subscription.
    fn start(&mut self) -> impl Future<Output = Result<(), SourceError>> + Send;

    fn next_event(&mut self) -> impl Future<Output = Result<Option<Event>, SourceError>> + Send;

    /// Reports what happened to the event carrying `tag`.
    fn settle(&mut self, tag: DeliveryTag, outcome: Outcome) -> impl Future<Output = Result<(), SourceError>> + Send;

    /// Stops consuming. Deliveries received but not yet settled are left to
    /// the broker for redelivery.
    fn stop(&mut self) -> impl Future<Output = Result<(), SourceError>> + Send;
}

/// Verdict on one raw delivery, shared by every source.
#[derive(Debug)]
pub(crate) enum Admission {
    /// Decoded and bound: hand it to the dispatcher.
    Accept(Event),
    /// Routing key matches no binding: Ack without dispatching.
    Unbound,
    /// Can never be processed: Nack.
    Reject(DecodeError),
}

pub(crate) fn admit(bindings: &TopicFilter, raw: RawDelivery, tag: DeliveryTag) -> Admission {
    if !bindings.matches(&raw.routing_key) {
        log::trace!("Skipping {} ({}): no matching binding", tag, raw.routing_key);
        return Admission::Unbound;
    }
    match decode_delivery(raw, tag.clone()) {
        Ok(event) => Admission::Accept(event),
        Err(e) => {
            log::warn!("Rejecting delivery {}: {}", tag, e);
            Admission::Reject(e)
        }
    }
}

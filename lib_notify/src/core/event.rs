//! # Inbound Event
//!
//! An `Event` is created once by an event source when a delivery decodes
//! successfully and is never mutated afterwards. The outbound WebSocket frame
//! is rendered at construction and shared behind an `Arc`, so fanning one
//! event out to thousands of sessions costs one pointer clone per session.

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use crate::core::scope::Scope;

/// Opaque broker handle used to settle one delivery.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeliveryTag(String);

impl DeliveryTag {
    pub fn new(tag: impl Into<String>) -> Self {
        Self(tag.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeliveryTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Settlement reported back to the event source for a delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    /// Fanout was attempted; the broker may forget the message.
    Ack,
    /// The message can never be processed; dead-letter or drop it.
    Nack,
    /// The message was not processed; the broker should deliver it again.
    Requeue,
}

/// Everything an event source knows about a delivery once it decoded.
#[derive(Debug, Clone)]
pub struct EventParts {
    pub scope: Scope,
    pub event_type: String,
    pub routing_key: String,
    pub payload: Bytes,
    pub headers: Map<String, Value>,
    pub content_type: String,
    pub delivery_tag: DeliveryTag,
    pub received_at: DateTime<Utc>,
}

/// A decoded, routable event.
#[derive(Debug, Clone)]
pub struct Event {
    scope: Scope,
    event_type: String,
    routing_key: String,
    payload: Bytes,
    content_type: String,
    delivery_tag: DeliveryTag,
    received_at: DateTime<Utc>,
    frame: Arc<str>,
}

impl Event {
    /// Builds the event and renders its outbound frame.
    ///
    /// `data` is the parsed form of `parts.payload`; the source already had to
    /// parse the body to find the scope, so it is passed in rather than parsed
    /// twice.
    pub fn new(parts: EventParts, data: Value) -> Self {
        let frame = json!({
            "meta": {
                "routing_key": parts.routing_key,
                "type": parts.event_type,
                "tenant_id": parts.scope.tenant_id(),
                "workspace_id": parts.scope.workspace_id(),
                "timestamp": parts.received_at.to_rfc3339_opts(SecondsFormat::Millis, true),
                "headers": Value::Object(parts.headers),
                "content_type": parts.content_type,
            },
            "data": data,
        })
        .to_string();

        Self {
            scope: parts.scope,
            event_type: parts.event_type,
            routing_key: parts.routing_key,
            payload: parts.payload,
            content_type: parts.content_type,
            delivery_tag: parts.delivery_tag,
            received_at: parts.received_at,
            frame: Arc::from(frame),
        }
    }

    pub fn scope(&self) -> &Scope {
        &self.scope
    }

    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    pub fn routing_key(&self) -> &str {
        &self.routing_key
    }

    /// Raw body exactly as the broker delivered it.
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn content_type(&self) -> &str {
        &self.content_type
    }

    pub fn delivery_tag(&self) -> &DeliveryTag {
        &self.delivery_tag
    }

    pub fn received_at(&self) -> DateTime<Utc> {
        self.received_at
    }

    /// The enriched JSON envelope written to every subscribed session.
    pub fn frame(&self) -> &str {
        &self.frame
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parts(data: &Value) -> EventParts {
        EventParts {
            scope: Scope::new("acme", "ws-9").unwrap(),
            event_type: "workspace.created".to_string(),
            routing_key: "acme.workspace.created.v1".to_string(),
            payload: Bytes::from(data.to_string()),
            headers: Map::new(),
            content_type: "application/json".to_string(),
            delivery_tag: DeliveryTag::new("1-0"),
            received_at: Utc::now(),
        }
    }

    #[test]
    fn frame_wraps_payload_with_meta() {
        let data = json!({"type": "workspace.created", "data": {"name": "docs"}});
        let event = Event::new(parts(&data), data.clone());

        let frame: Value = serde_json::from_str(event.frame()).unwrap();
        assert_eq!(frame["data"], data);
        assert_eq!(frame["meta"]["routing_key"], "acme.workspace.created.v1");
        assert_eq!(frame["meta"]["tenant_id"], "acme");
        assert_eq!(frame["meta"]["workspace_id"], "ws-9");
        assert_eq!(frame["meta"]["type"], "workspace.created");
        assert!(frame["meta"]["timestamp"].as_str().unwrap().ends_with('Z'));
    }

    #[test]
    fn clones_share_the_rendered_frame() {
        let data = json!({"n": 1});
        let event = Event::new(parts(&data), data);
        let copy = event.clone();
        assert!(std::ptr::eq(event.frame(), copy.frame()));
    }
}

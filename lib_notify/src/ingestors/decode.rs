//! # Delivery Decoding
//!
//! Turns a raw broker delivery into an [`Event`]. The body must be a JSON
//! object. The scope is looked up in the body itself, then in its `data`
//! object, then in its `meta` object. When none carry it, the tenant falls
//! back to the first routing-key segment (`<org>.<service>.<event>.<version>`)
//! and the workspace to a CloudEvents `subject` of the form `workspace:<id>`.

use chrono::Utc;
use serde_json::Value;
use thiserror::Error;

use crate::core::event::{DeliveryTag, Event, EventParts};
use crate::core::scope::{Scope, ScopeError};
use crate::ingestors::RawDelivery;

const DEFAULT_CONTENT_TYPE: &str = "application/json";
const WORKSPACE_SUBJECT_PREFIX: &str = "workspace:";

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("malformed payload: {0}")]
    MalformedPayload(String),

    #[error("no {0} in payload or routing key")]
    MissingScope(&'static str),

    #[error("invalid scope: {0}")]
    InvalidScope(#[from] ScopeError),
}

pub fn decode_delivery(raw: RawDelivery, tag: DeliveryTag) -> Result<Event, DecodeError> {
    let text = std::str::from_utf8(&raw.body).map_err(|e| DecodeError::MalformedPayload(e.to_string()))?;
    let body: Value = serde_json::from_str(text).map_err(|e| DecodeError::MalformedPayload(e.to_string()))?;
    if !body.is_object() {
        return Err(DecodeError::MalformedPayload("body is not a JSON object".to_string()));
    }

    let tenant_id = scoped_field(&body, "tenant_id")
        .or_else(|| tenant_from_routing_key(&raw.routing_key))
        .ok_or(DecodeError::MissingScope("tenant_id"))?;
    let workspace_id = scoped_field(&body, "workspace_id")
        .or_else(|| workspace_from_subject(&body))
        .ok_or(DecodeError::MissingScope("workspace_id"))?;
    let scope = Scope::new(tenant_id, workspace_id)?;

    let event_type = body
        .get("type")
        .and_then(Value::as_str)
        .filter(|t| !t.is_empty())
        .unwrap_or(&raw.routing_key)
        .to_string();

    let parts = EventParts {
        scope,
        event_type,
        routing_key: raw.routing_key,
        payload: raw.body,
        headers: raw.headers,
        content_type: raw.content_type.unwrap_or_else(|| DEFAULT_CONTENT_TYPE.to_string()),
        delivery_tag: tag,
        received_at: Utc::now(),
    };
    Ok(Event::new(parts, body))
}

/// First non-blank value of `key` at the top level, under `data`, then under
/// `meta`. Numeric ids are accepted and stringified.
fn scoped_field(body: &Value, key: &str) -> Option<String> {
    [Some(body), body.get("data"), body.get("meta")]
        .into_iter()
        .flatten()
        .filter_map(|level| level.get(key))
        .find_map(id_string)
}

fn id_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn tenant_from_routing_key(routing_key: &str) -> Option<String> {
    routing_key
        .split('.')
        .next()
        .filter(|org| !org.trim().is_empty())
        .map(str::to_string)
}

fn workspace_from_subject(body: &Value) -> Option<String> {
    body.get("subject")
        .and_then(Value::as_str)
        .and_then(|s| s.strip_prefix(WORKSPACE_SUBJECT_PREFIX))
        .filter(|id| !id.trim().is_empty())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn decode(routing_key: &str, body: Value) -> Result<Event, DecodeError> {
        decode_delivery(RawDelivery::json(routing_key, &body), DeliveryTag::new("1"))
    }

    #[test]
    fn top_level_scope_wins() {
        let event = decode(
            "raina.workspace.created.v1",
            json!({"tenant_id": "t1", "workspace_id": "w1", "data": {"tenant_id": "other", "workspace_id": "other"}}),
        )
        .unwrap();
        assert_eq!(event.scope(), &Scope::new("t1", "w1").unwrap());
        assert_eq!(event.event_type(), "raina.workspace.created.v1");
    }

    #[test]
    fn falls_back_to_data_then_meta() {
        let event = decode(
            "raina.artifact.saved.v1",
            json!({"type": "artifact.saved", "data": {"workspace_id": "w9"}, "meta": {"tenant_id": "t9"}}),
        )
        .unwrap();
        assert_eq!(event.scope().tenant_id(), "t9");
        assert_eq!(event.scope().workspace_id(), "w9");
        assert_eq!(event.event_type(), "artifact.saved");
    }

    #[test]
    fn routing_key_and_subject_fallbacks() {
        let event = decode(
            "acme.conductor.step.v1",
            json!({"subject": "workspace:ws-42", "data": {"step": 3}}),
        )
        .unwrap();
        assert_eq!(event.scope(), &Scope::new("acme", "ws-42").unwrap());
    }

    #[test]
    fn numeric_ids_are_accepted() {
        let event = decode("k", json!({"tenant_id": 7, "workspace_id": 12})).unwrap();
        assert_eq!(event.scope(), &Scope::new("7", "12").unwrap());
    }

    #[test]
    fn missing_workspace_is_rejected() {
        let err = decode("acme.workspace.created.v1", json!({"tenant_id": "t"})).unwrap_err();
        assert!(matches!(err, DecodeError::MissingScope("workspace_id")));

        let err = decode("acme.x.y.v1", json!({"subject": "artifact:1"})).unwrap_err();
        assert!(matches!(err, DecodeError::MissingScope("workspace_id")));
    }

    #[test]
    fn missing_tenant_without_routing_key_is_rejected() {
        let err = decode("", json!({"workspace_id": "w"})).unwrap_err();
        assert!(matches!(err, DecodeError::MissingScope("tenant_id")));
    }

    #[test]
    fn blank_ids_fall_through() {
        let event = decode(
            "org.workspace.created.v1",
            json!({"tenant_id": "  ", "workspace_id": "w", "data": {"tenant_id": "t2"}}),
        )
        .unwrap();
        assert_eq!(event.scope().tenant_id(), "t2");
    }

    #[test]
    fn non_object_and_invalid_bodies_are_malformed() {
        let bodies: [&[u8]; 4] = [b"not json", b"[1,2,3]", b"\"string\"", &[0xff, 0xfe, 0x00]];
        for body in bodies {
            let raw = RawDelivery::new("k", body.to_vec());
            assert!(matches!(
                decode_delivery(raw, DeliveryTag::new("1")),
                Err(DecodeError::MalformedPayload(_))
            ));
        }
    }

    #[test]
    fn frame_carries_meta_and_data() {
        let mut raw = RawDelivery::json(
            "acme.notification.sent.v1",
            &json!({"type": "notification.sent", "tenant_id": "t", "workspace_id": "w", "text": "hi"}),
        );
        raw.content_type = Some("application/cloudevents+json".to_string());
        raw.headers.insert("x-trace".to_string(), json!("abc"));
        let event = decode_delivery(raw, DeliveryTag::new("9")).unwrap();

        let frame: Value = serde_json::from_str(event.frame()).unwrap();
        assert_eq!(frame["meta"]["routing_key"], "acme.notification.sent.v1");
        assert_eq!(frame["meta"]["type"], "notification.sent");
        assert_eq!(frame["meta"]["tenant_id"], "t");
        assert_eq!(frame["meta"]["workspace_id"], "w");
        assert_eq!(frame["meta"]["content_type"], "application/cloudevents+json");
        assert_eq!(frame["meta"]["headers"]["x-trace"], "abc");
        assert_eq!(frame["data"]["text"], "hi");
        assert_eq!(event.delivery_tag().as_str(), "9");
    }
}

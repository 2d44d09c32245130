//! # Redis Streams Event Source
//!
//! Consumes one stream through a consumer group. Each stream entry is one
//! delivery carrying the fields `routing_key`, `body`, and optionally
//! `content_type` and `headers` (a JSON object). The entry id is the delivery
//! tag.
//!
//! ## Delivery semantics:
//! - On start the source first replays this consumer's own pending entries
//!   (read id `0`, then the last id replayed), so anything left
//!   unacknowledged by a previous run is delivered again once, then switches
//!   to new entries (read id `>`).
//! - Ack is `XACK`. Nack copies the entry to the dead-letter stream and acks
//!   it in one `MULTI`. Requeue appends a copy to the source stream and acks
//!   the original the same way.
//! - Connectivity failures are retried forever with jittered linear backoff
//!   until the source is stopped.
//! - Stop leaves prefetched and unsettled entries pending in the group.

use std::collections::{HashMap, VecDeque};

use redis::aio::ConnectionManager;
use redis::streams::{StreamId, StreamReadReply};
use redis::{Client, Cmd, Pipeline, Value as RedisValue};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::core::event::{DeliveryTag, Event, Outcome};
use crate::ingestors::backoff::Backoff;
use crate::ingestors::topic::DEFAULT_BINDINGS;
use crate::ingestors::{Admission, EventSource, RawDelivery, SourceError, TopicFilter, admit};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RedisSourceConfig {
    pub url: String,
    pub stream_key: String,
    pub group: String,
    /// Must be stable across restarts for pending entries to be replayed.
    pub consumer: String,
    /// Where rejected entries go. `None` drops them after acking.
    pub dead_letter_stream: Option<String>,
    pub bindings: Vec<String>,
    /// Entries fetched per `XREADGROUP`.
    pub prefetch: usize,
    /// Server-side wait for new entries. Kept well below the client response
    /// timeout.
    pub block_ms: u64,
    pub backoff: Backoff,
}

impl Default for RedisSourceConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379/".to_string(),
            stream_key: "raina.events".to_string(),
            group: "notification-service.v1".to_string(),
            consumer: default_consumer_name(),
            dead_letter_stream: Some("raina.events.dead".to_string()),
            bindings: DEFAULT_BINDINGS.iter().map(|b| b.to_string()).collect(),
            prefetch: 64,
            block_ms: 250,
            backoff: Backoff::default(),
        }
    }
}

/// `notify-<hostname>`, or `notify-gateway` when the hostname is unavailable.
pub fn default_consumer_name() -> String {
    let host = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "gateway".to_string());
    format!("notify-{}", host)
}

pub struct RedisStreamSource {
    config: RedisSourceConfig,
    bindings: TopicFilter,
    conn: Option<ConnectionManager>,
    buffer: VecDeque<StreamId>,
    in_flight: HashMap<DeliveryTag, RawDelivery>,
    /// Last pending id handed out while replaying; `None` once reading new
    /// entries.
    replay_cursor: Option<String>,
    failures: u32,
    stopped: bool,
}

impl RedisStreamSource {
    pub fn new(config: RedisSourceConfig) -> Self {
        let bindings = TopicFilter::new(config.bindings.iter().cloned());
        Self {
            config,
            bindings,
            conn: None,
            buffer: VecDeque::new(),
            in_flight: HashMap::new(),
            replay_cursor: Some("0".to_string()),
            failures: 0,
            stopped: false,
        }
    }

    pub fn config(&self) -> &RedisSourceConfig {
        &self.config
    }

    fn connection(&self) -> Result<ConnectionManager, SourceError> {
        self.conn.clone().ok_or(SourceError::Stopped)
    }

    async fn open(&self, client: &Client) -> Result<ConnectionManager, SourceError> {
        let mut conn = client.get_connection_manager().await?;
        ensure_group(&mut conn, &self.config.stream_key, &self.config.group).await?;
        Ok(conn)
    }

    async fn wait_before_retry(&mut self, error: &SourceError) {
        let delay = self.config.backoff.delay(self.failures);
        self.failures = self.failures.saturating_add(1);
        log::warn!(
            "Redis stream {} unavailable ({}); retry #{} in {:?}",
            self.config.stream_key,
            error,
            self.failures,
            delay
        );
        tokio::time::sleep(delay).await;
    }

    async fn read_batch(&mut self) -> Result<usize, SourceError> {
        let mut conn = self.connection()?;
        let reply: Option<StreamReadReply> = read_group_cmd(&self.config, self.replay_cursor.as_deref())
            .query_async(&mut conn)
            .await?;
        let entries: Vec<StreamId> = reply
            .map(|r| r.keys.into_iter().flat_map(|k| k.ids).collect())
            .unwrap_or_default();
        Ok(self.absorb_batch(entries))
    }

    /// Buffers a batch. While replaying, the cursor moves past the batch so a
    /// pending entry that cannot be settled is not read back at once; an empty
    /// replay batch switches to new entries.
    fn absorb_batch(&mut self, entries: Vec<StreamId>) -> usize {
        if self.replay_cursor.is_some() {
            match entries.last() {
                Some(last) => self.replay_cursor = Some(last.id.clone()),
                None => {
                    log::info!("Pending entries of {} replayed; reading new entries", self.config.consumer);
                    self.replay_cursor = None;
                }
            }
        }
        let count = entries.len();
        self.buffer.extend(entries);
        count
    }

    /// Decodes one entry. Entries that are not dispatched are settled here.
    async fn admit_entry(&mut self, entry: StreamId) -> Option<Event> {
        let tag = DeliveryTag::new(entry.id.clone());
        let raw = match raw_delivery(&entry) {
            Ok(raw) => raw,
            Err(reason) => {
                log::warn!("Rejecting stream entry {}: {}", tag, reason);
                self.settle_internal(&tag, None, Outcome::Nack, &reason).await;
                return None;
            }
        };

        match admit(&self.bindings, raw.clone(), tag.clone()) {
            Admission::Accept(event) => {
                self.in_flight.insert(tag, raw);
                Some(event)
            }
            Admission::Unbound => {
                self.settle_internal(&tag, Some(&raw), Outcome::Ack, "").await;
                None
            }
            Admission::Reject(e) => {
                self.settle_internal(&tag, Some(&raw), Outcome::Nack, &e.to_string()).await;
                None
            }
        }
    }

    async fn settle_internal(&mut self, tag: &DeliveryTag, raw: Option<&RawDelivery>, outcome: Outcome, reason: &str) {
        let result = match outcome {
            Outcome::Nack => self.dead_letter(tag, raw, reason).await,
            _ => self.ack(tag).await,
        };
        if let Err(e) = result {
            // Still pending in the group; replayed on the next start.
            log::warn!("Failed to settle stream entry {} as {:?}: {}", tag, outcome, e);
        }
    }

    async fn ack(&self, tag: &DeliveryTag) -> Result<(), SourceError> {
        let mut conn = self.connection()?;
        ack_cmd(&self.config, tag).query_async::<()>(&mut conn).await?;
        Ok(())
    }

    async fn dead_letter(&self, tag: &DeliveryTag, raw: Option<&RawDelivery>, reason: &str) -> Result<(), SourceError> {
        let mut conn = self.connection()?;
        dead_letter_pipe(&self.config, tag, raw, reason)
            .query_async::<()>(&mut conn)
            .await?;
        log::debug!("Dead-lettered stream entry {}", tag);
        Ok(())
    }

    async fn requeue(&self, tag: &DeliveryTag, raw: &RawDelivery) -> Result<(), SourceError> {
        let mut conn = self.connection()?;
        requeue_pipe(&self.config, tag, raw).query_async::<()>(&mut conn).await?;
        log::debug!("Requeued stream entry {}", tag);
        Ok(())
    }
}

/// `XREADGROUP` for the next batch: this consumer's pending entries after
/// `replay_cursor` without blocking, or new entries (`>`) with `BLOCK`.
fn read_group_cmd(config: &RedisSourceConfig, replay_cursor: Option<&str>) -> Cmd {
    let mut cmd = redis::cmd("XREADGROUP");
    cmd.arg("GROUP")
        .arg(&config.group)
        .arg(&config.consumer)
        .arg("COUNT")
        .arg(config.prefetch.max(1));
    if replay_cursor.is_none() {
        cmd.arg("BLOCK").arg(config.block_ms);
    }
    cmd.arg("STREAMS")
        .arg(&config.stream_key)
        .arg(replay_cursor.unwrap_or(">"));
    cmd
}

fn ack_cmd(config: &RedisSourceConfig, tag: &DeliveryTag) -> Cmd {
    let mut cmd = redis::cmd("XACK");
    cmd.arg(&config.stream_key).arg(&config.group).arg(tag.as_str());
    cmd
}

/// Copies the entry to the dead-letter stream, when one is configured, and
/// acks it in one `MULTI`.
fn dead_letter_pipe(
    config: &RedisSourceConfig,
    tag: &DeliveryTag,
    raw: Option<&RawDelivery>,
    reason: &str,
) -> Pipeline {
    let mut pipe = redis::pipe();
    pipe.atomic();
    if let Some(stream) = &config.dead_letter_stream {
        let mut add = redis::cmd("XADD");
        add.arg(stream).arg("*").arg("source_id").arg(tag.as_str()).arg("error").arg(reason);
        if let Some(raw) = raw {
            for (field, value) in entry_fields(raw) {
                add.arg(field).arg(value);
            }
        }
        pipe.add_command(add).ignore();
    }
    pipe.add_command(ack_cmd(config, tag)).ignore();
    pipe
}

/// Appends a copy of the entry to the source stream and acks the original in
/// one `MULTI`.
fn requeue_pipe(config: &RedisSourceConfig, tag: &DeliveryTag, raw: &RawDelivery) -> Pipeline {
    let mut add = redis::cmd("XADD");
    add.arg(&config.stream_key).arg("*");
    for (field, value) in entry_fields(raw) {
        add.arg(field).arg(value);
    }
    let mut pipe = redis::pipe();
    pipe.atomic().add_command(add).ignore().add_command(ack_cmd(config, tag)).ignore();
    pipe
}

impl EventSource for RedisStreamSource {
    async fn start(&mut self) -> Result<(), SourceError> {
        let client = Client::open(self.config.url.as_str())?;
        self.stopped = false;
        self.replay_cursor = Some("0".to_string());

        loop {
            match self.open(&client).await {
                Ok(conn) => {
                    self.conn = Some(conn);
                    self.failures = 0;
                    break;
                }
                Err(e) => self.wait_before_retry(&e).await,
            }
        }
        log::info!(
            "Consuming {} as {}/{} with bindings {:?}",
            self.config.stream_key,
            self.config.group,
            self.config.consumer,
            self.bindings.patterns()
        );
        Ok(())
    }

    async fn next_event(&mut self) -> Result<Option<Event>, SourceError> {
        loop {
            if self.stopped {
                return Ok(None);
            }
            if let Some(entry) = self.buffer.pop_front() {
                match self.admit_entry(entry).await {
                    Some(event) => return Ok(Some(event)),
                    None => continue,
                }
            }

            match self.read_batch().await {
                Ok(_) => self.failures = 0,
                Err(SourceError::Stopped) => return Err(SourceError::Stopped),
                Err(e) => {
                    if matches!(e, SourceError::Protocol(_)) && self.replay_cursor.is_some() {
                        log::warn!("Skipping pending replay after protocol error: {}", e);
                        self.replay_cursor = None;
                    }
                    self.wait_before_retry(&e).await;
                    // A deleted stream or group comes back here.
                    if let Ok(mut conn) = self.connection() {
                        if let Err(e) = ensure_group(&mut conn, &self.config.stream_key, &self.config.group).await {
                            log::debug!("Consumer group check failed: {}", e);
                        }
                    }
                }
            }
        }
    }

    async fn settle(&mut self, tag: DeliveryTag, outcome: Outcome) -> Result<(), SourceError> {
        let raw = self
            .in_flight
            .remove(&tag)
            .ok_or_else(|| SourceError::UnknownTag(tag.clone()))?;
        match outcome {
            Outcome::Ack => self.ack(&tag).await,
            Outcome::Nack => self.dead_letter(&tag, Some(&raw), "rejected by dispatcher").await,
            Outcome::Requeue => self.requeue(&tag, &raw).await,
        }
    }

    async fn stop(&mut self) -> Result<(), SourceError> {
        if self.stopped {
            return Ok(());
        }
        self.stopped = true;
        let left_pending = self.buffer.len() + self.in_flight.len();
        self.buffer.clear();
        self.in_flight.clear();
        self.conn = None;
        log::info!(
            "Stopped consuming {}; {} entries left pending for redelivery",
            self.config.stream_key,
            left_pending
        );
        Ok(())
    }
}

async fn ensure_group(conn: &mut ConnectionManager, stream_key: &str, group: &str) -> Result<(), SourceError> {
    let created = redis::cmd("XGROUP")
        .arg("CREATE")
        .arg(stream_key)
        .arg(group)
        .arg("$")
        .arg("MKSTREAM")
        .query_async::<()>(conn)
        .await;
    match created {
        Ok(()) => {
            log::info!("Created consumer group {} on {}", group, stream_key);
            Ok(())
        }
        Err(e) if e.to_string().contains("BUSYGROUP") => Ok(()),
        Err(e) => Err(e.into()),
    }
}

fn raw_delivery(entry: &StreamId) -> Result<RawDelivery, String> {
    let routing_key = field_string(&entry.map, "routing_key").ok_or("missing routing_key field")?;
    let body = field_bytes(&entry.map, "body").ok_or("missing body field")?;
    let headers = match field_string(&entry.map, "headers") {
        None => Map::new(),
        Some(text) => serde_json::from_str::<Map<String, Value>>(&text)
            .map_err(|e| format!("headers field is not a JSON object: {}", e))?,
    };
    Ok(RawDelivery {
        routing_key,
        content_type: field_string(&entry.map, "content_type"),
        headers,
        body: body.into(),
    })
}

/// Stream fields that reproduce `raw` when read back.
fn entry_fields(raw: &RawDelivery) -> Vec<(&'static str, Vec<u8>)> {
    let mut fields = vec![
        ("routing_key", raw.routing_key.clone().into_bytes()),
        ("body", raw.body.to_vec()),
    ];
    if let Some(content_type) = &raw.content_type {
        fields.push(("content_type", content_type.clone().into_bytes()));
    }
    if !raw.headers.is_empty() {
        fields.push(("headers", Value::Object(raw.headers.clone()).to_string().into_bytes()));
    }
    fields
}

fn field_bytes(map: &HashMap<String, RedisValue>, key: &str) -> Option<Vec<u8>> {
    match map.get(key)? {
        RedisValue::BulkString(bytes) => Some(bytes.clone()),
        RedisValue::SimpleString(text) => Some(text.clone().into_bytes()),
        _ => None,
    }
}

fn field_string(map: &HashMap<String, RedisValue>, key: &str) -> Option<String> {
    field_bytes(map, key).and_then(|bytes| String::from_utf8(bytes).ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn entry(fields: &[(&str, &[u8])]) -> StreamId {
        StreamId {
            id: "1700000000000-0".to_string(),
            map: fields
                .iter()
                .map(|(k, v)| (k.to_string(), RedisValue::BulkString(v.to_vec())))
                .collect(),
            milliseconds_elapsed_from_delivery: None,
            delivered_count: None,
        }
    }

    #[test]
    fn parses_all_fields() {
        let raw = raw_delivery(&entry(&[
            ("routing_key", b"acme.workspace.created.v1"),
            ("body", br#"{"tenant_id":"t","workspace_id":"w"}"#),
            ("content_type", b"application/json"),
            ("headers", br#"{"x-trace":"abc"}"#),
        ]))
        .unwrap();
        assert_eq!(raw.routing_key, "acme.workspace.created.v1");
        assert_eq!(raw.content_type.as_deref(), Some("application/json"));
        assert_eq!(raw.headers.get("x-trace"), Some(&json!("abc")));
        assert_eq!(&raw.body[..], br#"{"tenant_id":"t","workspace_id":"w"}"#);
    }

    #[test]
    fn optional_fields_may_be_absent() {
        let raw = raw_delivery(&entry(&[("routing_key", b"k"), ("body", b"{}")])).unwrap();
        assert!(raw.content_type.is_none());
        assert!(raw.headers.is_empty());
    }

    #[test]
    fn missing_or_bad_fields_are_rejected() {
        assert!(raw_delivery(&entry(&[("body", b"{}")])).is_err());
        assert!(raw_delivery(&entry(&[("routing_key", b"k")])).is_err());
        assert!(raw_delivery(&entry(&[("routing_key", b"k"), ("body", b"{}"), ("headers", b"[1]")])).is_err());
    }

    #[test]
    fn entry_fields_read_back_identically() {
        let mut raw = RawDelivery::json("acme.audit.recorded.v1", &json!({"a": 1}));
        raw.content_type = Some("application/json".to_string());
        raw.headers.insert("h".to_string(), json!(1));

        let fields: Vec<(&str, Vec<u8>)> = entry_fields(&raw);
        let as_entry = StreamId {
            id: "1-0".to_string(),
            map: fields
                .into_iter()
                .map(|(k, v)| (k.to_string(), RedisValue::BulkString(v)))
                .collect(),
            milliseconds_elapsed_from_delivery: None,
            delivered_count: None,
        };
        let back = raw_delivery(&as_entry).unwrap();
        assert_eq!(back.routing_key, raw.routing_key);
        assert_eq!(back.body, raw.body);
        assert_eq!(back.content_type, raw.content_type);
        assert_eq!(back.headers, raw.headers);
    }

    #[test]
    fn defaults_bind_service_keys_and_name_the_consumer() {
        let config = RedisSourceConfig::default();
        assert_eq!(config.block_ms, 250);
        assert_eq!(config.prefetch, 64);
        assert!(config.consumer.starts_with("notify-"));

        let source = RedisStreamSource::new(config);
        assert!(source.bindings.matches("raina.workspace.created.v1"));
        assert!(!source.bindings.matches("raina.billing.charged.v1"));
    }

    #[test]
    fn config_reads_camel_case_json() {
        let config: RedisSourceConfig = serde_json::from_value(json!({
            "url": "redis://cache:6379/2",
            "streamKey": "events",
            "deadLetterStream": null,
            "backoff": {"baseMs": 10, "stepMs": 10, "maxMs": 100, "jitterMs": 0}
        }))
        .unwrap();
        assert_eq!(config.stream_key, "events");
        assert_eq!(config.dead_letter_stream, None);
        assert_eq!(config.group, "notification-service.v1");
        assert_eq!(config.backoff.max_ms, 100);
    }

    #[tokio::test]
    async fn unknown_tags_cannot_be_settled() {
        let mut source = RedisStreamSource::new(RedisSourceConfig::default());
        let err = source.settle(DeliveryTag::new("1-0"), Outcome::Ack).await.unwrap_err();
        assert!(matches!(err, SourceError::UnknownTag(_)));
    }

    #[tokio::test]
    async fn stop_is_idempotent_and_ends_the_stream() {
        let mut source = RedisStreamSource::new(RedisSourceConfig::default());
        source.stop().await.unwrap();
        source.stop().await.unwrap();
        assert!(source.next_event().await.unwrap().is_none());
    }

    /// Bulk strings of a packed RESP command or pipeline, in order.
    fn words(packed: &[u8]) -> Vec<String> {
        let text = String::from_utf8(packed.to_vec()).unwrap();
        let mut lines = text.split("\r\n");
        let mut words = Vec::new();
        while let Some(line) = lines.next() {
            if line.starts_with('$') {
                words.push(lines.next().unwrap().to_string());
            }
        }
        words
    }

    fn stream_ids(ids: &[&str]) -> Vec<StreamId> {
        ids.iter()
            .map(|id| StreamId {
                id: id.to_string(),
                map: HashMap::new(),
                milliseconds_elapsed_from_delivery: None,
                delivered_count: None,
            })
            .collect()
    }

    fn config() -> RedisSourceConfig {
        RedisSourceConfig {
            consumer: "notify-a".to_string(),
            ..RedisSourceConfig::default()
        }
    }

    #[test]
    fn pending_reads_do_not_block_and_new_reads_do() {
        let config = config();
        assert_eq!(
            words(&read_group_cmd(&config, Some("0")).get_packed_command()),
            [
                "XREADGROUP",
                "GROUP",
                "notification-service.v1",
                "notify-a",
                "COUNT",
                "64",
                "STREAMS",
                "raina.events",
                "0"
            ]
        );
        assert_eq!(
            words(&read_group_cmd(&config, None).get_packed_command()),
            [
                "XREADGROUP",
                "GROUP",
                "notification-service.v1",
                "notify-a",
                "COUNT",
                "64",
                "BLOCK",
                "250",
                "STREAMS",
                "raina.events",
                ">"
            ]
        );
    }

    #[test]
    fn replay_advances_past_each_batch_then_switches_to_new_entries() {
        let mut source = RedisStreamSource::new(config());
        assert_eq!(source.replay_cursor.as_deref(), Some("0"));

        assert_eq!(source.absorb_batch(stream_ids(&["5-0", "7-1"])), 2);
        assert_eq!(source.replay_cursor.as_deref(), Some("7-1"));
        let next = words(&read_group_cmd(&source.config, source.replay_cursor.as_deref()).get_packed_command());
        assert_eq!(next.last().map(String::as_str), Some("7-1"));
        assert!(!next.contains(&"BLOCK".to_string()));

        assert_eq!(source.absorb_batch(Vec::new()), 0);
        assert!(source.replay_cursor.is_none());
        assert_eq!(source.buffer.len(), 2);

        // Reading new entries never moves back into replay.
        source.absorb_batch(stream_ids(&["9-0"]));
        assert!(source.replay_cursor.is_none());
        assert_eq!(source.buffer.len(), 3);
    }

    #[test]
    fn nack_dead_letters_and_acks_atomically() {
        let mut raw = RawDelivery::json("acme.audit.recorded.v1", &json!({"a": 1}));
        raw.content_type = Some("application/json".to_string());
        let tag = DeliveryTag::new("3-0");

        let packed = words(&dead_letter_pipe(&config(), &tag, Some(&raw), "bad scope").get_packed_pipeline());
        assert_eq!(
            packed,
            [
                "MULTI",
                "XADD",
                "raina.events.dead",
                "*",
                "source_id",
                "3-0",
                "error",
                "bad scope",
                "routing_key",
                "acme.audit.recorded.v1",
                "body",
                r#"{"a":1}"#,
                "content_type",
                "application/json",
                "XACK",
                "raina.events",
                "notification-service.v1",
                "3-0",
                "EXEC"
            ]
        );
    }

    #[test]
    fn nack_without_dead_letter_stream_only_acks() {
        let config = RedisSourceConfig {
            dead_letter_stream: None,
            ..config()
        };
        let packed = words(&dead_letter_pipe(&config, &DeliveryTag::new("3-0"), None, "bad").get_packed_pipeline());
        assert_eq!(
            packed,
            ["MULTI", "XACK", "raina.events", "notification-service.v1", "3-0", "EXEC"]
        );
    }

    #[test]
    fn requeue_appends_a_copy_and_acks_the_original() {
        let raw = RawDelivery::json("acme.workspace.updated.v1", &json!({"n": 2}));
        let packed = words(&requeue_pipe(&config(), &DeliveryTag::new("8-0"), &raw).get_packed_pipeline());
        assert_eq!(
            packed,
            [
                "MULTI",
                "XADD",
                "raina.events",
                "*",
                "routing_key",
                "acme.workspace.updated.v1",
                "body",
                r#"{"n":2}"#,
                "XACK",
                "raina.events",
                "notification-service.v1",
                "8-0",
                "EXEC"
            ]
        );
    }

    #[test]
    fn ack_is_a_single_xack() {
        assert_eq!(
            words(&ack_cmd(&config(), &DeliveryTag::new("1-0")).get_packed_command()),
            ["XACK", "raina.events", "notification-service.v1", "1-0"]
        );
    }

    #[tokio::test]
    async fn stop_leaves_buffered_entries_pending() {
        let mut source = RedisStreamSource::new(config());
        source.absorb_batch(stream_ids(&["1-0", "2-0"]));
        source
            .in_flight
            .insert(DeliveryTag::new("0-1"), RawDelivery::new("k", "{}"));

        // No connection exists, so nothing can have been acked.
        source.stop().await.unwrap();
        assert!(source.conn.is_none());
        assert!(source.buffer.is_empty());
        assert!(source.in_flight.is_empty());
        assert!(source.next_event().await.unwrap().is_none());
    }
}

//! Record types flowing through the enrichment pipeline.
//!
//! Sources produce [`FactRecord`]s and [`DimensionRecord`]s, the join engine
//! turns facts into [`EnrichedRecord`]s, and the sink writes each enriched
//! record as a [`Document`].

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Event time in milliseconds since the Unix epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventTime(pub i64);

impl EventTime {
    pub const fn from_millis(ms: i64) -> Self {
        Self(ms)
    }

    pub const fn as_millis(&self) -> i64 {
        self.0
    }

    pub fn saturating_add_millis(&self, ms: i64) -> Self {
        Self(self.0.saturating_add(ms))
    }

    pub fn saturating_sub_millis(&self, ms: i64) -> Self {
        Self(self.0.saturating_sub(ms))
    }

    pub fn to_datetime(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp_millis(self.0)
    }
}

impl From<DateTime<Utc>> for EventTime {
    fn from(dt: DateTime<Utc>) -> Self {
        Self(dt.timestamp_millis())
    }
}

impl fmt::Display for EventTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a logical input stream (e.g. "entities", "events").
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StreamId(String);

impl StreamId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for StreamId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Join key correlating records across streams.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EntityKey {
    Int(i64),
    Str(String),
}

impl EntityKey {
    /// Converts a JSON scalar into a key. Only integers and non-empty strings qualify.
    pub fn from_json(value: &serde_json::Value) -> Option<Self> {
        match value {
            serde_json::Value::Number(n) => n.as_i64().map(Self::Int),
            serde_json::Value::String(s) if !s.is_empty() => Some(Self::Str(s.clone())),
            _ => None,
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Self::Int(i) => serde_json::Value::from(*i),
            Self::Str(s) => serde_json::Value::from(s.as_str()),
        }
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(i) => write!(f, "{}", i),
            Self::Str(s) => f.write_str(s),
        }
    }
}

impl From<i64> for EntityKey {
    fn from(i: i64) -> Self {
        Self::Int(i)
    }
}

impl From<&str> for EntityKey {
    fn from(s: &str) -> Self {
        Self::Str(s.to_string())
    }
}

/// Closed set of payload value variants.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldValue {
    Int(i64),
    Str(String),
    Timestamp(EventTime),
}

impl FieldValue {
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Self::Int(i) => serde_json::Value::from(*i),
            Self::Str(s) => serde_json::Value::from(s.as_str()),
            Self::Timestamp(t) => match t.to_datetime() {
                Some(dt) => serde_json::Value::from(
                    dt.to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
                ),
                None => serde_json::Value::from(t.as_millis()),
            },
        }
    }

    /// Interprets the value as a join key.
    pub fn as_key(&self) -> Option<EntityKey> {
        match self {
            Self::Int(i) => Some(EntityKey::Int(*i)),
            Self::Str(s) if !s.is_empty() => Some(EntityKey::Str(s.clone())),
            _ => None,
        }
    }
}

impl From<i64> for FieldValue {
    fn from(i: i64) -> Self {
        Self::Int(i)
    }
}

impl From<&str> for FieldValue {
    fn from(s: &str) -> Self {
        Self::Str(s.to_string())
    }
}

/// Field name to value mapping carried by every record.
pub type Payload = BTreeMap<String, FieldValue>;

/// Broker coordinate of a consumed partition.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SourceId {
    pub stream: StreamId,
    pub partition: i32,
}

impl SourceId {
    pub fn new(stream: impl Into<StreamId>, partition: i32) -> Self {
        Self {
            stream: stream.into(),
            partition,
        }
    }
}

impl From<String> for StreamId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.stream, self.partition)
    }
}

/// Position of a single record within its source partition.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SourcePosition {
    pub source: SourceId,
    pub offset: i64,
}

impl fmt::Display for SourcePosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.source, self.offset)
    }
}

/// Undecoded message as handed over by a source adapter.
#[derive(Debug, Clone)]
pub struct RawMessage {
    pub offset: i64,
    pub payload: Bytes,
    /// Broker-assigned timestamp, used when the stream declares no event-time field.
    pub timestamp: Option<EventTime>,
}

/// A fact (event) occurrence.
#[derive(Debug, Clone, PartialEq)]
pub struct FactRecord {
    pub key: EntityKey,
    /// Key referenced in each dimension stream.
    pub foreign_keys: BTreeMap<StreamId, EntityKey>,
    pub payload: Payload,
    pub event_time: EventTime,
}

/// Latest known state of an entity in a dimension stream.
#[derive(Debug, Clone, PartialEq)]
pub struct DimensionRecord {
    pub key: EntityKey,
    pub payload: Payload,
    pub event_time: EventTime,
}

/// A decoded record tagged with its role.
#[derive(Debug, Clone, PartialEq)]
pub enum SourceRecord {
    Fact(FactRecord),
    Dimension(DimensionRecord),
}

impl SourceRecord {
    pub fn event_time(&self) -> EventTime {
        match self {
            Self::Fact(f) => f.event_time,
            Self::Dimension(d) => d.event_time,
        }
    }

    pub fn key(&self) -> &EntityKey {
        match self {
            Self::Fact(f) => &f.key,
            Self::Dimension(d) => &d.key,
        }
    }
}

/// A decoded record travelling from a source worker to the join task.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub position: SourcePosition,
    pub record: SourceRecord,
}

/// Outcome of the join for a single fact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnrichmentStatus {
    /// Every required dimension resolved.
    Enriched,
    /// Emitted after the pending horizon expired or the key was evicted.
    Partial,
}

impl EnrichmentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Enriched => "enriched",
            Self::Partial => "partial",
        }
    }
}

/// Dimension data resolved (or not) for one stream.
#[derive(Debug, Clone, PartialEq)]
pub struct DimensionSlot {
    /// Fields declared for the stream, emitted as null when unresolved.
    pub declared_fields: Vec<String>,
    pub payload: Option<Payload>,
}

/// Result of joining a fact with the dimension streams.
#[derive(Debug, Clone, PartialEq)]
pub struct EnrichedRecord {
    /// Document id in the sink.
    pub primary_key: String,
    pub key_field: String,
    pub key: EntityKey,
    pub fact: Payload,
    /// Dimension slots in topology order.
    pub dimensions: Vec<(StreamId, DimensionSlot)>,
    pub ts: EventTime,
    pub status: EnrichmentStatus,
    pub late: bool,
    pub origin: SourcePosition,
}

impl EnrichedRecord {
    /// Flattens the record into a JSON object.
    ///
    /// Fact fields take precedence over dimension fields with the same name, and
    /// earlier dimension streams take precedence over later ones.
    pub fn body(&self) -> serde_json::Value {
        let mut body = serde_json::Map::new();
        body.insert(self.key_field.clone(), self.key.to_json());

        for (name, value) in &self.fact {
            body.entry(name.clone()).or_insert_with(|| value.to_json());
        }

        for (_, slot) in &self.dimensions {
            match &slot.payload {
                Some(payload) => {
                    for (name, value) in payload {
                        body.entry(name.clone()).or_insert_with(|| value.to_json());
                    }
                    for name in &slot.declared_fields {
                        body.entry(name.clone()).or_insert(serde_json::Value::Null);
                    }
                }
                None => {
                    for name in &slot.declared_fields {
                        body.entry(name.clone()).or_insert(serde_json::Value::Null);
                    }
                }
            }
        }

        body.entry("ts".to_string())
            .or_insert_with(|| FieldValue::Timestamp(self.ts).to_json());
        if self.late {
            body.insert("late".to_string(), serde_json::Value::Bool(true));
        }

        serde_json::Value::Object(body)
    }

    pub fn to_document(&self) -> Document {
        Document {
            id: self.primary_key.clone(),
            entity_key: self.key.to_string(),
            body: self.body(),
            event_time: self.ts,
            status: self.status,
        }
    }
}

/// Sink representation of an enriched record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub entity_key: String,
    pub body: serde_json::Value,
    pub event_time: EventTime,
    pub status: EnrichmentStatus,
}

/// A fact that arrived behind its stream's watermark.
#[derive(Debug, Clone)]
pub struct LateRecord {
    pub fact: FactRecord,
    pub position: SourcePosition,
    pub watermark: EventTime,
}

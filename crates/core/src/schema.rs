//! Stream topology and record decoding.
//!
//! Every input stream is described by a [`StreamSpec`]. The [`RecordDecoder`]
//! validates raw JSON messages against their stream's spec and turns them into
//! typed [`SourceRecord`]s. Anything that does not match is rejected as a
//! malformed record.

use chrono::DateTime;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};

use crate::error::{Error, MalformedErrorCode, Result};
use crate::limits::{MAX_FIELDS_PER_RECORD, MAX_RECORD_SIZE_BYTES, MAX_STRING_FIELD_CHARS};
use crate::records::{
    DimensionRecord, EntityKey, EventTime, FactRecord, FieldValue, Payload, RawMessage,
    SourceRecord, StreamId,
};

/// Role of a stream in the join.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamRole {
    Fact,
    Dimension,
}

/// Declared type of a payload field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldKind {
    Int,
    String,
    Timestamp,
}

impl FieldKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Int => "int",
            Self::String => "string",
            Self::Timestamp => "timestamp",
        }
    }
}

/// A declared payload field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldSpec {
    pub name: String,
    pub kind: FieldKind,
    #[serde(default)]
    pub required: bool,
}

impl FieldSpec {
    pub fn new(name: impl Into<String>, kind: FieldKind) -> Self {
        Self {
            name: name.into(),
            kind,
            required: false,
        }
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }
}

/// Description of one input stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamSpec {
    pub id: StreamId,
    pub role: StreamRole,
    /// Broker topic the stream is read from
    pub topic: String,
    /// Broker partition
    #[serde(default)]
    pub partition: i32,
    /// Field holding the entity key
    #[serde(default = "default_key_field")]
    pub key_field: String,
    /// Field holding the event time; the broker timestamp is used when unset
    #[serde(default)]
    pub event_time_field: Option<String>,
    /// Dimension streams only: fact field referencing this stream's key.
    /// The fact's own key is used when unset.
    #[serde(default)]
    pub fact_key_field: Option<String>,
    /// Dimension streams only: facts wait for this stream's state before emitting
    #[serde(default = "default_required")]
    pub required: bool,
    /// Declared fields, type-checked on decode and null-filled when unresolved
    #[serde(default)]
    pub fields: Vec<FieldSpec>,
}

fn default_key_field() -> String {
    "key".to_string()
}

fn default_required() -> bool {
    true
}

impl StreamSpec {
    pub fn fact(id: impl Into<StreamId>, topic: impl Into<String>) -> Self {
        Self::new(id.into(), StreamRole::Fact, topic.into())
    }

    pub fn dimension(id: impl Into<StreamId>, topic: impl Into<String>) -> Self {
        Self::new(id.into(), StreamRole::Dimension, topic.into())
    }

    fn new(id: StreamId, role: StreamRole, topic: String) -> Self {
        Self {
            id,
            role,
            topic,
            partition: 0,
            key_field: default_key_field(),
            event_time_field: None,
            fact_key_field: None,
            required: default_required(),
            fields: Vec::new(),
        }
    }

    pub fn with_partition(mut self, partition: i32) -> Self {
        self.partition = partition;
        self
    }

    pub fn with_key_field(mut self, field: impl Into<String>) -> Self {
        self.key_field = field.into();
        self
    }

    pub fn with_event_time_field(mut self, field: impl Into<String>) -> Self {
        self.event_time_field = Some(field.into());
        self
    }

    pub fn with_fact_key_field(mut self, field: impl Into<String>) -> Self {
        self.fact_key_field = Some(field.into());
        self
    }

    pub fn optional(mut self) -> Self {
        self.required = false;
        self
    }

    pub fn with_field(mut self, field: FieldSpec) -> Self {
        self.fields.push(field);
        self
    }

    pub fn is_fact(&self) -> bool {
        self.role == StreamRole::Fact
    }

    pub fn declared_field_names(&self) -> Vec<String> {
        self.fields.iter().map(|f| f.name.clone()).collect()
    }
}

/// Default three-stream topology: one entity stream, one event stream and one
/// metadata stream, all keyed by `key` and timestamped by `ts`.
pub fn default_topology() -> Vec<StreamSpec> {
    vec![
        StreamSpec::dimension("entities", "entities").with_event_time_field("ts"),
        StreamSpec::fact("events", "events").with_event_time_field("ts"),
        StreamSpec::dimension("metadata", "metadata")
            .with_event_time_field("ts")
            .optional(),
    ]
}

/// Checks that the topology has exactly one fact stream, at least one
/// dimension stream and unique stream ids.
pub fn validate_topology(streams: &[StreamSpec]) -> Result<()> {
    let mut seen = HashSet::new();
    for spec in streams {
        if spec.id.as_str().is_empty() {
            return Err(Error::config("stream id must not be empty"));
        }
        if !seen.insert(spec.id.clone()) {
            return Err(Error::config(format!("duplicate stream id '{}'", spec.id)));
        }
        if spec.key_field.is_empty() {
            return Err(Error::config(format!(
                "stream '{}' has an empty key field",
                spec.id
            )));
        }
    }

    let facts = streams.iter().filter(|s| s.is_fact()).count();
    if facts != 1 {
        return Err(Error::config(format!(
            "topology needs exactly one fact stream, found {}",
            facts
        )));
    }

    if !streams.iter().any(|s| !s.is_fact()) {
        return Err(Error::config("topology needs at least one dimension stream"));
    }

    Ok(())
}

/// Decodes raw messages into typed records.
#[derive(Debug, Clone)]
pub struct RecordDecoder {
    streams: HashMap<StreamId, StreamSpec>,
    /// Dimension streams with the fact field that references them, in topology order.
    links: Vec<(StreamId, Option<String>)>,
}

impl RecordDecoder {
    pub fn new(streams: &[StreamSpec]) -> Result<Self> {
        validate_topology(streams)?;

        let links = streams
            .iter()
            .filter(|s| !s.is_fact())
            .map(|s| (s.id.clone(), s.fact_key_field.clone()))
            .collect();

        Ok(Self {
            streams: streams.iter().map(|s| (s.id.clone(), s.clone())).collect(),
            links,
        })
    }

    pub fn spec(&self, stream: &StreamId) -> Option<&StreamSpec> {
        self.streams.get(stream)
    }

    /// Decodes a message read from `stream`.
    pub fn decode(&self, stream: &StreamId, raw: &RawMessage) -> Result<SourceRecord> {
        let spec = self
            .streams
            .get(stream)
            .ok_or_else(|| Error::internal(format!("unknown stream '{}'", stream)))?;

        if raw.payload.is_empty() {
            return Err(Error::malformed(
                MalformedErrorCode::EmptyRecord,
                "record has no value",
            ));
        }
        if raw.payload.len() > MAX_RECORD_SIZE_BYTES {
            return Err(Error::malformed(
                MalformedErrorCode::Oversized,
                format!(
                    "record {}KB exceeds {}KB limit",
                    raw.payload.len() / 1024,
                    MAX_RECORD_SIZE_BYTES / 1024
                ),
            ));
        }

        let value: serde_json::Value = serde_json::from_slice(&raw.payload).map_err(|e| {
            Error::malformed(MalformedErrorCode::InvalidJson, format!("invalid JSON: {}", e))
        })?;
        let serde_json::Value::Object(mut object) = value else {
            return Err(Error::malformed(
                MalformedErrorCode::InvalidJson,
                "expected a JSON object",
            ));
        };
        if object.len() > MAX_FIELDS_PER_RECORD {
            return Err(Error::malformed(
                MalformedErrorCode::Oversized,
                format!(
                    "record has {} fields, limit is {}",
                    object.len(),
                    MAX_FIELDS_PER_RECORD
                ),
            ));
        }

        let key_value = object.remove(&spec.key_field).ok_or_else(|| {
            Error::malformed(
                MalformedErrorCode::MissingField,
                format!("missing key field '{}'", spec.key_field),
            )
        })?;
        let key = EntityKey::from_json(&key_value).ok_or_else(|| {
            Error::malformed(
                MalformedErrorCode::InvalidType,
                format!(
                    "key field '{}' must be an integer or a non-empty string",
                    spec.key_field
                ),
            )
        })?;

        let event_time = match &spec.event_time_field {
            Some(field) => {
                let value = object.remove(field).ok_or_else(|| {
                    Error::malformed(
                        MalformedErrorCode::MissingEventTime,
                        format!("missing event time field '{}'", field),
                    )
                })?;
                parse_timestamp(&value).ok_or_else(|| {
                    Error::malformed(
                        MalformedErrorCode::MissingEventTime,
                        format!(
                            "event time field '{}' must be epoch millis or RFC 3339",
                            field
                        ),
                    )
                })?
            }
            None => raw.timestamp.ok_or_else(|| {
                Error::malformed(
                    MalformedErrorCode::MissingEventTime,
                    "no event time field declared and no broker timestamp",
                )
            })?,
        };

        let payload = decode_payload(spec, object)?;

        Ok(match spec.role {
            StreamRole::Fact => {
                let foreign_keys = self.foreign_keys(&key, &payload);
                SourceRecord::Fact(FactRecord {
                    key,
                    foreign_keys,
                    payload,
                    event_time,
                })
            }
            StreamRole::Dimension => SourceRecord::Dimension(DimensionRecord {
                key,
                payload,
                event_time,
            }),
        })
    }

    fn foreign_keys(&self, key: &EntityKey, payload: &Payload) -> BTreeMap<StreamId, EntityKey> {
        let mut foreign_keys = BTreeMap::new();
        for (stream, field) in &self.links {
            let fk = match field {
                None => Some(key.clone()),
                Some(field) => payload.get(field).and_then(FieldValue::as_key),
            };
            if let Some(fk) = fk {
                foreign_keys.insert(stream.clone(), fk);
            }
        }
        foreign_keys
    }
}

/// Parses epoch milliseconds or an RFC 3339 string.
pub fn parse_timestamp(value: &serde_json::Value) -> Option<EventTime> {
    match value {
        serde_json::Value::Number(n) => n.as_i64().map(EventTime),
        serde_json::Value::String(s) => DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|dt| EventTime(dt.timestamp_millis())),
        _ => None,
    }
}

fn decode_payload(
    spec: &StreamSpec,
    object: serde_json::Map<String, serde_json::Value>,
) -> Result<Payload> {
    let declared: HashMap<&str, &FieldSpec> =
        spec.fields.iter().map(|f| (f.name.as_str(), f)).collect();
    let mut payload = Payload::new();

    for (name, value) in object {
        if value.is_null() {
            continue;
        }

        let decoded = match declared.get(name.as_str()) {
            Some(field) => decode_declared(field, &value)?,
            None => decode_untyped(&name, &value)?,
        };

        if let FieldValue::Str(s) = &decoded {
            if s.chars().count() > MAX_STRING_FIELD_CHARS {
                return Err(Error::malformed(
                    MalformedErrorCode::Oversized,
                    format!("field '{}' exceeds {} chars", name, MAX_STRING_FIELD_CHARS),
                ));
            }
        }

        payload.insert(name, decoded);
    }

    for field in spec.fields.iter().filter(|f| f.required) {
        if !payload.contains_key(&field.name) {
            return Err(Error::malformed(
                MalformedErrorCode::MissingField,
                format!("missing required field '{}'", field.name),
            ));
        }
    }

    Ok(payload)
}

fn decode_declared(field: &FieldSpec, value: &serde_json::Value) -> Result<FieldValue> {
    let decoded = match field.kind {
        FieldKind::Int => value.as_i64().map(FieldValue::Int),
        FieldKind::String => value.as_str().map(|s| FieldValue::Str(s.to_string())),
        FieldKind::Timestamp => parse_timestamp(value).map(FieldValue::Timestamp),
    };

    decoded.ok_or_else(|| {
        Error::malformed(
            MalformedErrorCode::InvalidType,
            format!("field '{}' is not a valid {}", field.name, field.kind.as_str()),
        )
    })
}

fn decode_untyped(name: &str, value: &serde_json::Value) -> Result<FieldValue> {
    match value {
        serde_json::Value::Number(n) => n.as_i64().map(FieldValue::Int).ok_or_else(|| {
            Error::malformed(
                MalformedErrorCode::UnsupportedValue,
                format!("field '{}' is not an integer", name),
            )
        }),
        serde_json::Value::String(s) => Ok(FieldValue::Str(s.clone())),
        _ => Err(Error::malformed(
            MalformedErrorCode::UnsupportedValue,
            format!("field '{}' has an unsupported value type", name),
        )),
    }
}

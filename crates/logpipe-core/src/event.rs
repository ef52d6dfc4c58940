//! The uniform record carried through every pipeline stage.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A single log event flowing from a source, through the processor
/// chain, into every sink.
///
/// Each stage owns the event exclusively while processing it; sources
/// guarantee `id`, `source_type`, `source_name`, and `raw_data` are
/// non-empty before handing the event onward. Timestamps order events
/// within a single source, not across sources.
///
/// The serde representation is the event's wire form: serializing and
/// deserializing an event yields an observationally equal event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEvent {
    /// Unique identifier, stable for the event's lifetime
    #[serde(default = "new_event_id")]
    pub id: String,

    /// Wall-clock instant (UTC) set by the source; processors may overwrite
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,

    /// Short tag of the producing source kind ("file", "kafka", "s3", "winlog")
    pub source_type: String,

    /// Identifier of the origin instance (file path, topic, bucket/key)
    pub source_name: String,

    /// Original payload as captured
    pub raw_data: String,

    /// Parsed and derived data; values may nest
    #[serde(default)]
    pub fields: Map<String, Value>,

    /// Provenance and processing annotations (offsets, errors)
    #[serde(default)]
    pub metadata: Map<String, Value>,

    /// Free-form labels, insertion-ordered, deduplicated on insert
    #[serde(default)]
    pub tags: Vec<String>,
}

fn new_event_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

impl LogEvent {
    /// Create an event with a fresh id and the current UTC timestamp.
    pub fn new(
        raw_data: impl Into<String>,
        source_type: impl Into<String>,
        source_name: impl Into<String>,
    ) -> Self {
        Self {
            id: new_event_id(),
            timestamp: Utc::now(),
            source_type: source_type.into(),
            source_name: source_name.into(),
            raw_data: raw_data.into(),
            fields: Map::new(),
            metadata: Map::new(),
            tags: Vec::new(),
        }
    }

    /// Replace the event timestamp, returning the event for chaining.
    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Add or update a parsed field.
    pub fn add_field(&mut self, key: impl Into<String>, value: Value) {
        self.fields.insert(key.into(), value);
    }

    /// Add or update a metadata entry.
    pub fn add_metadata(&mut self, key: impl Into<String>, value: Value) {
        self.metadata.insert(key.into(), value);
    }

    /// Add a tag unless it is already present.
    pub fn add_tag(&mut self, tag: impl Into<String>) {
        let tag = tag.into();
        if !self.tags.contains(&tag) {
            self.tags.push(tag);
        }
    }

    /// Look up a value by field name.
    ///
    /// The reserved name `"raw_data"` resolves to the original payload,
    /// which is what processors default to operating on.
    pub fn field_value(&self, name: &str) -> Option<Value> {
        if name == "raw_data" {
            Some(Value::String(self.raw_data.clone()))
        } else {
            self.fields.get(name).cloned()
        }
    }

    /// Render a field value as plain text: strings verbatim, anything
    /// else in its JSON form.
    pub fn field_as_string(&self, name: &str) -> Option<String> {
        self.field_value(name).map(|v| value_to_string(&v))
    }
}

/// Stringify a JSON value without quoting strings.
pub fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

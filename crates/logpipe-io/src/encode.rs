//! Shared line encoding for the file and object-store sinks.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;

use logpipe_core::{value_to_string, LogEvent};

static PLACEHOLDER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{([A-Za-z0-9_]+)\}").expect("placeholder grammar"));

/// Output encoding shared by the file and s3 sinks.
#[derive(Debug, Clone, Copy, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum Format {
    Json,
    Text,
}

impl Default for Format {
    fn default() -> Self {
        Format::Json
    }
}

/// Encode one event as an output line (without the trailing newline).
///
/// JSON encoding is the event's serde form. Text encoding renders the
/// template against the event context; a template referencing a field
/// the event lacks falls back to `"<timestamp> <raw_data>"`.
pub fn encode_event(
    event: &LogEvent,
    format: Format,
    template: &str,
    message_field: &str,
) -> String {
    match format {
        Format::Json => serde_json::to_string(event).unwrap_or_else(|_| fallback_line(event)),
        Format::Text => {
            render_template(event, template, message_field).unwrap_or_else(|| fallback_line(event))
        }
    }
}

/// Microsecond-precision timestamp without a zone suffix, the shape
/// templated text output uses.
pub fn context_timestamp(event: &LogEvent) -> String {
    event.timestamp.format("%Y-%m-%dT%H:%M:%S%.6f").to_string()
}

fn fallback_line(event: &LogEvent) -> String {
    format!("{} {}", context_timestamp(event), event.raw_data)
}

fn render_template(event: &LogEvent, template: &str, message_field: &str) -> Option<String> {
    let mut out = String::with_capacity(template.len());
    let mut last = 0;

    for caps in PLACEHOLDER.captures_iter(template) {
        let whole = caps.get(0).expect("group 0 always present");
        out.push_str(&template[last..whole.start()]);
        last = whole.end();

        let key = &caps[1];
        let value = match key {
            "id" => event.id.clone(),
            "timestamp" => context_timestamp(event),
            "source_type" => event.source_type.clone(),
            "source_name" => event.source_name.clone(),
            "raw_data" => event.raw_data.clone(),
            "message" => match event.fields.get(message_field) {
                Some(value) => value_to_string(value),
                None => event.raw_data.clone(),
            },
            field => value_to_string(event.fields.get(field)?),
        };
        out.push_str(&value);
    }
    out.push_str(&template[last..]);
    Some(out)
}

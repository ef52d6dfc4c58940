//! JSON parsing processor.

use anyhow::Result;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;

use logpipe_core::{parse_options, ConfigError, LogEvent, Processor};

#[derive(Debug, Deserialize)]
struct JsonOptions {
    #[serde(default = "default_field")]
    field: String,
    #[serde(default = "default_target")]
    target_field: String,
    #[serde(default = "default_true")]
    preserve_original: bool,
    #[serde(default)]
    ignore_errors: bool,
}

fn default_field() -> String {
    "raw_data".to_string()
}

fn default_target() -> String {
    "parsed".to_string()
}

fn default_true() -> bool {
    true
}

/// Parses a string field as JSON.
///
/// The parsed value lands under `target_field`; with an empty target,
/// top-level object keys are flattened directly into the event's
/// fields. Parse failures drop the event unless `ignore_errors` is
/// set, in which case the event passes through annotated with
/// `metadata.json_error`.
pub struct JsonProcessor {
    name: String,
    field: String,
    target_field: String,
    preserve_original: bool,
    ignore_errors: bool,
}

impl JsonProcessor {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            field: default_field(),
            target_field: default_target(),
            preserve_original: true,
            ignore_errors: false,
        }
    }
}

#[async_trait]
impl Processor for JsonProcessor {
    fn name(&self) -> &str {
        &self.name
    }

    async fn configure(&mut self, options: &serde_yaml::Value) -> Result<(), ConfigError> {
        let opts: JsonOptions = parse_options("json processor", options)?;
        self.field = opts.field;
        self.target_field = opts.target_field;
        self.preserve_original = opts.preserve_original;
        self.ignore_errors = opts.ignore_errors;
        Ok(())
    }

    async fn process(&self, mut event: LogEvent) -> Result<Option<LogEvent>> {
        let text = match event.field_as_string(&self.field) {
            Some(text) if !text.is_empty() => text,
            _ => return Ok(Some(event)),
        };

        match serde_json::from_str::<Value>(&text) {
            Ok(parsed) => {
                if self.target_field.is_empty() {
                    if let Value::Object(map) = parsed {
                        for (key, value) in map {
                            event.add_field(key, value);
                        }
                    }
                } else {
                    event.add_field(self.target_field.clone(), parsed);
                }

                if !self.preserve_original && self.field != "raw_data" {
                    event.fields.remove(&self.field);
                }
                Ok(Some(event))
            }
            Err(e) if self.ignore_errors => {
                event.add_metadata("json_error", Value::String(e.to_string()));
                Ok(Some(event))
            }
            Err(_) => Ok(None),
        }
    }

    async fn release(&self) -> Result<()> {
        Ok(())
    }
}

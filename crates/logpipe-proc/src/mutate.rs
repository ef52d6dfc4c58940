//! Field mutation processor.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use indexmap::IndexMap;
use regex::Regex;
use serde::Deserialize;
use serde_json::Value;

use logpipe_core::{parse_options, value_to_string, ConfigError, LogEvent, Processor};

#[derive(Debug, Deserialize)]
struct MutateOptions {
    #[serde(default)]
    add_fields: IndexMap<String, Value>,
    #[serde(default)]
    remove_fields: Vec<String>,
    #[serde(default)]
    rename_fields: IndexMap<String, String>,
    #[serde(default)]
    uppercase_fields: Vec<String>,
    #[serde(default)]
    lowercase_fields: Vec<String>,
    #[serde(default)]
    convert_fields: IndexMap<String, String>,
    #[serde(default)]
    gsub_fields: IndexMap<String, (String, String)>,
    #[serde(default)]
    merge_fields: IndexMap<String, Vec<String>>,
    #[serde(default)]
    split_fields: IndexMap<String, (String, i64)>,
    #[serde(default)]
    strip_fields: Vec<String>,
}

const CONVERT_TYPES: &[&str] = &["int", "float", "str", "string", "bool", "list", "timestamp"];

const TIMESTAMP_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S%.fZ",
    "%Y-%m-%dT%H:%M:%SZ",
    "%Y-%m-%d %H:%M:%S",
    "%Y/%m/%d %H:%M:%S",
];

/// Performs field operations in a fixed order: add, remove, rename,
/// uppercase, lowercase, convert, substitute, merge, split, strip.
///
/// Operations on missing fields are silently skipped; a failed type
/// conversion annotates `metadata.convert_error_FIELD` and leaves the
/// field as it was.
pub struct MutateProcessor {
    name: String,
    add_fields: IndexMap<String, Value>,
    remove_fields: Vec<String>,
    rename_fields: IndexMap<String, String>,
    uppercase_fields: Vec<String>,
    lowercase_fields: Vec<String>,
    convert_fields: IndexMap<String, String>,
    gsub_fields: Vec<(String, Regex, String)>,
    merge_fields: IndexMap<String, Vec<String>>,
    split_fields: IndexMap<String, (String, i64)>,
    strip_fields: Vec<String>,
}

impl MutateProcessor {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            add_fields: IndexMap::new(),
            remove_fields: Vec::new(),
            rename_fields: IndexMap::new(),
            uppercase_fields: Vec::new(),
            lowercase_fields: Vec::new(),
            convert_fields: IndexMap::new(),
            gsub_fields: Vec::new(),
            merge_fields: IndexMap::new(),
            split_fields: IndexMap::new(),
            strip_fields: Vec::new(),
        }
    }
}

fn convert_value(value: &Value, target: &str) -> Result<Value, String> {
    match target {
        "int" => match value {
            Value::Number(n) => n
                .as_i64()
                .or_else(|| n.as_f64().map(|f| f as i64))
                .map(Value::from)
                .ok_or_else(|| format!("cannot convert {} to int", n)),
            Value::Bool(b) => Ok(Value::from(*b as i64)),
            Value::String(s) => s
                .trim()
                .parse::<i64>()
                .map(Value::from)
                .map_err(|e| format!("cannot convert '{}' to int: {}", s, e)),
            other => Err(format!("cannot convert {} to int", other)),
        },
        "float" => match value {
            Value::Number(n) => n
                .as_f64()
                .map(Value::from)
                .ok_or_else(|| format!("cannot convert {} to float", n)),
            Value::Bool(b) => Ok(Value::from(*b as i64 as f64)),
            Value::String(s) => s
                .trim()
                .parse::<f64>()
                .map(Value::from)
                .map_err(|e| format!("cannot convert '{}' to float: {}", s, e)),
            other => Err(format!("cannot convert {} to float", other)),
        },
        "str" | "string" => Ok(Value::String(value_to_string(value))),
        "bool" => Ok(Value::Bool(match value {
            Value::Bool(b) => *b,
            Value::String(s) => {
                matches!(s.to_lowercase().as_str(), "true" | "yes" | "y" | "1")
            }
            Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
            Value::Null => false,
            _ => true,
        })),
        "list" => Ok(match value {
            Value::Array(_) => value.clone(),
            Value::String(s) => Value::Array(
                s.split(',')
                    .map(|item| Value::String(item.trim().to_string()))
                    .collect(),
            ),
            other => Value::Array(vec![other.clone()]),
        }),
        "timestamp" => parse_timestamp(value)
            .map(|ts| Value::String(ts.to_rfc3339()))
            .ok_or_else(|| format!("could not parse timestamp: {}", value_to_string(value))),
        other => Err(format!("unsupported conversion type: {}", other)),
    }
}

fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::Number(n) => {
            let secs = n.as_f64()?;
            DateTime::from_timestamp(secs as i64, ((secs.fract()) * 1e9) as u32)
        }
        Value::String(s) => {
            for format in TIMESTAMP_FORMATS {
                if let Ok(naive) = NaiveDateTime::parse_from_str(s, format) {
                    return Some(naive.and_utc());
                }
            }
            None
        }
        _ => None,
    }
}

#[async_trait]
impl Processor for MutateProcessor {
    fn name(&self) -> &str {
        &self.name
    }

    async fn configure(&mut self, options: &serde_yaml::Value) -> Result<(), ConfigError> {
        let opts: MutateOptions = parse_options("mutate processor", options)?;

        for (field, target) in &opts.convert_fields {
            if !CONVERT_TYPES.contains(&target.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "mutate processor: unsupported conversion type for {}: {}",
                    field, target
                )));
            }
        }

        self.gsub_fields = opts
            .gsub_fields
            .into_iter()
            .map(|(field, (pattern, replacement))| {
                let compiled = Regex::new(&pattern).map_err(|e| {
                    ConfigError::Invalid(format!(
                        "mutate processor: invalid pattern for gsub_fields.{}: {}",
                        field, e
                    ))
                })?;
                Ok((field, compiled, replacement))
            })
            .collect::<Result<_, ConfigError>>()?;

        self.add_fields = opts.add_fields;
        self.remove_fields = opts.remove_fields;
        self.rename_fields = opts.rename_fields;
        self.uppercase_fields = opts.uppercase_fields;
        self.lowercase_fields = opts.lowercase_fields;
        self.convert_fields = opts.convert_fields;
        self.merge_fields = opts.merge_fields;
        self.split_fields = opts.split_fields;
        self.strip_fields = opts.strip_fields;
        Ok(())
    }

    async fn process(&self, mut event: LogEvent) -> Result<Option<LogEvent>> {
        for (field, value) in &self.add_fields {
            event.add_field(field.clone(), value.clone());
        }

        for field in &self.remove_fields {
            event.fields.remove(field);
        }

        for (old, new) in &self.rename_fields {
            if let Some(value) = event.fields.remove(old) {
                event.add_field(new.clone(), value);
            }
        }

        for field in &self.uppercase_fields {
            if let Some(Value::String(s)) = event.fields.get_mut(field) {
                *s = s.to_uppercase();
            }
        }

        for field in &self.lowercase_fields {
            if let Some(Value::String(s)) = event.fields.get_mut(field) {
                *s = s.to_lowercase();
            }
        }

        for (field, target) in &self.convert_fields {
            if let Some(value) = event.fields.get(field) {
                match convert_value(value, target) {
                    Ok(converted) => {
                        event.fields.insert(field.clone(), converted);
                    }
                    Err(message) => {
                        event.add_metadata(
                            format!("convert_error_{}", field),
                            Value::String(message),
                        );
                    }
                }
            }
        }

        for (field, pattern, replacement) in &self.gsub_fields {
            if let Some(Value::String(s)) = event.fields.get(field) {
                let replaced = pattern.replace_all(s, replacement.as_str()).into_owned();
                event.fields.insert(field.clone(), Value::String(replaced));
            }
        }

        for (target, sources) in &self.merge_fields {
            let merged = sources
                .iter()
                .filter_map(|source| event.fields.get(source).map(value_to_string))
                .collect::<Vec<_>>()
                .join(" ");
            if !merged.is_empty() {
                event.add_field(target.clone(), Value::String(merged));
            }
        }

        for (field, (separator, limit)) in &self.split_fields {
            if let Some(Value::String(s)) = event.fields.get(field) {
                let parts: Vec<Value> = if *limit < 0 {
                    s.split(separator.as_str())
                        .map(|p| Value::String(p.to_string()))
                        .collect()
                } else {
                    s.splitn(*limit as usize + 1, separator.as_str())
                        .map(|p| Value::String(p.to_string()))
                        .collect()
                };
                event.fields.insert(field.clone(), Value::Array(parts));
            }
        }

        for field in &self.strip_fields {
            if let Some(Value::String(s)) = event.fields.get(field) {
                let stripped = s.trim().to_string();
                event.fields.insert(field.clone(), Value::String(stripped));
            }
        }

        Ok(Some(event))
    }

    async fn release(&self) -> Result<()> {
        Ok(())
    }
}

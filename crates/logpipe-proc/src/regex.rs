//! Regex extraction processor.

use anyhow::Result;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Map, Value};

use logpipe_core::{parse_options, ConfigError, LogEvent, Processor};

#[derive(Debug, Deserialize)]
struct RegexOptions {
    #[serde(default = "default_field")]
    field: String,
    pattern: Option<String>,
    #[serde(default = "default_true")]
    named_groups: bool,
    #[serde(default)]
    group_names: Vec<String>,
    #[serde(default)]
    target_field: Option<String>,
    #[serde(default = "default_true")]
    preserve_original: bool,
}

fn default_field() -> String {
    "raw_data".to_string()
}

fn default_true() -> bool {
    true
}

/// Applies one compiled pattern to a source field and installs the
/// capture groups as event fields.
///
/// With `named_groups` (the default) the pattern's `(?P<name>...)`
/// groups become field names; otherwise positional groups are paired
/// with `group_names`, overflow groups falling back to `groupN`. An
/// unmatched event passes through unchanged.
pub struct RegexProcessor {
    name: String,
    field: String,
    pattern: regex::Regex,
    named_groups: bool,
    group_names: Vec<String>,
    target_field: Option<String>,
    preserve_original: bool,
}

impl RegexProcessor {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            field: default_field(),
            pattern: regex::Regex::new("$^").expect("placeholder pattern"),
            named_groups: true,
            group_names: Vec::new(),
            target_field: None,
            preserve_original: true,
        }
    }

    fn extract(&self, caps: &regex::Captures<'_>) -> Map<String, Value> {
        let mut extracted = Map::new();
        if self.named_groups {
            for name in self.pattern.capture_names().flatten() {
                if let Some(m) = caps.name(name) {
                    extracted.insert(name.to_string(), Value::String(m.as_str().to_string()));
                }
            }
        } else {
            for (index, group) in caps.iter().skip(1).enumerate() {
                let Some(m) = group else { continue };
                let key = self
                    .group_names
                    .get(index)
                    .cloned()
                    .unwrap_or_else(|| format!("group{}", index + 1));
                extracted.insert(key, Value::String(m.as_str().to_string()));
            }
        }
        extracted
    }
}

#[async_trait]
impl Processor for RegexProcessor {
    fn name(&self) -> &str {
        &self.name
    }

    async fn configure(&mut self, options: &serde_yaml::Value) -> Result<(), ConfigError> {
        let opts: RegexOptions = parse_options("regex processor", options)?;
        let pattern = opts
            .pattern
            .filter(|p| !p.is_empty())
            .ok_or_else(|| ConfigError::invalid("regex processor: pattern is required"))?;

        let compiled = regex::Regex::new(&pattern).map_err(|e| {
            ConfigError::Invalid(format!("regex processor: invalid pattern: {}", e))
        })?;

        if !opts.named_groups && opts.group_names.is_empty() && compiled.captures_len() > 1 {
            return Err(ConfigError::Invalid(format!(
                "regex processor: group_names must be provided for {} capturing groups",
                compiled.captures_len() - 1
            )));
        }

        self.pattern = compiled;
        self.field = opts.field;
        self.named_groups = opts.named_groups;
        self.group_names = opts.group_names;
        self.target_field = opts.target_field.filter(|t| !t.is_empty());
        self.preserve_original = opts.preserve_original;
        Ok(())
    }

    async fn process(&self, mut event: LogEvent) -> Result<Option<LogEvent>> {
        let text = match event.field_as_string(&self.field) {
            Some(text) if !text.is_empty() => text,
            _ => return Ok(Some(event)),
        };

        if let Some(caps) = self.pattern.captures(&text) {
            let extracted = self.extract(&caps);
            match &self.target_field {
                Some(target) => event.add_field(target.clone(), Value::Object(extracted)),
                None => {
                    for (key, value) in extracted {
                        event.add_field(key, value);
                    }
                }
            }

            if !self.preserve_original && self.field != "raw_data" {
                event.fields.remove(&self.field);
            }
        }

        Ok(Some(event))
    }

    async fn release(&self) -> Result<()> {
        Ok(())
    }
}

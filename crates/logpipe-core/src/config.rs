//! Pipeline configuration loading and validation.
//!
//! A pipeline is declared in a YAML document:
//!
//! ```yaml
//! name: "web-logs"
//! sources:
//!   - name: "access-log"
//!     type: file
//!     config:
//!       path: /var/log/nginx/access.log
//! processors:
//!   - name: "apache"
//!     type: grok
//!     config:
//!       patterns: ["%{COMMONAPACHELOG}"]
//! sinks:
//!   - name: "archive"
//!     type: file
//!     config:
//!       path: /var/log/archive/access.jsonl
//! batch_size: 100
//! batch_timeout: 5.0
//! ```
//!
//! Loading is two-phase: the raw document is shape-checked first so
//! that errors name the offending item by index, then deserialized
//! into the typed [`PipelineConfig`].

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_yaml::Value;

use crate::error::ConfigError;

/// One configured component: a name, a registry type tag, and the
/// component-specific option mapping passed to `configure`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentSpec {
    /// Instance name, used in logs and status output
    pub name: String,

    /// Registry type tag, e.g. "file", "json", "opensearch"
    #[serde(rename = "type")]
    pub kind: String,

    /// Component options, interpreted by the component itself
    pub config: Value,
}

/// The validated pipeline descriptor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Pipeline name, unique within an engine
    pub name: String,

    /// Event producers; at least one
    pub sources: Vec<ComponentSpec>,

    /// Ordered transformation chain; may be empty
    #[serde(default)]
    pub processors: Vec<ComponentSpec>,

    /// Batch consumers; at least one
    pub sinks: Vec<ComponentSpec>,

    /// Flush a per-source batch at this many events
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Flush a non-empty batch after this many seconds
    #[serde(default = "default_batch_timeout")]
    pub batch_timeout: f64,

    /// Bound of the per-source event channel between reader and driver
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

fn default_batch_size() -> usize {
    100
}

fn default_batch_timeout() -> f64 {
    5.0
}

fn default_channel_capacity() -> usize {
    8
}

impl PipelineConfig {
    /// The batch timeout as a [`Duration`]. A zero timeout flushes
    /// after every event.
    pub fn batch_timeout_duration(&self) -> Duration {
        Duration::from_secs_f64(self.batch_timeout.max(0.0))
    }
}

/// Load and validate a pipeline configuration file.
pub fn load_config_file(path: impl AsRef<Path>) -> Result<PipelineConfig, ConfigError> {
    let path = path.as_ref();
    if !path.exists() {
        return Err(ConfigError::FileNotFound(path.to_path_buf()));
    }

    let text = std::fs::read_to_string(path).map_err(|e| ConfigError::Parse {
        path: path.to_path_buf(),
        message: e.to_string(),
    })?;

    let raw: Value = serde_yaml::from_str(&text).map_err(|e| ConfigError::Parse {
        path: path.to_path_buf(),
        message: e.to_string(),
    })?;

    validate_pipeline_value(&raw)?;

    serde_yaml::from_value(raw).map_err(|e| ConfigError::Parse {
        path: path.to_path_buf(),
        message: e.to_string(),
    })
}

/// Shape-check a raw pipeline document.
///
/// Failures identify the offending item by role and index so a
/// multi-component file can be corrected without guesswork.
pub fn validate_pipeline_value(raw: &Value) -> Result<(), ConfigError> {
    let mapping = raw
        .as_mapping()
        .ok_or_else(|| ConfigError::invalid("pipeline configuration must be a mapping"))?;

    if !mapping.contains_key("name") {
        return Err(ConfigError::MissingKey("name"));
    }
    let sources = mapping.get("sources").ok_or(ConfigError::MissingKey("sources"))?;
    let sinks = mapping.get("sinks").ok_or(ConfigError::MissingKey("sinks"))?;

    validate_component_list(sources, "source", true)?;
    if let Some(processors) = mapping.get("processors") {
        validate_component_list(processors, "processor", false)?;
    }
    validate_component_list(sinks, "sink", true)?;

    Ok(())
}

fn validate_component_list(
    value: &Value,
    role: &str,
    require_non_empty: bool,
) -> Result<(), ConfigError> {
    let items = value
        .as_sequence()
        .ok_or_else(|| ConfigError::Invalid(format!("{}s must be a list", role)))?;

    if require_non_empty && items.is_empty() {
        return Err(ConfigError::Invalid(format!(
            "at least one {} must be configured",
            role
        )));
    }

    for (index, item) in items.iter().enumerate() {
        let mapping = item.as_mapping().ok_or_else(|| {
            ConfigError::Invalid(format!("invalid {} configuration at index {}", role, index))
        })?;

        if !mapping.get("name").map(Value::is_string).unwrap_or(false) {
            return Err(ConfigError::Invalid(format!(
                "{} at index {} is missing a name",
                role, index
            )));
        }
        if !mapping.get("type").map(Value::is_string).unwrap_or(false) {
            return Err(ConfigError::Invalid(format!(
                "{} at index {} is missing a type",
                role, index
            )));
        }
        if !mapping.get("config").map(Value::is_mapping).unwrap_or(false) {
            return Err(ConfigError::Invalid(format!(
                "{} at index {} is missing a valid config",
                role, index
            )));
        }
    }

    Ok(())
}

/// Deserialize a component option mapping into its typed options
/// struct, rejecting malformed shapes with the component's name in
/// the message.
pub fn parse_options<T: serde::de::DeserializeOwned>(
    component: &str,
    options: &Value,
) -> Result<T, ConfigError> {
    serde_yaml::from_value(options.clone())
        .map_err(|e| ConfigError::Invalid(format!("{}: {}", component, e)))
}

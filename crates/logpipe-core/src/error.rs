//! Error types for pipeline configuration and validation.

use std::path::PathBuf;

/// Errors raised while loading, validating, or applying configuration
///
/// Every component's `configure` returns this type so that a bad
/// option surfaces before the pipeline starts. Runtime failures use
/// `anyhow::Error` instead and are accounted by the pipeline.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The configuration file does not exist on disk
    #[error("configuration file not found: {0}")]
    FileNotFound(PathBuf),

    /// The file exists but is not parseable YAML (or not a mapping)
    #[error("error parsing {path}: {message}")]
    Parse { path: PathBuf, message: String },

    /// A required top-level key is absent
    #[error("missing required configuration key: {0}")]
    MissingKey(&'static str),

    /// A type tag that no registered constructor answers to
    #[error("unknown {role} type: {tag}")]
    UnknownComponent { role: &'static str, tag: String },

    /// Anything else: malformed items, bad option shapes, unavailable
    /// external resources discovered at configure time
    #[error("{0}")]
    Invalid(String),
}

impl ConfigError {
    /// Shorthand used by components rejecting their option mapping.
    pub fn invalid(message: impl Into<String>) -> Self {
        ConfigError::Invalid(message.into())
    }
}

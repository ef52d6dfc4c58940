//! Local file sink.

use std::path::PathBuf;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use logpipe_core::{parse_options, ConfigError, LogEvent, Sink};

use crate::encode::{encode_event, Format};

#[derive(Debug, Deserialize)]
struct FileSinkOptions {
    path: Option<PathBuf>,
    #[serde(default)]
    format: Format,
    #[serde(default = "default_true")]
    append: bool,
    #[serde(default = "default_template")]
    template: String,
    #[serde(default = "default_message_field")]
    message_field: String,
}

fn default_true() -> bool {
    true
}

fn default_template() -> String {
    "{timestamp} {message}".to_string()
}

fn default_message_field() -> String {
    "message".to_string()
}

/// Sink appending events to a file as JSON lines or templated text.
///
/// The destination handle is opened at configure time (parent
/// directories created as needed) and flushed after every batch.
pub struct FileSink {
    name: String,
    format: Format,
    template: String,
    message_field: String,
    file: Mutex<Option<File>>,
}

impl FileSink {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            format: Format::Json,
            template: default_template(),
            message_field: default_message_field(),
            file: Mutex::new(None),
        }
    }
}

#[async_trait]
impl Sink for FileSink {
    fn name(&self) -> &str {
        &self.name
    }

    async fn configure(&mut self, options: &serde_yaml::Value) -> Result<(), ConfigError> {
        let opts: FileSinkOptions = parse_options("file sink", options)?;
        let path = opts
            .path
            .filter(|p| !p.as_os_str().is_empty())
            .ok_or_else(|| ConfigError::invalid("file sink: path is required"))?;

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    ConfigError::Invalid(format!("file sink: creating {}: {}", parent.display(), e))
                })?;
            }
        }

        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .append(opts.append)
            .truncate(!opts.append)
            .open(&path)
            .await
            .map_err(|e| {
                ConfigError::Invalid(format!("file sink: opening {}: {}", path.display(), e))
            })?;

        self.format = opts.format;
        self.template = opts.template;
        self.message_field = opts.message_field;
        *self.file.get_mut() = Some(file);
        Ok(())
    }

    async fn write(&self, batch: &[LogEvent]) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }

        let mut guard = self.file.lock().await;
        let file = guard
            .as_mut()
            .context("file sink used before configure")?;

        for event in batch {
            let mut line = encode_event(event, self.format, &self.template, &self.message_field);
            line.push('\n');
            file.write_all(line.as_bytes()).await?;
        }
        file.flush().await?;
        Ok(())
    }

    async fn release(&self) -> Result<()> {
        let mut guard = self.file.lock().await;
        if let Some(mut file) = guard.take() {
            file.flush().await?;
        }
        Ok(())
    }
}

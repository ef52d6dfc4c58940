//! Object-store sink.
//!
//! Buffers encoded lines in memory and flushes them as one object
//! once the buffer crosses `buffer_size` bytes, with a final flush at
//! release. Object keys are dated:
//! `PREFIX/yyyy/MM/dd/HH/logs_YYYYMMDDHHMMSS_COUNTER.log`.

use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use object_store::aws::AmazonS3Builder;
use object_store::{path::Path as ObjectPath, ObjectStore};
use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::debug;

use logpipe_core::{parse_options, ConfigError, LogEvent, Sink};

use crate::encode::{encode_event, Format};

const DEFAULT_BUFFER_SIZE: usize = 10 * 1024 * 1024;

#[derive(Debug, Deserialize)]
struct S3SinkOptions {
    bucket: Option<String>,
    #[serde(default)]
    key_prefix: String,
    #[serde(default = "default_region")]
    region: String,
    #[serde(default)]
    access_key: Option<String>,
    #[serde(default)]
    secret_key: Option<String>,
    #[serde(default)]
    endpoint: Option<String>,
    #[serde(default)]
    format: Format,
    #[serde(default = "default_template")]
    template: String,
    #[serde(default = "default_message_field")]
    message_field: String,
    #[serde(default = "default_buffer_size")]
    buffer_size: usize,
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_template() -> String {
    "{timestamp} {message}".to_string()
}

fn default_message_field() -> String {
    "message".to_string()
}

fn default_buffer_size() -> usize {
    DEFAULT_BUFFER_SIZE
}

#[derive(Default)]
struct Buffer {
    bytes: Vec<u8>,
    objects_written: u64,
}

/// Sink accumulating encoded events into S3 objects.
pub struct S3Sink {
    name: String,
    key_prefix: String,
    format: Format,
    template: String,
    message_field: String,
    buffer_size: usize,
    store: Option<Arc<dyn ObjectStore>>,
    buffer: Mutex<Buffer>,
}

impl S3Sink {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            key_prefix: String::new(),
            format: Format::Json,
            template: default_template(),
            message_field: default_message_field(),
            buffer_size: DEFAULT_BUFFER_SIZE,
            store: None,
            buffer: Mutex::new(Buffer::default()),
        }
    }

    /// Dated key for the buffered object about to be written.
    fn object_key(&self, counter: u64) -> ObjectPath {
        let now = Utc::now();
        let dated = format!(
            "{}/logs_{}_{}.log",
            now.format("%Y/%m/%d/%H"),
            now.format("%Y%m%d%H%M%S"),
            counter
        );
        if self.key_prefix.is_empty() {
            ObjectPath::from(dated)
        } else {
            ObjectPath::from(format!("{}/{}", self.key_prefix.trim_end_matches('/'), dated))
        }
    }

    async fn flush_buffer(&self, buffer: &mut Buffer) -> Result<()> {
        if buffer.bytes.is_empty() {
            return Ok(());
        }
        let store = self
            .store
            .as_ref()
            .context("s3 sink used before configure")?;

        let key = self.object_key(buffer.objects_written);
        let payload = Bytes::from(std::mem::take(&mut buffer.bytes));
        store.put(&key, payload).await?;
        buffer.objects_written += 1;
        debug!(sink = %self.name, key = %key, "flushed buffered events");
        Ok(())
    }
}

#[async_trait]
impl Sink for S3Sink {
    fn name(&self) -> &str {
        &self.name
    }

    async fn configure(&mut self, options: &serde_yaml::Value) -> Result<(), ConfigError> {
        let opts: S3SinkOptions = parse_options("s3 sink", options)?;
        let bucket = opts
            .bucket
            .filter(|b| !b.is_empty())
            .ok_or_else(|| ConfigError::invalid("s3 sink: bucket is required"))?;

        let mut builder = AmazonS3Builder::new()
            .with_bucket_name(&bucket)
            .with_region(&opts.region);
        if let (Some(access_key), Some(secret_key)) = (&opts.access_key, &opts.secret_key) {
            builder = builder
                .with_access_key_id(access_key)
                .with_secret_access_key(secret_key);
        }
        if let Some(endpoint) = &opts.endpoint {
            builder = builder.with_endpoint(endpoint).with_allow_http(true);
        }
        let store = builder
            .build()
            .map_err(|e| ConfigError::Invalid(format!("s3 sink: {}", e)))?;

        self.key_prefix = opts.key_prefix;
        self.format = opts.format;
        self.template = opts.template;
        self.message_field = opts.message_field;
        self.buffer_size = opts.buffer_size.max(1);
        self.store = Some(Arc::new(store));
        Ok(())
    }

    async fn write(&self, batch: &[LogEvent]) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }

        let mut buffer = self.buffer.lock().await;
        for event in batch {
            let line = encode_event(event, self.format, &self.template, &self.message_field);
            buffer.bytes.extend_from_slice(line.as_bytes());
            buffer.bytes.push(b'\n');
        }

        if buffer.bytes.len() >= self.buffer_size {
            self.flush_buffer(&mut buffer).await?;
        }
        Ok(())
    }

    async fn release(&self) -> Result<()> {
        let mut buffer = self.buffer.lock().await;
        if self.store.is_some() {
            self.flush_buffer(&mut buffer).await?;
        }
        Ok(())
    }
}

//! Object-store polling source.
//!
//! Lists a bucket under a key prefix on an interval and processes
//! each previously-unseen object line by line. Seen keys are held
//! only in memory, so a restarted pipeline re-enumerates and
//! re-processes the whole prefix.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::StreamExt;
use object_store::aws::AmazonS3Builder;
use object_store::{path::Path as ObjectPath, ObjectStore};
use serde::Deserialize;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use logpipe_core::{parse_options, ConfigError, EventTx, LogEvent, Source};

#[derive(Debug, Deserialize)]
struct S3SourceOptions {
    bucket: Option<String>,
    #[serde(default)]
    prefix: String,
    #[serde(default = "default_region")]
    region: String,
    #[serde(default)]
    access_key: Option<String>,
    #[serde(default)]
    secret_key: Option<String>,
    #[serde(default)]
    endpoint: Option<String>,
    #[serde(default = "default_poll_interval")]
    poll_interval: f64,
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_poll_interval() -> f64 {
    60.0
}

/// Source reading objects from an S3-compatible store.
pub struct S3Source {
    name: String,
    bucket: String,
    prefix: String,
    region: String,
    poll_interval: Duration,
    seen_keys: HashSet<String>,
    store: Option<Arc<dyn ObjectStore>>,
}

impl S3Source {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            bucket: String::new(),
            prefix: String::new(),
            region: default_region(),
            poll_interval: Duration::from_secs(60),
            seen_keys: HashSet::new(),
            store: None,
        }
    }

    async fn emit_object(
        &mut self,
        store: &Arc<dyn ObjectStore>,
        key: &str,
        tx: &EventTx,
        cancel: &CancellationToken,
    ) -> Result<bool> {
        let location = ObjectPath::from(key);
        let data = match store.get(&location).await {
            Ok(result) => result.bytes().await?,
            Err(e) => {
                // One unreadable object should not stall the prefix.
                warn!(source = %self.name, key, error = %e, "failed to fetch object");
                return Ok(true);
            }
        };

        let text = String::from_utf8_lossy(&data);
        for line in text.lines() {
            if cancel.is_cancelled() {
                return Ok(false);
            }
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }

            let mut event = LogEvent::new(
                trimmed,
                "s3",
                format!("s3://{}/{}", self.bucket, key),
            );
            event.add_metadata("s3_bucket", json!(self.bucket));
            event.add_metadata("s3_key", json!(key));
            event.add_metadata("s3_region", json!(self.region));

            if tx.send(event).await.is_err() {
                return Ok(false);
            }
        }

        self.seen_keys.insert(key.to_string());
        Ok(true)
    }
}

#[async_trait]
impl Source for S3Source {
    fn name(&self) -> &str {
        &self.name
    }

    async fn configure(&mut self, options: &serde_yaml::Value) -> Result<(), ConfigError> {
        let opts: S3SourceOptions = parse_options("s3 source", options)?;
        let bucket = opts
            .bucket
            .filter(|b| !b.is_empty())
            .ok_or_else(|| ConfigError::invalid("s3 source: bucket is required"))?;

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
            .map_err(|e| ConfigError::Invalid(format!("s3 source: {}", e)))?;

        self.bucket = bucket;
        self.prefix = opts.prefix;
        self.region = opts.region;
        self.poll_interval = Duration::from_secs_f64(opts.poll_interval.max(0.0));
        self.store = Some(Arc::new(store));
        Ok(())
    }

    async fn read(&mut self, tx: EventTx, cancel: CancellationToken) -> Result<()> {
        let store = self
            .store
            .clone()
            .context("s3 source used before configure")?;

        while !cancel.is_cancelled() {
            let prefix = (!self.prefix.is_empty()).then(|| ObjectPath::from(self.prefix.clone()));
            let mut listing = store.list(prefix.as_ref());

            let mut new_keys = Vec::new();
            while let Some(entry) = listing.next().await {
                let meta = entry?;
                let key = meta.location.to_string();
                if !self.seen_keys.contains(&key) {
                    new_keys.push(key);
                }
            }
            drop(listing);

            for key in new_keys {
                if cancel.is_cancelled() {
                    return Ok(());
                }
                if !self.emit_object(&store, &key, &tx, &cancel).await? {
                    return Ok(());
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }
        Ok(())
    }

    fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    async fn release(&mut self) -> Result<()> {
        self.store = None;
        Ok(())
    }
}

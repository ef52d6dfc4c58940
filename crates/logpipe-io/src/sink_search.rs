//! Search-cluster bulk sink (Elasticsearch / OpenSearch).

use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::json;
use tracing::warn;

use logpipe_core::{parse_options, ConfigError, LogEvent, Sink};

const INITIAL_BACKOFF: Duration = Duration::from_secs(2);
const MAX_BACKOFF: Duration = Duration::from_secs(60);
const MAX_ATTEMPTS: u32 = 3;

#[derive(Debug, Deserialize)]
struct SearchSinkOptions {
    #[serde(default)]
    hosts: Vec<String>,
    #[serde(default = "default_index")]
    index: String,
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    password: Option<String>,
    #[serde(default)]
    api_key: Option<String>,
    #[serde(default = "default_true")]
    ssl_verify: bool,
    #[serde(default = "default_chunk_size")]
    batch_size: usize,
}

fn default_index() -> String {
    "logs-{yyyy}.{MM}.{dd}".to_string()
}

fn default_true() -> bool {
    true
}

fn default_chunk_size() -> usize {
    1000
}

/// Substitute `{yyyy}`, `{MM}`, `{dd}`, `{HH}` in an index template
/// from the event timestamp.
fn format_index(template: &str, timestamp: &DateTime<Utc>) -> String {
    template
        .replace("{yyyy}", &timestamp.format("%Y").to_string())
        .replace("{MM}", &timestamp.format("%m").to_string())
        .replace("{dd}", &timestamp.format("%d").to_string())
        .replace("{HH}", &timestamp.format("%H").to_string())
}

/// Bulk-indexing sink for Elasticsearch- and OpenSearch-compatible
/// clusters.
///
/// Events become `index` actions in NDJSON bulk bodies, document id
/// equal to the event id, index name derived from the event's
/// timestamp. Failed submissions retry with doubling backoff (2 s up
/// to 60 s, three attempts), rotating through the configured hosts.
pub struct SearchSink {
    name: String,
    hosts: Vec<String>,
    index: String,
    username: Option<String>,
    password: Option<String>,
    api_key: Option<String>,
    chunk_size: usize,
    client: Option<reqwest::Client>,
}

impl SearchSink {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            hosts: Vec::new(),
            index: default_index(),
            username: None,
            password: None,
            api_key: None,
            chunk_size: default_chunk_size(),
            client: None,
        }
    }

    /// One NDJSON bulk body for a chunk of events.
    fn bulk_body(&self, events: &[LogEvent]) -> Result<String> {
        let mut body = String::new();
        for event in events {
            let action = json!({
                "index": {
                    "_index": format_index(&self.index, &event.timestamp),
                    "_id": event.id,
                }
            });
            body.push_str(&serde_json::to_string(&action)?);
            body.push('\n');
            body.push_str(&serde_json::to_string(event)?);
            body.push('\n');
        }
        Ok(body)
    }

    async fn submit(&self, host: &str, body: String) -> Result<()> {
        let client = self
            .client
            .as_ref()
            .context("search sink used before configure")?;

        let mut request = client
            .post(format!("{}/_bulk", host.trim_end_matches('/')))
            .header("content-type", "application/x-ndjson")
            .body(body);
        if let (Some(username), Some(password)) = (&self.username, &self.password) {
            request = request.basic_auth(username, Some(password));
        } else if let Some(api_key) = &self.api_key {
            request = request.header("authorization", format!("ApiKey {}", api_key));
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            bail!("bulk request returned {}", status);
        }

        let result: serde_json::Value = response.json().await?;
        if result["errors"].as_bool().unwrap_or(false) {
            let failed = result["items"]
                .as_array()
                .map(|items| {
                    items
                        .iter()
                        .filter(|item| {
                            item["index"]["status"].as_u64().unwrap_or(200) >= 300
                        })
                        .count()
                })
                .unwrap_or(0);
            warn!(sink = %self.name, failed, "bulk response reported item failures");
        }
        Ok(())
    }
}

#[async_trait]
impl Sink for SearchSink {
    fn name(&self) -> &str {
        &self.name
    }

    async fn configure(&mut self, options: &serde_yaml::Value) -> Result<(), ConfigError> {
        let opts: SearchSinkOptions = parse_options("search sink", options)?;
        if opts.hosts.is_empty() {
            return Err(ConfigError::invalid("search sink: hosts are required"));
        }

        let client = reqwest::Client::builder()
            .danger_accept_invalid_certs(!opts.ssl_verify)
            .build()
            .map_err(|e| ConfigError::Invalid(format!("search sink: {}", e)))?;

        self.hosts = opts.hosts;
        self.index = opts.index;
        self.username = opts.username;
        self.password = opts.password;
        self.api_key = opts.api_key;
        self.chunk_size = opts.batch_size.max(1);
        self.client = Some(client);
        Ok(())
    }

    async fn write(&self, batch: &[LogEvent]) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }

        for chunk in batch.chunks(self.chunk_size) {
            let body = self.bulk_body(chunk)?;

            let mut backoff = INITIAL_BACKOFF;
            let mut last_error = None;
            for attempt in 0..MAX_ATTEMPTS {
                let host = &self.hosts[attempt as usize % self.hosts.len()];
                match self.submit(host, body.clone()).await {
                    Ok(()) => {
                        last_error = None;
                        break;
                    }
                    Err(e) => {
                        warn!(sink = %self.name, host = %host, attempt = attempt + 1,
                              error = %e, "bulk submission failed");
                        last_error = Some(e);
                        if attempt + 1 < MAX_ATTEMPTS {
                            tokio::time::sleep(backoff).await;
                            backoff = (backoff * 2).min(MAX_BACKOFF);
                        }
                    }
                }
            }
            if let Some(e) = last_error {
                return Err(e);
            }
        }
        Ok(())
    }

    async fn release(&self) -> Result<()> {
        Ok(())
    }
}

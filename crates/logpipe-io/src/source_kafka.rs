//! Kafka consumer source.

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::StreamExt;
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::message::Message;
use rdkafka::ClientConfig;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use logpipe_core::{parse_options, ConfigError, EventTx, LogEvent, Source};

#[derive(Debug, Deserialize)]
struct KafkaSourceOptions {
    #[serde(default)]
    brokers: Vec<String>,
    #[serde(default)]
    topics: Vec<String>,
    #[serde(default = "default_group_id")]
    group_id: String,
    #[serde(default = "default_offset_reset")]
    auto_offset_reset: String,
    #[serde(default)]
    metadata: Map<String, Value>,
}

fn default_group_id() -> String {
    "logpipe".to_string()
}

fn default_offset_reset() -> String {
    "latest".to_string()
}

/// Source consuming one or more Kafka topics under a consumer-group
/// identity with auto-committed offsets.
///
/// Each event carries the broker coordinates (`kafka_topic`,
/// `kafka_partition`, `kafka_offset`, `kafka_timestamp`, `kafka_key`)
/// plus any extra metadata configured for the source.
pub struct KafkaSource {
    name: String,
    extra_metadata: Map<String, Value>,
    consumer: Option<StreamConsumer>,
}

impl KafkaSource {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            extra_metadata: Map::new(),
            consumer: None,
        }
    }
}

#[async_trait]
impl Source for KafkaSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn configure(&mut self, options: &serde_yaml::Value) -> Result<(), ConfigError> {
        let opts: KafkaSourceOptions = parse_options("kafka source", options)?;
        if opts.brokers.is_empty() {
            return Err(ConfigError::invalid("kafka source: brokers are required"));
        }
        if opts.topics.is_empty() {
            return Err(ConfigError::invalid("kafka source: topics are required"));
        }
        if !matches!(opts.auto_offset_reset.as_str(), "earliest" | "latest") {
            return Err(ConfigError::Invalid(format!(
                "kafka source: invalid auto_offset_reset: {}",
                opts.auto_offset_reset
            )));
        }

        let consumer: StreamConsumer = ClientConfig::new()
            .set("bootstrap.servers", opts.brokers.join(","))
            .set("group.id", &opts.group_id)
            .set("auto.offset.reset", &opts.auto_offset_reset)
            .set("enable.auto.commit", "true")
            .set("enable.partition.eof", "false")
            .set("session.timeout.ms", "6000")
            .create()
            .map_err(|e| ConfigError::Invalid(format!("kafka source: {}", e)))?;

        let topics: Vec<&str> = opts.topics.iter().map(String::as_str).collect();
        consumer
            .subscribe(&topics)
            .map_err(|e| ConfigError::Invalid(format!("kafka source: subscribe: {}", e)))?;

        self.extra_metadata = opts.metadata;
        self.consumer = Some(consumer);
        Ok(())
    }

    async fn read(&mut self, tx: EventTx, cancel: CancellationToken) -> Result<()> {
        let consumer = self
            .consumer
            .as_ref()
            .context("kafka source used before configure")?;
        let mut stream = consumer.stream();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                next = stream.next() => {
                    let message = match next {
                        Some(Ok(message)) => message,
                        Some(Err(e)) => {
                            warn!(source = %self.name, error = %e, "kafka consume error");
                            continue;
                        }
                        None => return Ok(()),
                    };

                    let Some(payload) = message.payload() else { continue };
                    let raw_data = String::from_utf8_lossy(payload).into_owned();
                    if raw_data.is_empty() {
                        continue;
                    }

                    let mut event = LogEvent::new(raw_data, "kafka", message.topic());
                    event.add_metadata("kafka_topic", json!(message.topic()));
                    event.add_metadata("kafka_partition", json!(message.partition()));
                    event.add_metadata("kafka_offset", json!(message.offset()));
                    event.add_metadata("kafka_timestamp", json!(message.timestamp().to_millis()));
                    event.add_metadata(
                        "kafka_key",
                        match message.key() {
                            Some(key) => json!(String::from_utf8_lossy(key)),
                            None => Value::Null,
                        },
                    );
                    for (key, value) in &self.extra_metadata {
                        event.add_metadata(key.clone(), value.clone());
                    }

                    if tx.send(event).await.is_err() {
                        return Ok(());
                    }
                }
            }
        }
    }

    async fn release(&mut self) -> Result<()> {
        if let Some(consumer) = self.consumer.take() {
            consumer.unsubscribe();
        }
        Ok(())
    }
}

//! Mock components for pipeline and engine tests.
#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use logpipe_core::{ConfigError, EventTx, LogEvent, PipelineConfig, Processor, Sink, Source};

pub fn test_config(name: &str, batch_size: usize, batch_timeout: f64) -> PipelineConfig {
    PipelineConfig {
        name: name.to_string(),
        sources: Vec::new(),
        processors: Vec::new(),
        sinks: Vec::new(),
        batch_size,
        batch_timeout,
        channel_capacity: 8,
    }
}

pub fn numbered_event(n: usize, level: &str) -> LogEvent {
    let mut event = LogEvent::new(format!("line-{}", n), "mock", "mock-source");
    event.add_field("level", json!(level));
    event.add_field("n", json!(n));
    event
}

/// Source yielding a fixed list of events, then ending.
pub struct StaticSource {
    name: String,
    events: Vec<LogEvent>,
    pub released: Arc<AtomicUsize>,
}

impl StaticSource {
    pub fn new(events: Vec<LogEvent>) -> Self {
        Self {
            name: "static-source".to_string(),
            events,
            released: Arc::new(AtomicUsize::new(0)),
        }
    }
}

#[async_trait]
impl Source for StaticSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn configure(&mut self, _options: &serde_yaml::Value) -> Result<(), ConfigError> {
        Ok(())
    }

    async fn read(&mut self, tx: EventTx, cancel: CancellationToken) -> Result<()> {
        for event in std::mem::take(&mut self.events) {
            if cancel.is_cancelled() || tx.send(event).await.is_err() {
                break;
            }
        }
        Ok(())
    }

    async fn release(&mut self) -> Result<()> {
        self.released.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Source yielding a fixed list of events, then staying open until
/// cancelled. Lets batch-timeout behavior be observed.
pub struct TricklingSource {
    name: String,
    events: Vec<LogEvent>,
    pub released: Arc<AtomicUsize>,
}

impl TricklingSource {
    pub fn new(events: Vec<LogEvent>) -> Self {
        Self {
            name: "trickling-source".to_string(),
            events,
            released: Arc::new(AtomicUsize::new(0)),
        }
    }
}

#[async_trait]
impl Source for TricklingSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn configure(&mut self, _options: &serde_yaml::Value) -> Result<(), ConfigError> {
        Ok(())
    }

    async fn read(&mut self, tx: EventTx, cancel: CancellationToken) -> Result<()> {
        for event in std::mem::take(&mut self.events) {
            if cancel.is_cancelled() || tx.send(event).await.is_err() {
                return Ok(());
            }
        }
        cancel.cancelled().await;
        Ok(())
    }

    async fn release(&mut self) -> Result<()> {
        self.released.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Source producing numbered events as fast as downstream accepts
/// them, counting what it managed to emit.
pub struct FirehoseSource {
    name: String,
    pub emitted: Arc<AtomicUsize>,
}

impl FirehoseSource {
    pub fn new() -> Self {
        Self {
            name: "firehose-source".to_string(),
            emitted: Arc::new(AtomicUsize::new(0)),
        }
    }
}

#[async_trait]
impl Source for FirehoseSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn configure(&mut self, _options: &serde_yaml::Value) -> Result<(), ConfigError> {
        Ok(())
    }

    async fn read(&mut self, tx: EventTx, cancel: CancellationToken) -> Result<()> {
        let mut n = 0;
        loop {
            if cancel.is_cancelled() {
                return Ok(());
            }
            let event = numbered_event(n, "INFO");
            if tx.send(event).await.is_err() {
                return Ok(());
            }
            self.emitted.fetch_add(1, Ordering::SeqCst);
            n += 1;
        }
    }

    async fn release(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Source that fails its first read attempt, then yields its events.
pub struct FlakySource {
    name: String,
    events: Vec<LogEvent>,
    attempts: usize,
}

impl FlakySource {
    pub fn new(events: Vec<LogEvent>) -> Self {
        Self {
            name: "flaky-source".to_string(),
            events,
            attempts: 0,
        }
    }
}

#[async_trait]
impl Source for FlakySource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn configure(&mut self, _options: &serde_yaml::Value) -> Result<(), ConfigError> {
        Ok(())
    }

    async fn read(&mut self, tx: EventTx, cancel: CancellationToken) -> Result<()> {
        self.attempts += 1;
        if self.attempts == 1 {
            bail!("transient read failure");
        }
        for event in std::mem::take(&mut self.events) {
            if cancel.is_cancelled() || tx.send(event).await.is_err() {
                break;
            }
        }
        Ok(())
    }

    fn poll_interval(&self) -> Duration {
        Duration::from_millis(10)
    }

    async fn release(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Processor failing on events whose `n` field matches.
pub struct FailOnProcessor {
    name: String,
    fail_on: usize,
    pub released: Arc<AtomicUsize>,
}

impl FailOnProcessor {
    pub fn new(fail_on: usize) -> Self {
        Self {
            name: "fail-on-processor".to_string(),
            fail_on,
            released: Arc::new(AtomicUsize::new(0)),
        }
    }
}

#[async_trait]
impl Processor for FailOnProcessor {
    fn name(&self) -> &str {
        &self.name
    }

    async fn configure(&mut self, _options: &serde_yaml::Value) -> Result<(), ConfigError> {
        Ok(())
    }

    async fn process(&self, event: LogEvent) -> Result<Option<LogEvent>> {
        if event.fields.get("n") == Some(&json!(self.fail_on)) {
            bail!("boom on event {}", self.fail_on);
        }
        Ok(Some(event))
    }

    async fn release(&self) -> Result<()> {
        self.released.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Sink collecting every event it is handed.
pub struct CollectingSink {
    name: String,
    pub events: Arc<Mutex<Vec<LogEvent>>>,
    pub writes: Arc<AtomicUsize>,
    pub released: Arc<AtomicUsize>,
}

impl CollectingSink {
    pub fn new() -> Self {
        Self {
            name: "collecting-sink".to_string(),
            events: Arc::new(Mutex::new(Vec::new())),
            writes: Arc::new(AtomicUsize::new(0)),
            released: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn raw_lines(&self) -> Vec<String> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .map(|event| event.raw_data.clone())
            .collect()
    }
}

#[async_trait]
impl Sink for CollectingSink {
    fn name(&self) -> &str {
        &self.name
    }

    async fn configure(&mut self, _options: &serde_yaml::Value) -> Result<(), ConfigError> {
        Ok(())
    }

    async fn write(&self, batch: &[LogEvent]) -> Result<()> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.events.lock().unwrap().extend(batch.iter().cloned());
        Ok(())
    }

    async fn release(&self) -> Result<()> {
        self.released.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Sink that takes a fixed time per write.
pub struct SlowSink {
    name: String,
    delay: Duration,
    pub writes: Arc<AtomicUsize>,
    pub largest_batch: Arc<AtomicUsize>,
}

impl SlowSink {
    pub fn new(delay: Duration) -> Self {
        Self {
            name: "slow-sink".to_string(),
            delay,
            writes: Arc::new(AtomicUsize::new(0)),
            largest_batch: Arc::new(AtomicUsize::new(0)),
        }
    }
}

#[async_trait]
impl Sink for SlowSink {
    fn name(&self) -> &str {
        &self.name
    }

    async fn configure(&mut self, _options: &serde_yaml::Value) -> Result<(), ConfigError> {
        Ok(())
    }

    async fn write(&self, batch: &[LogEvent]) -> Result<()> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.largest_batch.fetch_max(batch.len(), Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        Ok(())
    }

    async fn release(&self) -> Result<()> {
        Ok(())
    }
}

/// Sink whose every write fails.
pub struct FailingSink {
    name: String,
    pub released: Arc<AtomicUsize>,
}

impl FailingSink {
    pub fn new() -> Self {
        Self {
            name: "failing-sink".to_string(),
            released: Arc::new(AtomicUsize::new(0)),
        }
    }
}

#[async_trait]
impl Sink for FailingSink {
    fn name(&self) -> &str {
        &self.name
    }

    async fn configure(&mut self, _options: &serde_yaml::Value) -> Result<(), ConfigError> {
        Ok(())
    }

    async fn write(&self, _batch: &[LogEvent]) -> Result<()> {
        bail!("destination unavailable")
    }

    async fn release(&self) -> Result<()> {
        self.released.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Poll until `predicate` holds or the deadline passes.
pub async fn wait_for(predicate: impl Fn() -> bool, deadline: Duration) -> bool {
    let start = tokio::time::Instant::now();
    while start.elapsed() < deadline {
        if predicate() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    predicate()
}

//! Structured Windows event log source.
//!
//! Consumes winlogbeat-shaped JSON lines from a single file, a
//! directory scanned in modification order, or a TCP listener, and
//! applies channel/level/event-id/provider filters before an event
//! enters the pipeline.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use logpipe_core::{parse_options, ConfigError, EventTx, LogEvent, Source};

#[derive(Debug, Clone, Copy, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
enum WinlogMode {
    File,
    Directory,
    Tcp,
}

#[derive(Debug, Deserialize)]
struct WinlogOptions {
    #[serde(default = "default_mode")]
    mode: WinlogMode,
    #[serde(default)]
    path: Option<PathBuf>,
    #[serde(default = "default_channels")]
    channels: Vec<String>,
    #[serde(default)]
    level: Option<i64>,
    #[serde(default)]
    event_ids: Vec<i64>,
    #[serde(default)]
    providers: Vec<String>,
    #[serde(default = "default_poll_interval")]
    poll_interval: f64,
    #[serde(default = "default_true")]
    tail: bool,
    #[serde(default = "default_host")]
    host: String,
    #[serde(default = "default_port")]
    port: u16,
}

fn default_mode() -> WinlogMode {
    WinlogMode::File
}

fn default_channels() -> Vec<String> {
    vec![
        "Application".to_string(),
        "System".to_string(),
        "Security".to_string(),
    ]
}

fn default_poll_interval() -> f64 {
    10.0
}

fn default_true() -> bool {
    true
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    5044
}

/// Filter settings and event mapping shared by the per-connection
/// tasks of tcp mode.
struct EventMapper {
    channels: Vec<String>,
    level: Option<i64>,
    event_ids: Vec<i64>,
    providers: Vec<String>,
    mode_tag: &'static str,
}

fn as_int(value: Option<&Value>) -> Option<i64> {
    match value? {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

impl EventMapper {
    /// Apply channel, level, event-id, and provider filters.
    fn accepts(&self, data: &Value) -> bool {
        let winlog = &data["winlog"];

        if !self.channels.is_empty() {
            match winlog["channel"].as_str() {
                Some(channel) if self.channels.iter().any(|c| c == channel) => {}
                _ => return false,
            }
        }

        if let Some(minimum) = self.level {
            match as_int(winlog.get("level")) {
                Some(level) if level >= minimum => {}
                _ => return false,
            }
        }

        if !self.event_ids.is_empty() {
            match as_int(winlog.get("event_id")) {
                Some(id) if self.event_ids.contains(&id) => {}
                _ => return false,
            }
        }

        if !self.providers.is_empty() {
            match winlog["provider"]["name"].as_str() {
                Some(provider) if self.providers.iter().any(|p| p == provider) => {}
                _ => return false,
            }
        }

        true
    }

    /// Map one accepted winlog JSON document to a pipeline event.
    fn build_event(&self, line: &str, data: &Value) -> LogEvent {
        let winlog = &data["winlog"];
        let channel = winlog["channel"].as_str().unwrap_or("unknown");

        let mut event = LogEvent::new(line, "winlog", channel);
        if let Some(stamp) = data["@timestamp"].as_str() {
            if let Ok(parsed) = DateTime::parse_from_rfc3339(stamp) {
                event.timestamp = parsed.with_timezone(&Utc);
            }
        }

        event.add_field("event_id", winlog.get("event_id").cloned().unwrap_or(Value::Null));
        event.add_field("level", winlog.get("level").cloned().unwrap_or(Value::Null));
        event.add_field(
            "provider",
            winlog["provider"].get("name").cloned().unwrap_or(Value::Null),
        );
        event.add_field(
            "computer_name",
            winlog.get("computer_name").cloned().unwrap_or(Value::Null),
        );
        event.add_field("record_id", winlog.get("record_id").cloned().unwrap_or(Value::Null));
        event.add_field("task", winlog.get("task").cloned().unwrap_or(Value::Null));
        event.add_field("keywords", winlog.get("keywords").cloned().unwrap_or(Value::Null));
        event.add_field("message", data.get("message").cloned().unwrap_or(Value::Null));
        event.add_field("host", data.get("host").cloned().unwrap_or(json!({})));
        if let Some(event_data) = winlog.get("event_data") {
            event.add_field("event_data", event_data.clone());
        }
        if let Some(user) = winlog.get("user") {
            event.add_field("user", user.clone());
        }

        event.add_metadata("winlog_source", json!(self.mode_tag));
        event.add_metadata("winlog_channel", json!(channel));
        event
    }

    /// Parse a raw line; `None` when it is not an accepted winlog
    /// document.
    fn map_line(&self, line: &str) -> Option<LogEvent> {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return None;
        }
        let data: Value = serde_json::from_str(trimmed).ok()?;
        if data.get("winlog").is_none() || !self.accepts(&data) {
            return None;
        }
        Some(self.build_event(trimmed, &data))
    }
}

/// Source for winlogbeat-shaped structured event streams.
pub struct WinlogSource {
    name: String,
    mode: WinlogMode,
    path: PathBuf,
    poll_interval: Duration,
    tail: bool,
    host: String,
    port: u16,
    mapper: Arc<EventMapper>,
    processed_files: HashSet<PathBuf>,
}

impl WinlogSource {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            mode: WinlogMode::File,
            path: PathBuf::new(),
            poll_interval: Duration::from_secs(10),
            tail: true,
            host: default_host(),
            port: default_port(),
            mapper: Arc::new(EventMapper {
                channels: default_channels(),
                level: None,
                event_ids: Vec::new(),
                providers: Vec::new(),
                mode_tag: "file",
            }),
            processed_files: HashSet::new(),
        }
    }

    /// Read one JSON-lines file. In tail mode this keeps waiting for
    /// more data at end of file; otherwise it returns at EOF.
    async fn read_file(
        &self,
        path: &PathBuf,
        follow: bool,
        tx: &EventTx,
        cancel: &CancellationToken,
    ) -> Result<bool> {
        let file = tokio::fs::File::open(path).await?;
        let mut reader = BufReader::new(file);
        let mut line = String::new();

        loop {
            if cancel.is_cancelled() {
                return Ok(false);
            }
            line.clear();
            let read = reader.read_line(&mut line).await?;
            if read == 0 {
                if !follow {
                    return Ok(true);
                }
                tokio::select! {
                    _ = cancel.cancelled() => return Ok(false),
                    _ = tokio::time::sleep(self.poll_interval) => continue,
                }
            }

            if let Some(event) = self.mapper.map_line(&line) {
                if tx.send(event).await.is_err() {
                    return Ok(false);
                }
            }
        }
    }

    /// Process every file in the directory in modification order,
    /// each exactly once, then poll for newcomers.
    async fn scan_directory(&mut self, tx: &EventTx, cancel: &CancellationToken) -> Result<()> {
        while !cancel.is_cancelled() {
            let mut entries: Vec<(std::time::SystemTime, PathBuf)> = Vec::new();
            let mut dir = tokio::fs::read_dir(&self.path).await?;
            while let Some(entry) = dir.next_entry().await? {
                let meta = entry.metadata().await?;
                if meta.is_file() {
                    let modified = meta.modified().unwrap_or(std::time::UNIX_EPOCH);
                    entries.push((modified, entry.path()));
                }
            }
            entries.sort();

            for (_, path) in entries {
                if self.processed_files.contains(&path) {
                    continue;
                }
                match self.read_file(&path, false, tx, cancel).await {
                    Ok(true) => {
                        self.processed_files.insert(path);
                    }
                    Ok(false) => return Ok(()),
                    Err(e) => {
                        warn!(source = %self.name, path = %path.display(), error = %e,
                              "failed to read event file");
                    }
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }
        Ok(())
    }

    /// Accept connections and read JSON lines from each until the
    /// client disconnects or the pipeline stops.
    async fn serve_tcp(&self, tx: &EventTx, cancel: &CancellationToken) -> Result<()> {
        let listener = TcpListener::bind((self.host.as_str(), self.port)).await?;
        debug!(source = %self.name, host = %self.host, port = self.port, "winlog tcp listener ready");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                accepted = listener.accept() => {
                    let (stream, peer) = accepted?;
                    let mapper = Arc::clone(&self.mapper);
                    let tx = tx.clone();
                    let cancel = cancel.clone();
                    tokio::spawn(async move {
                        let mut reader = BufReader::new(stream);
                        let mut line = String::new();
                        loop {
                            line.clear();
                            tokio::select! {
                                _ = cancel.cancelled() => break,
                                read = reader.read_line(&mut line) => match read {
                                    Ok(0) => break,
                                    Ok(_) => {
                                        if let Some(event) = mapper.map_line(&line) {
                                            if tx.send(event).await.is_err() {
                                                break;
                                            }
                                        }
                                    }
                                    Err(e) => {
                                        warn!(peer = %peer, error = %e, "winlog client read error");
                                        break;
                                    }
                                }
                            }
                        }
                    });
                }
            }
        }
    }
}

#[async_trait]
impl Source for WinlogSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn configure(&mut self, options: &serde_yaml::Value) -> Result<(), ConfigError> {
        let opts: WinlogOptions = parse_options("winlog source", options)?;

        if let Some(level) = opts.level {
            if !(1..=5).contains(&level) {
                return Err(ConfigError::invalid(
                    "winlog source: level must be between 1 and 5",
                ));
            }
        }

        let path = match opts.mode {
            WinlogMode::Tcp => PathBuf::new(),
            _ => opts.path.clone().ok_or_else(|| {
                ConfigError::invalid("winlog source: path is required for file or directory mode")
            })?,
        };
        match opts.mode {
            WinlogMode::File if !path.is_file() => {
                return Err(ConfigError::Invalid(format!(
                    "winlog source: file not found: {}",
                    path.display()
                )));
            }
            WinlogMode::Directory if !path.is_dir() => {
                return Err(ConfigError::Invalid(format!(
                    "winlog source: directory not found: {}",
                    path.display()
                )));
            }
            _ => {}
        }

        self.mapper = Arc::new(EventMapper {
            channels: opts.channels,
            level: opts.level,
            event_ids: opts.event_ids,
            providers: opts.providers,
            mode_tag: match opts.mode {
                WinlogMode::File => "file",
                WinlogMode::Directory => "directory",
                WinlogMode::Tcp => "tcp",
            },
        });
        self.mode = opts.mode;
        self.path = path;
        self.poll_interval = Duration::from_secs_f64(opts.poll_interval.max(0.0));
        self.tail = opts.tail;
        self.host = opts.host;
        self.port = opts.port;
        Ok(())
    }

    async fn read(&mut self, tx: EventTx, cancel: CancellationToken) -> Result<()> {
        match self.mode {
            WinlogMode::File => {
                let path = self.path.clone();
                self.read_file(&path, self.tail, &tx, &cancel).await?;
                Ok(())
            }
            WinlogMode::Directory => self.scan_directory(&tx, &cancel).await,
            WinlogMode::Tcp => self.serve_tcp(&tx, &cancel).await,
        }
    }

    fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    async fn release(&mut self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn sample_line(channel: &str, level: i64, event_id: i64, provider: &str) -> String {
        json!({
            "@timestamp": "2024-05-01T10:00:00Z",
            "message": "logon",
            "host": {"name": "host-1"},
            "winlog": {
                "channel": channel,
                "level": level,
                "event_id": event_id,
                "provider": {"name": provider},
                "computer_name": "HOST-1",
                "record_id": 9,
                "task": "Logon",
                "keywords": ["Audit Success"],
                "event_data": {"TargetUserName": "alice"}
            }
        })
        .to_string()
    }

    fn mapper(yaml: &str) -> Arc<EventMapper> {
        let mut source = WinlogSource::new("winlog");
        let options: serde_yaml::Value = serde_yaml::from_str(yaml).unwrap();
        futures::executor::block_on(source.configure(&options)).unwrap();
        source.mapper
    }

    #[tokio::test]
    async fn file_mode_reads_and_filters() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.jsonl");
        let lines = [
            sample_line("Security", 4, 4624, "Microsoft-Windows-Security-Auditing"),
            sample_line("Ignored", 4, 1, "Other"),
            "not json at all".to_string(),
        ];
        std::fs::write(&path, lines.join("\n") + "\n").unwrap();

        let mut source = WinlogSource::new("winlog");
        let options = serde_yaml::from_str(&format!(
            "{{path: {}, tail: false, channels: [Security]}}",
            path.display()
        ))
        .unwrap();
        source.configure(&options).await.unwrap();

        let (tx, mut rx) = mpsc::channel(16);
        source.read(tx, CancellationToken::new()).await.unwrap();

        let event = rx.recv().await.unwrap();
        assert_eq!(event.source_type, "winlog");
        assert_eq!(event.source_name, "Security");
        assert_eq!(event.fields["event_id"], json!(4624));
        assert_eq!(event.fields["provider"], json!("Microsoft-Windows-Security-Auditing"));
        assert_eq!(event.fields["event_data"], json!({"TargetUserName": "alice"}));
        assert_eq!(event.metadata["winlog_channel"], json!("Security"));
        assert_eq!(
            event.timestamp,
            "2024-05-01T10:00:00Z".parse::<DateTime<Utc>>().unwrap()
        );

        // The other channel and the unparseable line are filtered out.
        assert!(rx.recv().await.is_none());
    }

    #[test]
    fn level_filter_is_a_minimum() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.jsonl");
        std::fs::write(&path, "").unwrap();
        let mapper = mapper(&format!(
            "{{path: {}, channels: [Security], level: 3}}",
            path.display()
        ));

        let low: Value =
            serde_json::from_str(&sample_line("Security", 2, 1, "P")).unwrap();
        let high: Value =
            serde_json::from_str(&sample_line("Security", 4, 1, "P")).unwrap();
        assert!(!mapper.accepts(&low));
        assert!(mapper.accepts(&high));
    }

    #[test]
    fn event_id_and_provider_filters() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.jsonl");
        std::fs::write(&path, "").unwrap();
        let mapper = mapper(&format!(
            "{{path: {}, channels: [Security], event_ids: [4624], providers: [Wanted]}}",
            path.display()
        ));

        let wanted: Value =
            serde_json::from_str(&sample_line("Security", 4, 4624, "Wanted")).unwrap();
        let wrong_id: Value =
            serde_json::from_str(&sample_line("Security", 4, 1, "Wanted")).unwrap();
        let wrong_provider: Value =
            serde_json::from_str(&sample_line("Security", 4, 4624, "Other")).unwrap();
        assert!(mapper.accepts(&wanted));
        assert!(!mapper.accepts(&wrong_id));
        assert!(!mapper.accepts(&wrong_provider));
    }

    #[tokio::test]
    async fn missing_path_rejected_for_file_mode() {
        let mut source = WinlogSource::new("winlog");
        let err = source
            .configure(&serde_yaml::from_str("{}").unwrap())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("path is required"));
    }

    #[tokio::test]
    async fn level_out_of_range_rejected() {
        let mut source = WinlogSource::new("winlog");
        let err = source
            .configure(&serde_yaml::from_str("{mode: tcp, level: 9}").unwrap())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("between 1 and 5"));
    }

    #[tokio::test]
    async fn tcp_mode_maps_client_lines() {
        let mut source = WinlogSource::new("winlog");
        let options = serde_yaml::from_str(
            "{mode: tcp, host: \"127.0.0.1\", port: 0, channels: [Security]}",
        )
        .unwrap();
        source.configure(&options).await.unwrap();

        // Exercise the line mapping the connection tasks run.
        let event = source
            .mapper
            .map_line(&sample_line("Security", 4, 1, "P"))
            .unwrap();
        assert_eq!(event.metadata["winlog_source"], json!("tcp"));
    }
}

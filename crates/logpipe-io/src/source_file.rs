//! Tailing file source.
//!
//! Polls the target path, tracking a byte offset between reads.
//! Rotation shows up as an inode change, after which reading restarts
//! at offset zero on the new file. A path that does not exist yet is
//! polled silently until it appears.

use std::io::SeekFrom;
use std::os::unix::fs::MetadataExt;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, AsyncSeekExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use logpipe_core::{parse_options, ConfigError, EventTx, LogEvent, Source};

#[derive(Debug, Deserialize)]
struct FileSourceOptions {
    path: Option<PathBuf>,
    #[serde(default = "default_true")]
    tail: bool,
    #[serde(default)]
    read_from_start: bool,
    #[serde(default = "default_poll_interval")]
    poll_interval: f64,
}

fn default_true() -> bool {
    true
}

fn default_poll_interval() -> f64 {
    1.0
}

/// Source that tails a single file.
///
/// Each emitted event carries `metadata.file_path` and
/// `metadata.file_position`, the offset of the line's first byte.
/// Blank lines are discarded.
pub struct FileSource {
    name: String,
    path: PathBuf,
    tail: bool,
    poll_interval: Duration,
    position: u64,
    inode: u64,
}

impl FileSource {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            path: PathBuf::new(),
            tail: true,
            poll_interval: Duration::from_secs(1),
            position: 0,
            inode: 0,
        }
    }

    /// Read every complete line past the current offset, emitting one
    /// event per non-blank line.
    async fn drain_new_lines(&mut self, tx: &EventTx, cancel: &CancellationToken) -> Result<bool> {
        let mut file = File::open(&self.path).await?;
        file.seek(SeekFrom::Start(self.position)).await?;
        let mut reader = BufReader::new(file);
        let mut line = String::new();

        loop {
            if cancel.is_cancelled() {
                return Ok(false);
            }
            line.clear();
            let read = reader.read_line(&mut line).await?;
            if read == 0 {
                return Ok(true);
            }

            let line_start = self.position;
            self.position += read as u64;

            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }

            let mut event =
                LogEvent::new(trimmed, "file", self.path.to_string_lossy().into_owned());
            event.add_metadata("file_path", json!(self.path.to_string_lossy()));
            event.add_metadata("file_position", json!(line_start));

            if tx.send(event).await.is_err() {
                // Receiver side is gone, nothing left to produce for.
                return Ok(false);
            }
        }
    }

    async fn idle(&self, cancel: &CancellationToken) -> bool {
        tokio::select! {
            _ = cancel.cancelled() => false,
            _ = tokio::time::sleep(self.poll_interval) => true,
        }
    }
}

#[async_trait]
impl Source for FileSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn configure(&mut self, options: &serde_yaml::Value) -> Result<(), ConfigError> {
        let opts: FileSourceOptions = parse_options("file source", options)?;
        self.path = opts
            .path
            .filter(|p| !p.as_os_str().is_empty())
            .ok_or_else(|| ConfigError::invalid("file source: path is required"))?;
        self.tail = opts.tail;
        self.poll_interval = Duration::from_secs_f64(opts.poll_interval.max(0.0));

        match std::fs::metadata(&self.path) {
            Ok(meta) => {
                self.inode = meta.ino();
                self.position = if opts.read_from_start { 0 } else { meta.len() };
            }
            Err(_) => {
                // Not there yet; start from the beginning once it appears.
                self.position = 0;
                self.inode = 0;
            }
        }
        Ok(())
    }

    async fn read(&mut self, tx: EventTx, cancel: CancellationToken) -> Result<()> {
        while !cancel.is_cancelled() {
            match tokio::fs::metadata(&self.path).await {
                Ok(meta) => {
                    let inode = meta.ino();
                    if inode != self.inode {
                        debug!(path = %self.path.display(), "rotation detected, restarting at offset 0");
                        self.inode = inode;
                        self.position = 0;
                    }

                    if meta.len() > self.position
                        && !self.drain_new_lines(&tx, &cancel).await?
                    {
                        return Ok(());
                    }

                    if !self.tail {
                        return Ok(());
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }

            if !self.idle(&cancel).await {
                return Ok(());
            }
        }
        Ok(())
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
    use std::io::Write;
    use tokio::sync::mpsc;

    async fn configured(path: &std::path::Path, extra: &str) -> FileSource {
        let mut source = FileSource::new("file");
        let yaml = format!("{{path: {}{}}}", path.display(), extra);
        source
            .configure(&serde_yaml::from_str(&yaml).unwrap())
            .await
            .unwrap();
        source
    }

    #[tokio::test]
    async fn reads_lines_with_positions() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.log");
        std::fs::write(&path, "first\n\nsecond\n").unwrap();

        let mut source = configured(&path, ", read_from_start: true, tail: false").await;
        let (tx, mut rx) = mpsc::channel(16);
        source.read(tx, CancellationToken::new()).await.unwrap();

        let first = rx.recv().await.unwrap();
        assert_eq!(first.raw_data, "first");
        assert_eq!(first.metadata["file_position"], json!(0));
        assert_eq!(first.source_type, "file");

        // The blank line is skipped entirely.
        let second = rx.recv().await.unwrap();
        assert_eq!(second.raw_data, "second");
        assert_eq!(second.metadata["file_position"], json!(7));
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn default_offset_is_end_of_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.log");
        std::fs::write(&path, "already here\n").unwrap();

        let mut source = configured(&path, ", tail: false").await;
        let (tx, mut rx) = mpsc::channel(16);
        source.read(tx, CancellationToken::new()).await.unwrap();
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn rotation_restarts_at_offset_zero() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.log");
        std::fs::write(&path, "old contents that are long\n").unwrap();

        let mut source = configured(&path, ", poll_interval: 0.05").await;
        let (tx, mut rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();

        let reader_cancel = cancel.clone();
        let handle = tokio::spawn(async move { source.read(tx, reader_cancel).await });

        // Replace the file: a new inode under the same path.
        tokio::time::sleep(Duration::from_millis(120)).await;
        let replacement = dir.path().join("app.log.new");
        let mut file = std::fs::File::create(&replacement).unwrap();
        file.write_all(b"hello\n").unwrap();
        drop(file);
        std::fs::rename(&replacement, &path).unwrap();

        let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("rotation event within deadline")
            .expect("channel open");
        assert_eq!(event.raw_data, "hello");
        assert_eq!(event.metadata["file_position"], json!(0));

        cancel.cancel();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn missing_path_is_a_config_error() {
        let mut source = FileSource::new("file");
        let err = source
            .configure(&serde_yaml::from_str("{}").unwrap())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("path is required"));
    }

    #[tokio::test]
    async fn absent_file_waits_until_it_appears() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("late.log");

        let mut source = configured(&path, ", poll_interval: 0.05").await;
        let (tx, mut rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();
        let reader_cancel = cancel.clone();
        let handle = tokio::spawn(async move { source.read(tx, reader_cancel).await });

        tokio::time::sleep(Duration::from_millis(120)).await;
        std::fs::write(&path, "finally\n").unwrap();

        let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("event within deadline")
            .expect("channel open");
        assert_eq!(event.raw_data, "finally");

        cancel.cancel();
        handle.await.unwrap().unwrap();
    }
}

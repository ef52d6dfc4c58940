//! # Logpipe Core - Event Model and Component Contracts
//!
//! This crate provides the foundational types and traits for building
//! log-ingestion pipelines. It defines the uniform event record, the
//! three-phase component lifecycle, and the configuration structures
//! shared by every pipeline.
//!
//! ## Key Components
//!
//! - **Event Model**: [`LogEvent`], the record carried end-to-end
//! - **Component Traits**: [`Source`], [`Processor`], and [`Sink`]
//! - **Configuration**: YAML pipeline descriptors with indexed
//!   validation errors
//! - **Error Handling**: [`ConfigError`] for everything that should
//!   stop a pipeline from starting
//!
//! ## Lifecycle
//!
//! Every component passes through the same three phases:
//!
//! 1. `configure(options)` — validate options and acquire fail-fast
//!    resources; errors here prevent the pipeline from starting
//! 2. operate — `read` for sources, `process` for processors,
//!    `write` for sinks
//! 3. `release` — free resources; safe to call after configure even
//!    if the component never operated, and safe to call twice
//!
//! Sources push events into a bounded channel and observe a
//! [`CancellationToken`] at every suspension point; the pipeline
//! driver on the other end of the channel applies the processor
//! chain and batches events toward the sinks.

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub mod config;
pub mod error;
pub mod event;

pub use config::{load_config_file, parse_options, validate_pipeline_value};
pub use config::{ComponentSpec, PipelineConfig};
pub use error::ConfigError;
pub use event::{value_to_string, LogEvent};

/// Sender half of the per-source event channel
pub type EventTx = mpsc::Sender<LogEvent>;

/// Receiver half of the per-source event channel
pub type EventRx = mpsc::Receiver<LogEvent>;

/// Trait for event-producing components
///
/// A source turns an external origin (tailed file, broker topic,
/// object-store prefix, event stream) into a lazy sequence of
/// [`LogEvent`]s. The sequence may be infinite; it ends when the
/// origin is exhausted or the cancellation token fires.
#[async_trait]
pub trait Source: Send {
    /// Instance name from the pipeline configuration
    fn name(&self) -> &str;

    /// Validate options and acquire fail-fast resources.
    async fn configure(&mut self, options: &serde_yaml::Value) -> Result<(), ConfigError>;

    /// Produce events into `tx` until exhausted or cancelled.
    ///
    /// Every yielded event must carry a populated `source_type` and
    /// `source_name`. Sending on the bounded channel is the source's
    /// backpressure point: when downstream stalls, the source stalls.
    ///
    /// Returning `Ok` means the source is exhausted (or cancelled);
    /// returning `Err` reports a read failure, after which the
    /// pipeline waits [`Source::poll_interval`] and calls `read`
    /// again while it is still running.
    async fn read(&mut self, tx: EventTx, cancel: CancellationToken) -> Result<()>;

    /// Pacing for read-failure retries.
    fn poll_interval(&self) -> Duration {
        Duration::from_secs(1)
    }

    /// Free resources. Must tolerate a second call.
    async fn release(&mut self) -> Result<()>;
}

/// Trait for event-transforming components
///
/// Processors run sequentially in configured order, each consuming
/// one event and producing zero or one. Returning `Ok(None)` drops
/// the event; returning `Err` drops it and counts a processing
/// error. Processors never write to sinks directly.
///
/// `process` takes `&self`: a processor is read-only once configured,
/// which is what makes a single chain safe to share across the
/// per-source reader tasks of a pipeline.
#[async_trait]
pub trait Processor: Send + Sync {
    /// Instance name from the pipeline configuration
    fn name(&self) -> &str;

    /// Validate options and acquire fail-fast resources.
    async fn configure(&mut self, options: &serde_yaml::Value) -> Result<(), ConfigError>;

    /// Transform one event; `None` drops it from the pipeline.
    async fn process(&self, event: LogEvent) -> Result<Option<LogEvent>>;

    /// Free resources. Must tolerate a second call.
    async fn release(&self) -> Result<()>;
}

/// Trait for batch-consuming components
///
/// Sinks own their destination handles and whatever buffering,
/// retry, and flushing the destination needs. `write` is called
/// concurrently from multiple per-source drivers, so a sink either
/// serializes internally or is inherently concurrent-safe. A write
/// failure is reported to the pipeline but stops neither the
/// pipeline nor other sinks.
#[async_trait]
pub trait Sink: Send + Sync {
    /// Instance name from the pipeline configuration
    fn name(&self) -> &str;

    /// Validate options and acquire fail-fast resources.
    async fn configure(&mut self, options: &serde_yaml::Value) -> Result<(), ConfigError>;

    /// Deliver a batch. An empty batch is a no-op.
    async fn write(&self, batch: &[LogEvent]) -> Result<()>;

    /// Flush and free resources. Must tolerate a second call.
    async fn release(&self) -> Result<()>;
}

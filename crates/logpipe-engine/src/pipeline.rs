//! Per-pipeline runtime: reader tasks, the processor chain, batching,
//! and delivery to sinks.
//!
//! Each source gets a reader task (the source's `read` pushing into a
//! bounded channel) and a driver loop that pops events, runs the
//! processor chain, and batches toward the sinks. The bounded channel
//! plus the driver awaiting `write` before popping further is the
//! backpressure path: a slow sink stalls its source, nothing buffers
//! without bound.
//!
//! Events from one source reach every sink in source order. Ordering
//! across sources, and across sinks receiving the same batch, is not
//! guaranteed.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use logpipe_core::{
    ConfigError, EventRx, LogEvent, PipelineConfig, Processor, Sink, Source,
};

use crate::registry::Registry;

/// Monotonic pipeline counters.
///
/// `events_processed + events_dropped` equals the number of events
/// that entered the processor chain; every processor failure both
/// drops its event and counts an error.
#[derive(Debug, Default)]
pub struct PipelineMetrics {
    pub events_processed: AtomicU64,
    pub events_dropped: AtomicU64,
    pub processing_errors: AtomicU64,
}

/// Read-only snapshot served to the status surface.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineStatus {
    pub name: String,
    pub running: bool,
    pub sources: usize,
    pub processors: usize,
    pub sinks: usize,
    pub events_processed: u64,
    pub events_dropped: u64,
    pub processing_errors: u64,
    pub uptime_seconds: f64,
}

/// A named composition of sources, processors, and sinks.
///
/// Components are configured during construction; `start` spawns the
/// per-source machinery and `stop` drives the cooperative shutdown:
/// cancel, drain, tail-flush, then release every component exactly
/// once.
pub struct Pipeline {
    name: String,
    config: PipelineConfig,
    sources: Mutex<Vec<Box<dyn Source>>>,
    source_count: usize,
    processors: Arc<Vec<Box<dyn Processor>>>,
    sinks: Arc<Vec<Box<dyn Sink>>>,
    metrics: Arc<PipelineMetrics>,
    running: Arc<AtomicBool>,
    active_drivers: Arc<AtomicUsize>,
    released: AtomicBool,
    cancel: Mutex<CancellationToken>,
    tasks: tokio::sync::Mutex<Vec<JoinHandle<()>>>,
    started_at: Mutex<Option<Instant>>,
}

impl Pipeline {
    /// Instantiate and configure every component named by the
    /// descriptor, resolving type tags through the registry.
    pub async fn from_config(
        config: PipelineConfig,
        registry: &Registry,
    ) -> Result<Self, ConfigError> {
        let mut sources = Vec::with_capacity(config.sources.len());
        for spec in &config.sources {
            let mut source = registry.create_source(&spec.kind, &spec.name)?;
            source.configure(&spec.config).await?;
            sources.push(source);
        }

        let mut processors = Vec::with_capacity(config.processors.len());
        for spec in &config.processors {
            let mut processor = registry.create_processor(&spec.kind, &spec.name)?;
            processor.configure(&spec.config).await?;
            processors.push(processor);
        }

        let mut sinks = Vec::with_capacity(config.sinks.len());
        for spec in &config.sinks {
            let mut sink = registry.create_sink(&spec.kind, &spec.name)?;
            sink.configure(&spec.config).await?;
            sinks.push(sink);
        }

        info!(
            pipeline = %config.name,
            sources = sources.len(),
            processors = processors.len(),
            sinks = sinks.len(),
            "pipeline initialized"
        );
        Ok(Self::from_parts(config, sources, processors, sinks))
    }

    /// Assemble a pipeline from already-configured components.
    pub fn from_parts(
        config: PipelineConfig,
        sources: Vec<Box<dyn Source>>,
        processors: Vec<Box<dyn Processor>>,
        sinks: Vec<Box<dyn Sink>>,
    ) -> Self {
        Self {
            name: config.name.clone(),
            source_count: sources.len(),
            sources: Mutex::new(sources),
            processors: Arc::new(processors),
            sinks: Arc::new(sinks),
            metrics: Arc::new(PipelineMetrics::default()),
            running: Arc::new(AtomicBool::new(false)),
            active_drivers: Arc::new(AtomicUsize::new(0)),
            released: AtomicBool::new(false),
            cancel: Mutex::new(CancellationToken::new()),
            tasks: tokio::sync::Mutex::new(Vec::new()),
            started_at: Mutex::new(None),
            config,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn metrics(&self) -> &PipelineMetrics {
        &self.metrics
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// A pipeline that has already run its sources to completion (or
    /// been stopped) cannot be started again; the engine rebuilds it
    /// from its descriptor instead.
    pub fn is_spent(&self) -> bool {
        self.released.load(Ordering::SeqCst)
            || (self.source_count > 0 && self.sources.lock().is_empty())
    }

    /// Spawn one driver per source. A no-op when already running.
    pub async fn start(&self) {
        if self.running.swap(true, Ordering::SeqCst) {
            warn!(pipeline = %self.name, "pipeline is already running");
            return;
        }

        let sources = std::mem::take(&mut *self.sources.lock());
        let cancel = CancellationToken::new();
        *self.cancel.lock() = cancel.clone();
        *self.started_at.lock() = Some(Instant::now());

        let mut tasks = self.tasks.lock().await;
        self.active_drivers.store(sources.len(), Ordering::SeqCst);
        for source in sources {
            let driver = SourceDriver {
                pipeline: self.name.clone(),
                processors: Arc::clone(&self.processors),
                sinks: Arc::clone(&self.sinks),
                metrics: Arc::clone(&self.metrics),
                running: Arc::clone(&self.running),
                active_drivers: Arc::clone(&self.active_drivers),
                batch_size: self.config.batch_size.max(1),
                batch_timeout: self.config.batch_timeout_duration(),
                channel_capacity: self.config.channel_capacity.max(1),
            };
            tasks.push(tokio::spawn(driver.run(source, cancel.child_token())));
        }

        info!(pipeline = %self.name, "pipeline started");
    }

    /// Cooperative shutdown: flag down, cancel, join the drivers,
    /// release processors and sinks exactly once, log the summary.
    /// Safe to call repeatedly.
    pub async fn stop(&self) {
        let was_running = self.running.swap(false, Ordering::SeqCst);
        self.cancel.lock().cancel();

        let mut tasks = self.tasks.lock().await;
        for task in tasks.drain(..) {
            if let Err(e) = task.await {
                error!(pipeline = %self.name, error = %e, "driver task failed");
            }
        }
        drop(tasks);

        if !self.released.swap(true, Ordering::SeqCst) {
            // Sources a driver never took (the pipeline was stopped
            // before it started) are released here.
            let leftover = std::mem::take(&mut *self.sources.lock());
            for mut source in leftover {
                if let Err(e) = source.release().await {
                    error!(pipeline = %self.name, source = source.name(), error = %e,
                           "error releasing source");
                }
            }
            for processor in self.processors.iter() {
                if let Err(e) = processor.release().await {
                    error!(pipeline = %self.name, processor = processor.name(), error = %e,
                           "error releasing processor");
                }
            }
            for sink in self.sinks.iter() {
                if let Err(e) = sink.release().await {
                    error!(pipeline = %self.name, sink = sink.name(), error = %e,
                           "error releasing sink");
                }
            }
        }

        if was_running {
            let started_at = *self.started_at.lock();
            let runtime = started_at.map(|at| at.elapsed().as_secs_f64()).unwrap_or(0.0);
            info!(
                pipeline = %self.name,
                processed = self.metrics.events_processed.load(Ordering::SeqCst),
                dropped = self.metrics.events_dropped.load(Ordering::SeqCst),
                errors = self.metrics.processing_errors.load(Ordering::SeqCst),
                runtime_seconds = runtime,
                "pipeline stopped"
            );
        }
    }

    pub fn status(&self) -> PipelineStatus {
        let running = self.is_running();
        PipelineStatus {
            name: self.name.clone(),
            running,
            sources: self.source_count,
            processors: self.processors.len(),
            sinks: self.sinks.len(),
            events_processed: self.metrics.events_processed.load(Ordering::SeqCst),
            events_dropped: self.metrics.events_dropped.load(Ordering::SeqCst),
            processing_errors: self.metrics.processing_errors.load(Ordering::SeqCst),
            uptime_seconds: if running {
                let started_at = *self.started_at.lock();
                started_at.map(|at| at.elapsed().as_secs_f64()).unwrap_or(0.0)
            } else {
                0.0
            },
        }
    }
}

/// Everything one per-source driver needs, detached from the
/// pipeline so the task is fully owned.
struct SourceDriver {
    pipeline: String,
    processors: Arc<Vec<Box<dyn Processor>>>,
    sinks: Arc<Vec<Box<dyn Sink>>>,
    metrics: Arc<PipelineMetrics>,
    running: Arc<AtomicBool>,
    active_drivers: Arc<AtomicUsize>,
    batch_size: usize,
    batch_timeout: Duration,
    channel_capacity: usize,
}

impl SourceDriver {
    async fn run(self, mut source: Box<dyn Source>, cancel: CancellationToken) {
        let source_name = source.name().to_string();

        loop {
            let (tx, rx) = mpsc::channel(self.channel_capacity);
            let read_cancel = cancel.clone();
            let reader = tokio::spawn(async move {
                let result = source.read(tx, read_cancel).await;
                (source, result)
            });

            // Consuming until the channel closes also closes it from
            // this side on cancellation, which unblocks the reader.
            self.batch_loop(rx, &cancel).await;

            let (returned, result) = match reader.await {
                Ok(pair) => pair,
                Err(e) => {
                    error!(pipeline = %self.pipeline, source = %source_name, error = %e,
                           "source reader task aborted");
                    self.metrics.processing_errors.fetch_add(1, Ordering::SeqCst);
                    self.finish();
                    return;
                }
            };
            source = returned;

            match result {
                Ok(()) => break,
                Err(e) => {
                    if cancel.is_cancelled() || !self.running.load(Ordering::SeqCst) {
                        break;
                    }
                    error!(pipeline = %self.pipeline, source = %source_name, error = %e,
                           "source read failed, retrying");
                    self.metrics.processing_errors.fetch_add(1, Ordering::SeqCst);
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(source.poll_interval()) => {}
                    }
                }
            }
        }

        if let Err(e) = source.release().await {
            error!(pipeline = %self.pipeline, source = %source_name, error = %e,
                   "error releasing source");
        }
        self.finish();
    }

    fn finish(&self) {
        // The last driver out marks a naturally finished pipeline as
        // stopped.
        if self.active_drivers.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.running.store(false, Ordering::SeqCst);
        }
    }

    /// Pop events, run the chain, batch, and flush on size or on the
    /// deadline armed at the previous flush.
    async fn batch_loop(&self, mut rx: EventRx, cancel: &CancellationToken) {
        let mut batch: Vec<LogEvent> = Vec::with_capacity(self.batch_size.min(1024));
        let mut deadline = Instant::now() + self.batch_timeout;

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep_until(deadline), if !batch.is_empty() => {
                    self.flush(&mut batch).await;
                    deadline = Instant::now() + self.batch_timeout;
                }
                received = rx.recv() => match received {
                    Some(event) => {
                        if let Some(processed) = self.apply_chain(event).await {
                            batch.push(processed);
                        }
                        if batch.len() >= self.batch_size {
                            self.flush(&mut batch).await;
                            deadline = Instant::now() + self.batch_timeout;
                        }
                    }
                    None => break,
                }
            }
        }

        // Tail flush before handing control back.
        self.flush(&mut batch).await;
    }

    /// Run one event through the processors in configured order.
    async fn apply_chain(&self, event: LogEvent) -> Option<LogEvent> {
        let mut current = event;
        for processor in self.processors.iter() {
            match processor.process(current).await {
                Ok(Some(next)) => current = next,
                Ok(None) => {
                    self.metrics.events_dropped.fetch_add(1, Ordering::SeqCst);
                    return None;
                }
                Err(e) => {
                    error!(pipeline = %self.pipeline, processor = processor.name(), error = %e,
                           "processor failed, dropping event");
                    self.metrics.events_dropped.fetch_add(1, Ordering::SeqCst);
                    self.metrics.processing_errors.fetch_add(1, Ordering::SeqCst);
                    return None;
                }
            }
        }
        self.metrics.events_processed.fetch_add(1, Ordering::SeqCst);
        Some(current)
    }

    /// Hand the batch to every sink in parallel. A sink failure is
    /// counted and logged; the batch is not redelivered.
    async fn flush(&self, batch: &mut Vec<LogEvent>) {
        if batch.is_empty() {
            return;
        }
        let events = std::mem::take(batch);

        let writes = self.sinks.iter().map(|sink| {
            let events = &events;
            async move {
                if let Err(e) = sink.write(events).await {
                    error!(pipeline = %self.pipeline, sink = sink.name(), error = %e,
                           "sink write failed");
                    self.metrics.processing_errors.fetch_add(1, Ordering::SeqCst);
                }
            }
        });
        futures::future::join_all(writes).await;
    }
}

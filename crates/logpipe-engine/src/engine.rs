//! The engine: load, supervise, and introspect pipelines.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{error, info, warn};

use logpipe_core::{load_config_file, ConfigError};

use crate::pipeline::{Pipeline, PipelineStatus};
use crate::registry::Registry;

/// Errors from engine control-plane operations.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("pipeline not found: {0}")]
    PipelineNotFound(String),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Owns the mapping from pipeline name to pipeline and drives their
/// lifecycle. Control-plane operations serialize on the pipeline map;
/// data-plane work runs entirely inside the pipelines.
pub struct Engine {
    registry: Registry,
    pipelines: Mutex<HashMap<String, Arc<Pipeline>>>,
    running: AtomicBool,
}

impl Engine {
    /// An engine with the built-in component registry.
    pub fn new() -> Self {
        Self::with_registry(Registry::with_builtins())
    }

    /// An engine over a caller-assembled registry, for embedders that
    /// register their own component types.
    pub fn with_registry(registry: Registry) -> Self {
        Self {
            registry,
            pipelines: Mutex::new(HashMap::new()),
            running: AtomicBool::new(false),
        }
    }

    /// Register extension components before loading pipelines.
    pub fn registry_mut(&mut self) -> &mut Registry {
        &mut self.registry
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Load a pipeline from a configuration file, replacing (after
    /// stopping) any existing pipeline of the same name. Returns the
    /// pipeline name.
    pub async fn load(&self, config_path: impl AsRef<Path>) -> Result<String, ConfigError> {
        let config_path = config_path.as_ref();
        info!(path = %config_path.display(), "loading pipeline");

        let config = load_config_file(config_path)?;
        let name = config.name.clone();
        let pipeline = Arc::new(Pipeline::from_config(config, &self.registry).await?);

        let mut pipelines = self.pipelines.lock().await;
        if let Some(existing) = pipelines.remove(&name) {
            warn!(pipeline = %name, "replacing existing pipeline");
            existing.stop().await;
        }
        pipelines.insert(name.clone(), pipeline);
        Ok(name)
    }

    /// Start a loaded pipeline. A no-op when it is already running; a
    /// pipeline whose previous run completed is rebuilt from its
    /// descriptor first.
    pub async fn start(&self, name: &str) -> Result<(), EngineError> {
        let mut pipelines = self.pipelines.lock().await;
        let pipeline = pipelines
            .get(name)
            .ok_or_else(|| EngineError::PipelineNotFound(name.to_string()))?;

        if pipeline.is_running() {
            return Ok(());
        }

        if pipeline.is_spent() {
            let config = pipeline.config().clone();
            let fresh = Arc::new(Pipeline::from_config(config, &self.registry).await?);
            fresh.start().await;
            pipelines.insert(name.to_string(), fresh);
        } else {
            pipeline.start().await;
        }
        info!(pipeline = %name, "pipeline start requested");
        Ok(())
    }

    /// Stop a pipeline cooperatively. Idempotent.
    pub async fn stop(&self, name: &str) -> Result<(), EngineError> {
        let pipeline = {
            let pipelines = self.pipelines.lock().await;
            pipelines
                .get(name)
                .cloned()
                .ok_or_else(|| EngineError::PipelineNotFound(name.to_string()))?
        };
        pipeline.stop().await;
        info!(pipeline = %name, "pipeline stopped");
        Ok(())
    }

    /// Load and start every configuration. Per-path failures are
    /// logged and skipped; the engine keeps whatever did start.
    pub async fn start_all(&self, config_paths: &[impl AsRef<Path>]) {
        self.running.store(true, Ordering::SeqCst);

        for path in config_paths {
            let path = path.as_ref();
            match self.load(path).await {
                Ok(name) => {
                    if let Err(e) = self.start(&name).await {
                        error!(path = %path.display(), error = %e, "failed to start pipeline");
                    }
                }
                Err(e) => {
                    error!(path = %path.display(), error = %e, "failed to load pipeline");
                }
            }
        }

        let count = self.pipelines.lock().await.len();
        info!(pipelines = count, "engine started");
    }

    /// Stop every pipeline, best effort; failures are logged and
    /// never propagate past the engine boundary.
    pub async fn stop_all(&self) {
        let names = self.list().await;
        for name in names {
            if let Err(e) = self.stop(&name).await {
                error!(pipeline = %name, error = %e, "error stopping pipeline");
            }
        }
        self.running.store(false, Ordering::SeqCst);
        info!("engine stopped");
    }

    /// Block until an interrupt or termination signal, then stop
    /// every pipeline.
    pub async fn run_until_shutdown(&self) {
        shutdown_signal().await;
        info!("shutdown signal received");
        self.stop_all().await;
    }

    pub async fn list(&self) -> Vec<String> {
        self.pipelines.lock().await.keys().cloned().collect()
    }

    pub async fn status(&self, name: &str) -> Result<PipelineStatus, EngineError> {
        let pipelines = self.pipelines.lock().await;
        pipelines
            .get(name)
            .map(|pipeline| pipeline.status())
            .ok_or_else(|| EngineError::PipelineNotFound(name.to_string()))
    }

    pub async fn status_all(&self) -> Vec<PipelineStatus> {
        let pipelines = self.pipelines.lock().await;
        let mut statuses: Vec<PipelineStatus> =
            pipelines.values().map(|pipeline| pipeline.status()).collect();
        statuses.sort_by(|a, b| a.name.cmp(&b.name));
        statuses
    }
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}

/// Wait for SIGINT or SIGTERM.
async fn shutdown_signal() {
    let interrupt = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut terminate = match signal(SignalKind::terminate()) {
            Ok(terminate) => terminate,
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                let _ = interrupt.await;
                return;
            }
        };
        tokio::select! {
            _ = interrupt => {}
            _ = terminate.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        let _ = interrupt.await;
    }
}

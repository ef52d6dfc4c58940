//! # Logpipe Engine - Pipeline Runtime and Supervision
//!
//! This crate turns validated pipeline descriptors into running
//! pipelines and supervises them.
//!
//! - **Registry**: resolves `(role, type tag)` to a component
//!   constructor; built-ins pre-registered, extensions welcome
//! - **Pipeline**: the per-source read → process → batch → write
//!   machinery with cooperative shutdown and monotonic counters
//! - **Engine**: loads configurations, owns the name → pipeline map,
//!   and exposes read-only status snapshots
//!
//! ## Example
//!
//! ```no_run
//! use logpipe_engine::Engine;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let engine = Engine::new();
//! let name = engine.load("pipeline.yml").await?;
//! engine.start(&name).await?;
//! engine.run_until_shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod engine;
pub mod pipeline;
pub mod registry;

pub use engine::{Engine, EngineError};
pub use pipeline::{Pipeline, PipelineMetrics, PipelineStatus};
pub use registry::Registry;

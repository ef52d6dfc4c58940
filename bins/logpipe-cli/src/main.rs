//! # Logpipe CLI - Pipeline Runner
//!
//! Thin command-line front-end for the logpipe engine. It loads YAML
//! pipeline configurations, runs them until interrupted, and prints
//! pipeline status.
//!
//! ## Usage
//!
//! ```bash
//! # Run one or more pipelines until Ctrl-C
//! logpipe start --config web-logs.yml --config audit.yml
//!
//! # Verbose logging (RUST_LOG overrides)
//! logpipe start --config web-logs.yml --verbose
//!
//! # Show per-pipeline state
//! logpipe status
//! ```

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use logpipe_engine::Engine;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "logpipe")]
#[command(about = "Configurable log ingestion and transformation engine")]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Load and run pipelines until interrupted
    Start {
        /// Pipeline configuration file(s)
        #[arg(short, long = "config", required = true)]
        config: Vec<PathBuf>,
    },
    /// Show the status of all pipelines
    Status,
    /// Stop then start the named pipeline
    Restart {
        /// Pipeline name
        name: String,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new(if cli.verbose { "debug" } else { "info" })
        }))
        .with(tracing_subscriber::fmt::layer())
        .init();

    match cli.command {
        Command::Start { config } => start(config).await,
        Command::Status => status().await,
        Command::Restart { name } => restart(&name).await,
    }
}

/// Load and start every configuration, then run until an interrupt
/// or termination signal stops the engine.
async fn start(configs: Vec<PathBuf>) -> ExitCode {
    for path in &configs {
        if !path.exists() {
            eprintln!("error: configuration file not found: {}", path.display());
            return ExitCode::FAILURE;
        }
    }

    let engine = Engine::new();
    engine.start_all(&configs).await;
    if engine.list().await.is_empty() {
        eprintln!("error: no pipelines could be started");
        return ExitCode::FAILURE;
    }

    engine.run_until_shutdown().await;
    ExitCode::SUCCESS
}

async fn status() -> ExitCode {
    let engine = Engine::new();
    let statuses = engine.status_all().await;

    if statuses.is_empty() {
        println!("No pipelines are running");
        return ExitCode::SUCCESS;
    }

    println!("Pipeline Status:");
    println!("---------------");
    for status in statuses {
        println!(
            "{}: {}",
            status.name,
            if status.running { "RUNNING" } else { "STOPPED" }
        );
        println!("  Sources: {}", status.sources);
        println!("  Processors: {}", status.processors);
        println!("  Sinks: {}", status.sinks);
        println!(
            "  Events: {} processed, {} dropped, {} errors",
            status.events_processed, status.events_dropped, status.processing_errors
        );
        if status.running {
            println!("  Uptime: {:.2} seconds", status.uptime_seconds);
        }
        println!();
    }
    ExitCode::SUCCESS
}

async fn restart(name: &str) -> ExitCode {
    let engine = Engine::new();
    if let Err(e) = engine.stop(name).await {
        eprintln!("error: {}", e);
        return ExitCode::FAILURE;
    }
    if let Err(e) = engine.start(name).await {
        eprintln!("error: {}", e);
        return ExitCode::FAILURE;
    }
    println!("Pipeline {} restarted", name);
    ExitCode::SUCCESS
}

//! Split Dispatcher Runner
//!
//! This binary starts an in-process cluster (dispatcher plus workers), reads
//! a declarative pipeline through it and prints every element as a JSON line.
//!
//! # Usage
//!
//! ```bash
//! # Read a pipeline with two workers in distributed_epoch mode
//! split-dispatcher --pipeline pipeline.toml
//!
//! # Five workers, first 1000 elements only
//! split-dispatcher --pipeline pipeline.json --workers 5 --take 1000
//!
//! # Start with configuration file
//! split-dispatcher --pipeline pipeline.toml --config service.toml
//! ```

use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use split_core::{Cluster, PipelineSpec, ProcessingMode, ServiceConfig};

/// Split Dispatcher Runner
#[derive(Parser, Debug)]
#[command(name = "split-dispatcher")]
#[command(about = "Reads a pipeline through an in-process split-dispatcher cluster")]
struct Args {
    /// Pipeline description (.json or .toml)
    #[arg(short, long)]
    pipeline: PathBuf,

    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Number of workers to start
    #[arg(short, long, default_value = "2")]
    workers: usize,

    /// Processing mode (distributed_epoch, parallel_epochs)
    #[arg(short, long, default_value = "distributed_epoch")]
    mode: String,

    /// Stop after this many elements
    #[arg(long)]
    take: Option<usize>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Logs go to stderr; stdout carries the elements.
    let filter = tracing_subscriber::filter::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::filter::EnvFilter::new(&args.log_level));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let mode: ProcessingMode = args.mode.parse()?;
    let config = match &args.config {
        Some(path) => ServiceConfig::from_file(path)?,
        None => ServiceConfig::default(),
    }
    .with_env_overrides();
    let node = PipelineSpec::from_file(&args.pipeline)?.build()?;

    tracing::info!("Starting split dispatcher");
    tracing::info!("  Workers: {}", args.workers);
    tracing::info!("  Mode: {:?}", mode);
    tracing::info!("  Split size: {}", config.dispatcher.split_size);
    tracing::info!("  Pipeline: {:?}", node);

    let cluster = Cluster::from_config(config, args.workers)?;
    let interrupted = Arc::new(AtomicBool::new(false));

    let take = args.take;
    let flag = interrupted.clone();
    let mut consumer = tokio::task::spawn_blocking(move || -> split_core::Result<u64> {
        let stream = cluster.distribute(node, mode).iter()?;
        let stdout = std::io::stdout();
        let mut out = BufWriter::new(stdout.lock());
        let mut count = 0u64;

        for item in stream.take(take.unwrap_or(usize::MAX)) {
            if flag.load(Ordering::Relaxed) {
                break;
            }
            let element = item?;
            let line = serde_json::to_string(&element).map_err(|e| {
                split_core::SplitError::serialization(format!("failed to encode element: {e}"))
            })?;
            writeln!(out, "{line}").map_err(|e| {
                split_core::SplitError::execution(format!("failed to write element: {e}"))
            })?;
            count += 1;
        }
        out.flush().map_err(|e| {
            split_core::SplitError::execution(format!("failed to flush output: {e}"))
        })?;
        Ok(count)
    });

    let count = tokio::select! {
        result = &mut consumer => result??,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Shutting down split dispatcher...");
            interrupted.store(true, Ordering::Relaxed);
            consumer.await??
        }
    };

    tracing::info!("Read {} elements", count);
    Ok(())
}

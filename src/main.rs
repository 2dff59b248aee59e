//! DiffSleuth -- forensic differencing of two guest disk images.
//!
//! Thin binary entry point. All logic lives in the `diffsleuth-core` crate.
//! Both images are expected as host directories holding a mounted guest
//! filesystem; the JSON report goes to stdout, logs to stderr.

use anyhow::{Context, Result};
use clap::Parser;
use diffsleuth_core::adapter::local::LocalGuest;
use diffsleuth_core::{Comparator, CompareConfig, ImageSources};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "diffsleuth")]
#[command(version, about = "Compare two mounted guest disk images", long_about = None)]
struct Cli {
    /// Mount point of the old (baseline) image
    old: PathBuf,

    /// Mount point of the new image
    new: PathBuf,

    /// Path to a JSON configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Guest path to compare from
    #[arg(long)]
    root: Option<String>,

    /// Digest worker threads per image
    #[arg(short, long)]
    workers: Option<usize>,

    /// Per-file read timeout in seconds
    #[arg(long)]
    file_timeout: Option<u64>,

    /// Add a type description to every file record
    #[arg(long)]
    identify: bool,

    /// Pretty-print the JSON report
    #[arg(long)]
    pretty: bool,

    /// Enable debug logging
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| log_level.to_string()),
        ))
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .init();

    let mut config = match &cli.config {
        Some(path) => CompareConfig::from_file(path)?,
        None => CompareConfig::default(),
    };
    if let Some(root) = cli.root {
        config.root = root;
    }
    if let Some(workers) = cli.workers {
        config.workers = workers;
    }
    if let Some(secs) = cli.file_timeout {
        config.file_timeout_secs = Some(secs);
    }
    config.identify |= cli.identify;
    if config.registry.enabled {
        // Mounted directories come without a hive parser.
        tracing::warn!("Registry comparison needs a hive adapter; disabled for local images");
        config.registry.enabled = false;
    }

    let comparator = Comparator::new(config)?;
    let old = ImageSources::new(Arc::new(LocalGuest::new(&cli.old)));
    let new = ImageSources::new(Arc::new(LocalGuest::new(&cli.new)));

    let outcome = comparator
        .compare(&old, &new)
        .with_context(|| format!("comparing {} against {}", cli.old.display(), cli.new.display()))?;

    let json = if cli.pretty {
        serde_json::to_string_pretty(&outcome.report)
    } else {
        serde_json::to_string(&outcome.report)
    }
    .context("serialising report")?;
    println!("{json}");

    tracing::info!(
        "{} + {} entries, {} files hashed in {:?}",
        outcome.stats.old_entries,
        outcome.stats.new_entries,
        outcome.stats.hashed_files,
        outcome.stats.elapsed
    );
    Ok(())
}

//! Isolated caption worker.
//!
//! Spawned by the subprocess strategy as
//! `captionmd-worker <request.json> <response.json>`. Logs go to stderr,
//! which the parent streams into its own log line by line.

use anyhow::{Context, Result};
use clap::Parser;
use std::io;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Caption the images of a request file and write a response file.
#[derive(Parser, Debug)]
#[command(name = "captionmd-worker", version)]
struct Cli {
    /// Request payload written by the parent process.
    request: PathBuf,

    /// Where to write the `{filename: description}` response.
    response: PathBuf,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(io::stderr)
        .with_ansi(false)
        .without_time()
        .init();

    let stats = captionmd::worker::run_worker(&cli.request, &cli.response)
        .context("Caption worker failed")?;
    info!(
        "worker finished: {} described, {} skipped, {} failed",
        stats.described, stats.skipped, stats.failed
    );
    Ok(())
}

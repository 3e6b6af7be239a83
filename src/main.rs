//! CLI entry point: fetch one URL through the cache.

use std::fs::File;
use std::io::{self, BufWriter, Write};

use anyhow::{Context, Result};
use clap::Parser;
use reqcache::{FetchOptions, RequestDescriptor, RetrievalEngine, SourceConfig};
use tracing::{debug, info};

mod cli;

use cli::Args;

fn main() -> Result<()> {
    // Parse CLI arguments first (before tracing, so --help works without logs)
    let args = Args::parse();

    // Priority: RUST_LOG env var > quiet flag > verbose flag > default (info)
    let default_level = if args.quiet {
        "error"
    } else {
        match args.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));

    // Logs go to stderr; stdout carries the body
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();

    debug!(?args, "CLI arguments parsed");

    let config = build_config(&args)?;
    let engine = RetrievalEngine::builder()
        .config(config)
        .cache_dir(args.cache_dir.clone())
        .verify_tls(!args.insecure)
        .build()
        .context("failed to build retrieval engine")?;

    let request = RequestDescriptor::new(args.url.as_str());
    let mut reader = engine
        .fetch(&request, &FetchOptions::from(args.bypass()))
        .with_context(|| format!("failed to fetch {}", args.url))?;

    let written = match &args.output {
        Some(path) => {
            let file = File::create(path)
                .with_context(|| format!("failed to create {}", path.display()))?;
            let mut out = BufWriter::new(file);
            let written = io::copy(&mut reader, &mut out)?;
            out.flush()?;
            written
        }
        None => {
            let mut out = io::stdout().lock();
            let written = io::copy(&mut reader, &mut out)?;
            out.flush()?;
            written
        }
    };
    let outcome = reader
        .finish()
        .with_context(|| format!("failed to complete {}", args.url))?;

    info!(
        url = %args.url,
        bytes = written,
        from_cache = reader.is_from_cache(),
        ?outcome,
        "Fetch complete"
    );

    Ok(())
}

/// Config file (or defaults) with command-line overrides applied.
fn build_config(args: &Args) -> Result<SourceConfig> {
    let base = match &args.config {
        Some(path) => SourceConfig::from_json_file(path)?,
        None => SourceConfig::default(),
    };

    let mut builder = base.to_builder();
    if let Some(rps) = args.rps {
        builder = builder.requests_per_second(rps);
    }
    if let Some(retries) = args.retries {
        builder = builder.http_retries(retries);
    }
    if let Some(mode) = args.status_check {
        builder = builder.status_check(mode.into());
    }
    Ok(builder.build()?)
}

//! Reqlog Control - CLI for request log ingestion and queries
//!
//! Thin wrapper over reqlog_common: resolves configuration, opens the store
//! and prints results as JSON on stdout. Logs go to stderr.

mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};
use reqlog_common::Dimension;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "reqlogctl")]
#[command(about = "Ingest HTTP request logs into SQLite and query them", long_about = None)]
#[command(version)]
struct Cli {
    /// Config file (default: ~/.config/reqlog/config.toml, then /etc/reqlog/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// SQLite database, overrides [store] path
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Ingest every log file in the given directories
    Ingest {
        /// Directories to ingest, in order
        #[arg(default_value = "logs")]
        dirs: Vec<PathBuf>,

        /// Comma separated source tags (e.g. "log.go:,server.go:")
        #[arg(long)]
        sources: Option<String>,

        /// File receiving lines that were not ingested
        #[arg(long)]
        ignored: Option<PathBuf>,

        /// Worker count (0 = number of CPUs)
        #[arg(long)]
        workers: Option<usize>,

        /// Record failing files and continue instead of stopping
        #[arg(long)]
        keep_going: bool,

        /// Fail on the first request line that cannot be parsed
        #[arg(long)]
        strict_lines: bool,
    },

    /// Count stored requests grouped by a dimension
    Query {
        /// requests, address, protocol, method, url, header-key or header-value
        dimension: Dimension,

        /// Predicate as name=value (repeatable), e.g. -f method=GET -f start=1651406400
        #[arg(short, long = "filter", value_name = "NAME=VALUE")]
        filters: Vec<String>,
    },

    /// Show row counts of the store
    Stats,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let mut config = reqlog_common::ReqlogConfig::load(cli.config.as_deref())?;
    if let Some(db) = cli.db {
        config.store.path = db;
    }

    match cli.command {
        Commands::Ingest {
            dirs,
            sources,
            ignored,
            workers,
            keep_going,
            strict_lines,
        } => {
            let overrides = commands::IngestOverrides {
                sources,
                ignored,
                workers,
                keep_going,
                strict_lines,
            };
            commands::ingest(config, overrides, &dirs).await
        }
        Commands::Query { dimension, filters } => commands::query(&config, dimension, &filters),
        Commands::Stats => commands::stats(&config),
    }
}

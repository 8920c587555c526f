//! Command handlers for reqlogctl.

use anyhow::{bail, Context, Result};
use reqlog_common::{
    Dimension, FileFailurePolicy, IgnoredSink, IngestScheduler, LogStore, MalformedLinePolicy,
    ReqlogConfig, RequestFilter, SourceTags,
};
use serde::Serialize;
use std::path::PathBuf;
use tracing::{info, warn};

/// Ingest flags that override the config file
pub struct IngestOverrides {
    pub sources: Option<String>,
    pub ignored: Option<PathBuf>,
    pub workers: Option<usize>,
    pub keep_going: bool,
    pub strict_lines: bool,
}

impl IngestOverrides {
    fn apply(self, config: &mut ReqlogConfig) -> Result<()> {
        let ingest = &mut config.ingest;

        if let Some(csv) = self.sources {
            ingest.sources = SourceTags::from_csv(&csv);
        }
        if ingest.sources.is_empty() {
            bail!("at least one source tag is required");
        }
        if let Some(workers) = self.workers {
            ingest.workers = workers;
        }
        if self.keep_going {
            ingest.file_failures = FileFailurePolicy::Isolate;
        }
        if self.strict_lines {
            ingest.malformed_lines = MalformedLinePolicy::Abort;
        }
        if let Some(path) = self.ignored {
            config.ignored.path = path;
        }
        Ok(())
    }
}

fn open_store(config: &ReqlogConfig) -> Result<LogStore> {
    LogStore::open(&config.store.path)
        .with_context(|| format!("Failed to open store {}", config.store.path.display()))
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Handle ingest command
pub async fn ingest(
    mut config: ReqlogConfig,
    overrides: IngestOverrides,
    dirs: &[PathBuf],
) -> Result<()> {
    overrides.apply(&mut config)?;
    let store = open_store(&config)?;

    let sink = IgnoredSink::create(&config.ignored.path, config.ignored.channel_capacity)
        .with_context(|| format!("Failed to create {}", config.ignored.path.display()))?;

    let scheduler = IngestScheduler::new(store, config.ingest);
    let result = scheduler.run(dirs, sink.sender()).await;

    // Flush ignored lines even when the run failed
    let (_, ignored) = sink.finish().await?;
    info!("Wrote {} ignored lines to {}", ignored, config.ignored.path.display());

    let report = result.context("Ingestion failed")?;
    for failure in report.failures() {
        warn!("Failed: {}: {}", failure.path.display(), failure.error);
    }
    print_json(&report)?;
    info!("Total: {}", report.total);
    Ok(())
}

/// Handle query command
pub fn query(config: &ReqlogConfig, dimension: Dimension, filters: &[String]) -> Result<()> {
    let mut filter = RequestFilter::default();
    for pair in filters {
        let (name, value) = pair
            .split_once('=')
            .with_context(|| format!("filter {:?} is not NAME=VALUE", pair))?;
        filter.set(name, value).with_context(|| {
            format!("valid filters: {}", RequestFilter::PREDICATES.join(", "))
        })?;
    }

    let store = open_store(config)?;
    let result = store.count_requests(&filter, dimension)?;
    print_json(&result)
}

/// Handle stats command
pub fn stats(config: &ReqlogConfig) -> Result<()> {
    let store = open_store(config)?;
    print_json(&store.stats()?)
}

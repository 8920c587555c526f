//! Reqlog Configuration
//!
//! Config file: ~/.config/reqlog/config.toml or /etc/reqlog/config.toml.
//! Every field has a default, so an empty or missing file is valid.

use crate::classify::SourceTags;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// What to do with a classified line that fails to parse
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MalformedLinePolicy {
    /// Log it, count it and route it to the ignored sink
    #[default]
    Skip,
    /// Fail the file
    Abort,
}

/// What to do when a file fails (unreadable, malformed under Abort, store error)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileFailurePolicy {
    /// Stop the whole run with the first error
    #[default]
    Abort,
    /// Record the failure and keep going
    Isolate,
}

/// Ingestion settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    /// Source tags that mark request lines
    pub sources: SourceTags,

    /// Worker count, 0 = available hardware parallelism
    pub workers: usize,

    /// Capacity of the bounded job queue
    pub queue_capacity: usize,

    pub malformed_lines: MalformedLinePolicy,

    pub file_failures: FileFailurePolicy,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            sources: SourceTags::default(),
            workers: 0,
            queue_capacity: 10_000,
            malformed_lines: MalformedLinePolicy::Skip,
            file_failures: FileFailurePolicy::Abort,
        }
    }
}

impl IngestConfig {
    /// Resolved worker pool size
    pub fn worker_count(&self) -> usize {
        if self.workers == 0 {
            num_cpus::get().max(1)
        } else {
            self.workers
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// SQLite database file
    pub path: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("log.db"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IgnoredConfig {
    /// File receiving lines that were not ingested (truncated per run)
    pub path: PathBuf,

    pub channel_capacity: usize,
}

impl Default for IgnoredConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from(".ignored"),
            channel_capacity: 10_000,
        }
    }
}

/// Main reqlog configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReqlogConfig {
    #[serde(default)]
    pub ingest: IngestConfig,

    #[serde(default)]
    pub store: StoreConfig,

    #[serde(default)]
    pub ignored: IgnoredConfig,
}

impl ReqlogConfig {
    /// User config path: ~/.config/reqlog/config.toml
    pub fn user_config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("reqlog").join("config.toml"))
    }

    /// System config path: /etc/reqlog/config.toml
    pub fn system_config_path() -> PathBuf {
        PathBuf::from("/etc/reqlog/config.toml")
    }

    /// Load configuration
    ///
    /// Priority:
    /// 1. Explicit path (must exist)
    /// 2. User config
    /// 3. System config
    /// 4. Defaults
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            return Self::load_from(path);
        }

        if let Some(user_path) = Self::user_config_path() {
            if user_path.exists() {
                return Self::load_from(&user_path);
            }
        }

        let system_path = Self::system_config_path();
        if system_path.exists() {
            return Self::load_from(&system_path);
        }

        Ok(Self::default())
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        toml::from_str(&contents).with_context(|| format!("Failed to parse {}", path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ReqlogConfig::default();
        assert_eq!(config.ingest.sources, SourceTags::new(["log.go:"]));
        assert_eq!(config.ingest.queue_capacity, 10_000);
        assert_eq!(config.ingest.malformed_lines, MalformedLinePolicy::Skip);
        assert_eq!(config.ingest.file_failures, FileFailurePolicy::Abort);
        assert_eq!(config.store.path, PathBuf::from("log.db"));
        assert_eq!(config.ignored.path, PathBuf::from(".ignored"));
        assert!(config.ingest.worker_count() >= 1);
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let config: ReqlogConfig = toml::from_str(
            r#"
            [ingest]
            sources = ["log.go:", "net.go:"]
            workers = 3
            file_failures = "isolate"
            "#,
        )
        .unwrap();

        assert_eq!(config.ingest.sources.as_slice().len(), 2);
        assert_eq!(config.ingest.worker_count(), 3);
        assert_eq!(config.ingest.file_failures, FileFailurePolicy::Isolate);
        assert_eq!(config.ingest.malformed_lines, MalformedLinePolicy::Skip);
        assert_eq!(config.store.path, PathBuf::from("log.db"));
    }

    #[test]
    fn test_unknown_policy_is_rejected() {
        let parsed: std::result::Result<ReqlogConfig, _> = toml::from_str(
            r#"
            [ingest]
            malformed_lines = "sometimes"
            "#,
        );
        assert!(parsed.is_err());
    }

    #[test]
    fn test_load_explicit_path() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[store]\npath = \"/tmp/requests.db\"\n").unwrap();

        let config = ReqlogConfig::load(Some(&path)).unwrap();
        assert_eq!(config.store.path, PathBuf::from("/tmp/requests.db"));

        assert!(ReqlogConfig::load(Some(&dir.path().join("missing.toml"))).is_err());
    }
}

//! Reqlog Common - Request log ingestion and query engine
//!
//! Classifies and parses HTTP access-log lines, ingests directories of log
//! files concurrently into SQLite, and answers filtered aggregate queries.

pub mod classify;
pub mod config;
pub mod header_block;
pub mod ingest;
pub mod parse;
pub mod query;
pub mod sink;
pub mod store;

pub use classify::{is_request_line, SourceTags};
pub use config::{FileFailurePolicy, MalformedLinePolicy, ReqlogConfig};
pub use ingest::{IngestError, IngestReport, IngestScheduler};
pub use parse::{parse_request_line, MalformedLine, RequestRecord};
pub use query::{Dimension, QueryBuilder, QueryError, QueryResult, RequestFilter};
pub use sink::{IgnoredSender, IgnoredSink, SinkError};
pub use store::{LogStore, StoreError, StoreStats};

//! Request Store - SQLite persistence for parsed request logs
//!
//! Schema:
//! - log_files: one row per claimed log file, unique by name (dedup key)
//! - requests: one row per request line, owned by a log file
//! - headers: key/value pairs owned by a request
//!
//! SQLite rejects concurrent writers, so the store holds a single connection
//! behind a mutex and every clone shares it. Rows are never updated or
//! deleted.

use crate::parse::RequestRecord;
use crate::query::{
    Aggregate, Dimension, GroupCount, QueryBuilder, QueryResult, RequestFilter, RequestPage,
    RequestRow,
};
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info};

/// Errors from the persistence layer
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("failed to create database directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("store connection lock poisoned")]
    Poisoned,
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// Row counts for the three tables
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StoreStats {
    pub files: u64,
    pub requests: u64,
    pub headers: u64,
}

const SCHEMA: &str = r#"
    CREATE TABLE IF NOT EXISTS log_files (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL UNIQUE
    );

    CREATE TABLE IF NOT EXISTS requests (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        file_id INTEGER NOT NULL REFERENCES log_files(id),
        timestamp INTEGER NOT NULL,
        source TEXT NOT NULL,
        address TEXT NOT NULL,
        protocol TEXT NOT NULL,
        method TEXT NOT NULL,
        host TEXT NOT NULL,
        url TEXT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_requests_timestamp ON requests(timestamp);
    CREATE INDEX IF NOT EXISTS idx_requests_file ON requests(file_id);

    CREATE TABLE IF NOT EXISTS headers (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        request_id INTEGER NOT NULL REFERENCES requests(id),
        key TEXT NOT NULL,
        value TEXT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_headers_request ON headers(request_id);
    CREATE INDEX IF NOT EXISTS idx_headers_key_value ON headers(key, value);
"#;

/// SQLite-backed request store
#[derive(Clone)]
pub struct LogStore {
    conn: Arc<Mutex<Connection>>,
    path: Option<PathBuf>,
}

impl LogStore {
    /// Open or create the store at a path
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|source| StoreError::CreateDir {
                path: parent.to_path_buf(),
                source,
            })?;
        }

        info!("Opening request store at: {}", path.display());

        let conn = Connection::open(path)?;
        // WAL keeps readers (the dashboard) unblocked while ingestion writes
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;

        Self::init(conn, Some(path.to_path_buf()))
    }

    /// In-memory store, used by tests
    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?, None)
    }

    fn init(conn: Connection, path: Option<PathBuf>) -> Result<Self> {
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.execute_batch(SCHEMA)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path,
        })
    }

    /// Database path, `None` for in-memory stores
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| StoreError::Poisoned)
    }

    // ========================================================================
    // Write path
    // ========================================================================

    /// Whether a log file has already been claimed
    pub fn has_file(&self, name: &str) -> Result<bool> {
        let conn = self.lock()?;
        let found: Option<i64> = conn
            .query_row(
                "SELECT id FROM log_files WHERE name = ?1",
                params![name],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    /// Claim a log file before parsing it; fails if the name is already taken
    pub fn claim_file(&self, name: &str) -> Result<i64> {
        let conn = self.lock()?;
        conn.execute("INSERT INTO log_files (name) VALUES (?1)", params![name])?;
        let id = conn.last_insert_rowid();
        debug!("Claimed log file {} as {}", name, id);
        Ok(id)
    }

    /// Insert a request row (without headers)
    pub fn insert_request(&self, file_id: i64, record: &RequestRecord) -> Result<i64> {
        let conn = self.lock()?;
        insert_request_row(&conn, file_id, record)
    }

    pub fn insert_header(&self, request_id: i64, key: &str, value: &str) -> Result<i64> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO headers (request_id, key, value) VALUES (?1, ?2, ?3)",
            params![request_id, key, value],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Insert a request and all of its headers in one transaction
    pub fn insert_record(&self, file_id: i64, record: &RequestRecord) -> Result<i64> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;

        let request_id = insert_request_row(&tx, file_id, record)?;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT INTO headers (request_id, key, value) VALUES (?1, ?2, ?3)",
            )?;
            for (key, value) in &record.headers {
                stmt.execute(params![request_id, key, value])?;
            }
        }

        tx.commit()?;
        Ok(request_id)
    }

    // ========================================================================
    // Read path
    // ========================================================================

    /// Run a filtered query for one dimension
    pub fn count_requests(
        &self,
        filter: &RequestFilter,
        dimension: Dimension,
    ) -> Result<QueryResult> {
        let query = QueryBuilder::new(filter, dimension).build();
        debug!("Query for {}: {}", dimension, query.sql);

        let conn = self.lock()?;
        let mut stmt = conn.prepare(&query.sql)?;
        let params = query.param_refs();

        if dimension == Dimension::Requests {
            let rows = stmt.query_map(params.as_slice(), |row| {
                Ok(RequestRow {
                    id: row.get(0)?,
                    file: row.get(1)?,
                    timestamp: row.get(2)?,
                    source: row.get(3)?,
                    address: row.get(4)?,
                    protocol: row.get(5)?,
                    method: row.get(6)?,
                    host: row.get(7)?,
                    url: row.get(8)?,
                    headers: BTreeMap::new(),
                })
            })?;

            let mut headers_stmt = conn.prepare_cached(
                "SELECT key, value FROM headers WHERE request_id = ?1 ORDER BY id",
            )?;
            let mut page = RequestPage::default();
            for row in rows {
                let mut row = row?;
                let pairs = headers_stmt.query_map(params![row.id], |h| {
                    Ok((h.get::<_, String>(0)?, h.get::<_, String>(1)?))
                })?;
                for pair in pairs {
                    let (key, value) = pair?;
                    row.headers.insert(key, value);
                }
                page.push(row);
            }
            return Ok(QueryResult::Requests(page));
        }

        let groups = stmt.query_map(params.as_slice(), |row| {
            Ok(GroupCount {
                value: row.get(0)?,
                count: row.get::<_, i64>(1)? as u64,
            })
        })?;

        let mut aggregate = Aggregate::new(dimension);
        for group in groups {
            aggregate.push(group?);
        }
        Ok(QueryResult::Groups(aggregate))
    }

    /// Row counts of all tables
    pub fn stats(&self) -> Result<StoreStats> {
        let conn = self.lock()?;
        let count = |table: &str| -> Result<u64> {
            let sql = format!("SELECT COUNT(*) FROM {}", table);
            let n: i64 = conn.query_row(&sql, [], |row| row.get(0))?;
            Ok(n as u64)
        };

        Ok(StoreStats {
            files: count("log_files")?,
            requests: count("requests")?,
            headers: count("headers")?,
        })
    }
}

fn insert_request_row(conn: &Connection, file_id: i64, record: &RequestRecord) -> Result<i64> {
    conn.execute(
        "INSERT INTO requests (file_id, timestamp, source, address, protocol, method, host, url)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            file_id,
            record.timestamp,
            record.source,
            record.address,
            record.protocol,
            record.method,
            record.host,
            record.url,
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

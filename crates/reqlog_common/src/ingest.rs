//! Ingestion Scheduler - Parse directories of request logs into the store
//!
//! Per run: Idle -> Scanning(dir) -> Dispatching -> Barrier -> next dir | Done.
//!
//! Directories are processed strictly in the order given. For each one the
//! scheduler lists its files, skips those already claimed in the store, and
//! queues the rest on a bounded job queue shared by a fixed pool of workers.
//! It then waits for every queued file to report before adding the
//! directory's count to the run total and moving on.
//!
//! Workers open a file, claim it, and stream its lines through
//! classification and parsing. Lines that are not request lines go to the
//! ignored-line sink. A claimed file is never parsed again, even if its
//! first ingestion stopped part way.
//!
//! A fatal error raises a shared stop flag. Workers check it before each
//! job and each line, and the run returns only after every worker is idle,
//! so nothing is written to the store once `run` has returned.

use crate::classify::SourceTags;
use crate::config::{FileFailurePolicy, IngestConfig, MalformedLinePolicy};
use crate::parse::{parse_request_line, MalformedLine};
use crate::sink::{IgnoredSender, SinkError};
use crate::store::{LogStore, StoreError};
use serde::Serialize;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// Errors that stop a file or, depending on policy, the whole run
#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error("{path}:{line}: {source}")]
    Malformed {
        path: PathBuf,
        line: usize,
        #[source]
        source: MalformedLine,
    },

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("cannot scan directory {dir}: {source}")]
    Scan {
        dir: PathBuf,
        #[source]
        source: walkdir::Error,
    },

    #[error("cannot read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Sink(#[from] SinkError),

    #[error("worker pool stopped before all jobs reported")]
    PoolClosed,

    #[error("ingestion stopped after a fatal error")]
    Stopped,

    #[error("ingestion task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

// ============================================================================
// Reports
// ============================================================================

/// Outcome of one ingested file
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FileReport {
    pub path: PathBuf,
    /// Request rows written
    pub records: u64,
    /// Lines that were not request lines
    pub ignored: u64,
    /// Request lines skipped because they failed to parse
    pub malformed: u64,
}

/// A file that failed while failures were isolated
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileFailure {
    pub path: PathBuf,
    pub error: String,
}

/// Outcome of one directory, complete only after its barrier
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DirectoryReport {
    pub path: PathBuf,
    /// Sum of `records` over `files`
    pub records: u64,
    pub files: Vec<FileReport>,
    /// Files skipped because they were already claimed
    pub skipped: Vec<PathBuf>,
    pub failures: Vec<FileFailure>,
    /// Set when the directory could not be listed
    pub scan_error: Option<String>,
}

/// Outcome of a whole run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IngestReport {
    pub total: u64,
    pub directories: Vec<DirectoryReport>,
}

impl IngestReport {
    pub fn files_ingested(&self) -> usize {
        self.directories.iter().map(|d| d.files.len()).sum()
    }

    pub fn files_skipped(&self) -> usize {
        self.directories.iter().map(|d| d.skipped.len()).sum()
    }

    pub fn failures(&self) -> impl Iterator<Item = &FileFailure> {
        self.directories.iter().flat_map(|d| d.failures.iter())
    }
}

// ============================================================================
// Workers
// ============================================================================

/// One queued file; `name` is the dedup key in the store
#[derive(Debug, Clone)]
struct FileJob {
    path: PathBuf,
    name: String,
}

struct JobOutcome {
    path: PathBuf,
    result: Result<FileReport, IngestError>,
}

/// Shared state for every worker
struct WorkerContext {
    store: LogStore,
    sources: SourceTags,
    malformed_lines: MalformedLinePolicy,
    ignored: IgnoredSender,
    stop: Arc<AtomicBool>,
}

impl WorkerContext {
    fn is_stopped(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    /// Stream one file into the store
    fn ingest_file(&self, job: &FileJob) -> Result<FileReport, IngestError> {
        if self.is_stopped() {
            return Err(IngestError::Stopped);
        }

        let read_error = |source| IngestError::Read {
            path: job.path.clone(),
            source,
        };

        let file = File::open(&job.path).map_err(read_error)?;
        let file_id = self.store.claim_file(&job.name)?;

        let mut report = FileReport {
            path: job.path.clone(),
            ..Default::default()
        };
        let mut reader = BufReader::new(file);
        let mut buf = Vec::new();
        let mut line_no = 0;

        loop {
            if self.is_stopped() {
                return Err(IngestError::Stopped);
            }

            buf.clear();
            if reader.read_until(b'\n', &mut buf).map_err(read_error)? == 0 {
                break;
            }
            line_no += 1;

            let text = String::from_utf8_lossy(&buf);
            let line = text.trim();
            if line.is_empty() {
                continue;
            }

            if !self.sources.is_request_line(line) {
                report.ignored += 1;
                self.ignored.send_blocking(line)?;
                continue;
            }

            match parse_request_line(line) {
                Ok(record) => {
                    self.store.insert_record(file_id, &record)?;
                    report.records += 1;
                }
                Err(source) => match self.malformed_lines {
                    MalformedLinePolicy::Abort => {
                        return Err(IngestError::Malformed {
                            path: job.path.clone(),
                            line: line_no,
                            source,
                        });
                    }
                    MalformedLinePolicy::Skip => {
                        warn!(
                            "{}:{}: skipping malformed line: {}",
                            job.path.display(),
                            line_no,
                            source
                        );
                        report.malformed += 1;
                        self.ignored.send_blocking(line)?;
                    }
                },
            }
        }

        Ok(report)
    }
}

async fn run_worker(
    id: usize,
    jobs: Arc<Mutex<mpsc::Receiver<FileJob>>>,
    results: mpsc::UnboundedSender<JobOutcome>,
    ctx: Arc<WorkerContext>,
) {
    loop {
        let job = {
            let mut rx = jobs.lock().await;
            rx.recv().await
        };
        let Some(job) = job else {
            break;
        };
        if ctx.is_stopped() {
            break;
        }

        debug!("Worker {} parsing {}", id, job.path.display());
        let path = job.path.clone();
        let worker_ctx = Arc::clone(&ctx);
        let result = tokio::task::spawn_blocking(move || worker_ctx.ingest_file(&job))
            .await
            .unwrap_or_else(|e| Err(IngestError::Task(e)));

        if results.send(JobOutcome { path, result }).is_err() {
            break;
        }
    }
    debug!("Worker {} stopped", id);
}

// ============================================================================
// Scheduler
// ============================================================================

/// Store key for a file: its path cleaned lexically
///
/// `.` components and repeated separators are dropped and `dir/..` pairs
/// collapse, so `logs/a`, `./logs/a` and `logs/x/../a` share one key.
pub fn dedup_key(path: &Path) -> String {
    let mut clean = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                let follows_name =
                    matches!(clean.components().next_back(), Some(Component::Normal(_)));
                if follows_name {
                    clean.pop();
                } else if !clean.has_root() {
                    clean.push("..");
                }
            }
            other => clean.push(other.as_os_str()),
        }
    }
    if clean.as_os_str().is_empty() {
        clean.push(".");
    }
    clean.to_string_lossy().into_owned()
}

/// List the regular files of a directory (non-recursive, sorted by name)
fn list_files(dir: &Path) -> Result<Vec<PathBuf>, IngestError> {
    let mut files = Vec::new();
    for entry in WalkDir::new(dir)
        .min_depth(1)
        .max_depth(1)
        .sort_by_file_name()
    {
        let entry = entry.map_err(|source| IngestError::Scan {
            dir: dir.to_path_buf(),
            source,
        })?;
        if entry.file_type().is_file() {
            files.push(entry.into_path());
        }
    }
    Ok(files)
}

/// Drives a run over a list of directories
pub struct IngestScheduler {
    store: LogStore,
    config: IngestConfig,
}

impl IngestScheduler {
    pub fn new(store: LogStore, config: IngestConfig) -> Self {
        Self { store, config }
    }

    /// Ingest every directory in order, sending unparsed lines to `ignored`
    pub async fn run<P: AsRef<Path>>(
        &self,
        dirs: &[P],
        ignored: IgnoredSender,
    ) -> Result<IngestReport, IngestError> {
        let workers = self.config.worker_count();
        info!(
            "Ingesting {} directories with {} workers (sources: {:?})",
            dirs.len(),
            workers,
            self.config.sources.as_slice()
        );

        let (job_tx, job_rx) = mpsc::channel::<FileJob>(self.config.queue_capacity.max(1));
        let job_rx = Arc::new(Mutex::new(job_rx));
        let (result_tx, mut result_rx) = mpsc::unbounded_channel::<JobOutcome>();

        let stop = Arc::new(AtomicBool::new(false));
        let ctx = Arc::new(WorkerContext {
            store: self.store.clone(),
            sources: self.config.sources.clone(),
            malformed_lines: self.config.malformed_lines,
            ignored,
            stop: Arc::clone(&stop),
        });

        let mut pool = JoinSet::new();
        for id in 0..workers {
            pool.spawn(run_worker(
                id,
                Arc::clone(&job_rx),
                result_tx.clone(),
                Arc::clone(&ctx),
            ));
        }
        // Only workers hold result senders, so a dead pool closes the channel
        drop(result_tx);
        drop(ctx);

        let mut report = IngestReport::default();
        for dir in dirs {
            let dir = dir.as_ref();
            match self.ingest_directory(dir, &job_tx, &mut result_rx).await {
                Ok(dir_report) => {
                    report.total += dir_report.records;
                    report.directories.push(dir_report);
                }
                Err(e) => {
                    warn!("Ingestion aborted in {}: {}", dir.display(), e);
                    stop.store(true, Ordering::SeqCst);
                    drop(job_tx);
                    // Workers drop queued jobs and leave in-flight files at the next line
                    while pool.join_next().await.is_some() {}
                    return Err(e);
                }
            }
        }

        // Done: close the queue and let workers drain out
        drop(job_tx);
        while let Some(joined) = pool.join_next().await {
            joined?;
        }

        info!(
            "Ingested {} records from {} files ({} already ingested)",
            report.total,
            report.files_ingested(),
            report.files_skipped()
        );
        Ok(report)
    }

    async fn ingest_directory(
        &self,
        dir: &Path,
        jobs: &mpsc::Sender<FileJob>,
        results: &mut mpsc::UnboundedReceiver<JobOutcome>,
    ) -> Result<DirectoryReport, IngestError> {
        let mut dir_report = DirectoryReport {
            path: dir.to_path_buf(),
            ..Default::default()
        };

        // Scanning
        info!("Scanning {}", dir.display());
        let store = self.store.clone();
        let scan_dir = dir.to_path_buf();
        let scanned = tokio::task::spawn_blocking(move || -> Result<_, IngestError> {
            let mut fresh = Vec::new();
            let mut skipped = Vec::new();
            for path in list_files(&scan_dir)? {
                let name = dedup_key(&path);
                if store.has_file(&name)? {
                    skipped.push(path);
                } else {
                    fresh.push(FileJob { path, name });
                }
            }
            Ok((fresh, skipped))
        })
        .await?;

        let (fresh, skipped) = match scanned {
            Ok(found) => found,
            Err(e @ IngestError::Scan { .. }) => {
                warn!("{}", e);
                dir_report.scan_error = Some(e.to_string());
                return Ok(dir_report);
            }
            Err(e) => return Err(e),
        };
        for path in &skipped {
            debug!("Skipping already ingested {}", path.display());
        }
        dir_report.skipped = skipped;

        // Dispatching
        let pending = fresh.len();
        for job in fresh {
            jobs.send(job).await.map_err(|_| IngestError::PoolClosed)?;
        }

        // Barrier
        for _ in 0..pending {
            let outcome = results.recv().await.ok_or(IngestError::PoolClosed)?;
            match outcome.result {
                Ok(file) => {
                    info!(
                        "{}: {} records, {} ignored, {} malformed",
                        file.path.display(),
                        file.records,
                        file.ignored,
                        file.malformed
                    );
                    dir_report.files.push(file);
                }
                Err(e) => match self.config.file_failures {
                    FileFailurePolicy::Abort => return Err(e),
                    FileFailurePolicy::Isolate => {
                        warn!(
                            "{} failed and stays claimed: {}",
                            outcome.path.display(),
                            e
                        );
                        dir_report.failures.push(FileFailure {
                            path: outcome.path,
                            error: e.to_string(),
                        });
                    }
                },
            }
        }

        dir_report.files.sort_by(|a, b| a.path.cmp(&b.path));
        dir_report.records = dir_report.files.iter().map(|f| f.records).sum();
        info!("{}: {} records", dir.display(), dir_report.records);
        Ok(dir_report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::IgnoredSink;
    use std::fs;
    use tempfile::TempDir;

    const GOOD: &str = "2022/05/01 12:00:00 log.go: 1.2.3.4:5555 HTTP/1.1 GET example.com /path \
                        map[User-Agent:[test]]";
    const BAD_ADDRESS: &str =
        "2022/05/01 12:00:00 log.go: 1.2.3.4 HTTP/1.1 GET example.com /path";

    fn config(workers: usize) -> IngestConfig {
        IngestConfig {
            workers,
            ..Default::default()
        }
    }

    async fn run(
        store: &LogStore,
        config: IngestConfig,
        dirs: &[&Path],
    ) -> (Result<IngestReport, IngestError>, String) {
        let sink = IgnoredSink::spawn(Vec::new(), 16);
        let result = IngestScheduler::new(store.clone(), config)
            .run(dirs, sink.sender())
            .await;
        let (buffer, _) = sink.finish().await.unwrap();
        (result, String::from_utf8(buffer).unwrap())
    }

    #[tokio::test]
    async fn test_ignored_and_blank_lines() {
        let dir = TempDir::new().unwrap();
        fs::write(
            dir.path().join("a.log"),
            format!("Listening on :80\n\n   \n{}\r\nsomething else\n", GOOD),
        )
        .unwrap();

        let store = LogStore::open_in_memory().unwrap();
        let (result, ignored) = run(&store, config(2), &[dir.path()]).await;
        let report = result.unwrap();

        assert_eq!(report.total, 1);
        let file = &report.directories[0].files[0];
        assert_eq!((file.records, file.ignored, file.malformed), (1, 2, 0));
        assert_eq!(ignored, "Listening on :80\nsomething else\n");
    }

    #[tokio::test]
    async fn test_malformed_line_skipped_by_default() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("a.log"), format!("{}\n{}\n", BAD_ADDRESS, GOOD)).unwrap();

        let store = LogStore::open_in_memory().unwrap();
        let (result, ignored) = run(&store, config(1), &[dir.path()]).await;
        let report = result.unwrap();

        assert_eq!(report.total, 1);
        assert_eq!(report.directories[0].files[0].malformed, 1);
        assert_eq!(ignored.trim_end(), BAD_ADDRESS);
    }

    #[tokio::test]
    async fn test_malformed_line_aborts_when_configured() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("a.log"), format!("{}\n{}\n", GOOD, BAD_ADDRESS)).unwrap();

        let store = LogStore::open_in_memory().unwrap();
        let cfg = IngestConfig {
            malformed_lines: MalformedLinePolicy::Abort,
            ..config(1)
        };
        let (result, _) = run(&store, cfg, &[dir.path()]).await;

        match result {
            Err(IngestError::Malformed { line, .. }) => assert_eq!(line, 2),
            other => panic!("expected malformed error, got {:?}", other),
        }
        // The file was claimed before parsing and keeps its partial rows
        let stats = store.stats().unwrap();
        assert_eq!((stats.files, stats.requests), (1, 1));
    }

    #[tokio::test]
    async fn test_isolated_failure_continues() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("a.log"), format!("{}\n", BAD_ADDRESS)).unwrap();
        fs::write(dir.path().join("b.log"), format!("{}\n{}\n", GOOD, GOOD)).unwrap();

        let store = LogStore::open_in_memory().unwrap();
        let cfg = IngestConfig {
            malformed_lines: MalformedLinePolicy::Abort,
            file_failures: FileFailurePolicy::Isolate,
            ..config(2)
        };
        let (result, _) = run(&store, cfg, &[dir.path()]).await;
        let report = result.unwrap();

        assert_eq!(report.total, 2);
        let failures: Vec<_> = report.failures().collect();
        assert_eq!(failures.len(), 1);
        assert!(failures[0].path.ends_with("a.log"));
    }

    #[tokio::test]
    async fn test_missing_directory_only_skips_that_directory() {
        let good = TempDir::new().unwrap();
        fs::write(good.path().join("a.log"), format!("{}\n", GOOD)).unwrap();
        let missing = good.path().join("does-not-exist");

        let store = LogStore::open_in_memory().unwrap();
        let (result, _) = run(&store, config(2), &[missing.as_path(), good.path()]).await;
        let report = result.unwrap();

        assert_eq!(report.directories.len(), 2);
        assert!(report.directories[0].scan_error.is_some());
        assert_eq!(report.directories[1].records, 1);
        assert_eq!(report.total, 1);
    }

    #[tokio::test]
    async fn test_subdirectories_are_not_ingested() {
        let dir = TempDir::new().unwrap();
        fs::create_dir(dir.path().join("nested")).unwrap();
        fs::write(dir.path().join("nested").join("a.log"), format!("{}\n", GOOD)).unwrap();

        let store = LogStore::open_in_memory().unwrap();
        let (result, _) = run(&store, config(2), &[dir.path()]).await;

        assert_eq!(result.unwrap().total, 0);
        assert_eq!(store.stats().unwrap().files, 0);
    }

    #[test]
    fn test_list_files_is_sorted() {
        let dir = TempDir::new().unwrap();
        for name in ["c", "a", "b"] {
            fs::write(dir.path().join(name), "").unwrap();
        }
        let names: Vec<_> = list_files(dir.path())
            .unwrap()
            .into_iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, ["a", "b", "c"]);
    }

    #[test]
    fn test_dedup_key_is_lexically_clean() {
        assert_eq!(dedup_key(Path::new("logs/a.log")), "logs/a.log");
        assert_eq!(dedup_key(Path::new("./logs/a.log")), "logs/a.log");
        assert_eq!(dedup_key(Path::new("logs/./a.log")), "logs/a.log");
        assert_eq!(dedup_key(Path::new("logs//a.log")), "logs/a.log");
        assert_eq!(dedup_key(Path::new("logs/old/../a.log")), "logs/a.log");
        assert_eq!(dedup_key(Path::new("../logs/a.log")), "../logs/a.log");
        assert_eq!(dedup_key(Path::new("/var/../../log/a")), "/log/a");
        assert_eq!(dedup_key(Path::new("./")), ".");
    }

    #[tokio::test]
    async fn test_stopped_worker_claims_nothing() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.log");
        fs::write(&path, format!("{}\n", GOOD)).unwrap();

        let store = LogStore::open_in_memory().unwrap();
        let sink = IgnoredSink::spawn(Vec::new(), 4);
        let ctx = WorkerContext {
            store: store.clone(),
            sources: SourceTags::default(),
            malformed_lines: MalformedLinePolicy::Skip,
            ignored: sink.sender(),
            stop: Arc::new(AtomicBool::new(true)),
        };
        let job = FileJob {
            name: dedup_key(&path),
            path,
        };

        assert!(matches!(ctx.ingest_file(&job), Err(IngestError::Stopped)));
        assert!(!store.has_file(&job.name).unwrap());

        drop(ctx);
        sink.finish().await.unwrap();
    }
}

//! Ignored Lines - Single-writer sink for lines that were not ingested
//!
//! Workers only send; one consumer on the blocking pool owns the writer, so
//! lines from different files never interleave mid-line.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("ignored-line sink is closed")]
    Closed,

    #[error("failed to write ignored lines: {0}")]
    Io(#[from] std::io::Error),

    #[error("ignored-line consumer task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Sending half handed to ingestion workers
#[derive(Clone)]
pub struct IgnoredSender {
    tx: mpsc::Sender<String>,
}

impl IgnoredSender {
    /// Send from a blocking context (worker threads)
    pub fn send_blocking(&self, line: &str) -> Result<(), SinkError> {
        self.tx
            .blocking_send(line.to_string())
            .map_err(|_| SinkError::Closed)
    }

    /// Send from async code
    pub async fn send(&self, line: &str) -> Result<(), SinkError> {
        self.tx
            .send(line.to_string())
            .await
            .map_err(|_| SinkError::Closed)
    }
}

/// Owns the consumer task and its writer
pub struct IgnoredSink<W> {
    tx: mpsc::Sender<String>,
    consumer: JoinHandle<Result<(W, u64), std::io::Error>>,
}

impl<W: Write + Send + 'static> IgnoredSink<W> {
    /// Start the consumer; must be called inside a tokio runtime
    pub fn spawn(mut writer: W, capacity: usize) -> Self {
        let (tx, mut rx) = mpsc::channel::<String>(capacity.max(1));

        let consumer = tokio::task::spawn_blocking(move || {
            let mut written = 0u64;
            while let Some(line) = rx.blocking_recv() {
                writeln!(writer, "{}", line)?;
                written += 1;
            }
            writer.flush()?;
            Ok((writer, written))
        });

        Self { tx, consumer }
    }

    pub fn sender(&self) -> IgnoredSender {
        IgnoredSender {
            tx: self.tx.clone(),
        }
    }

    /// Close the channel, drain it, and hand back the writer with the line count
    ///
    /// Every `IgnoredSender` must be dropped first, or this waits forever.
    pub async fn finish(self) -> Result<(W, u64), SinkError> {
        drop(self.tx);
        let (writer, written) = self.consumer.await??;
        debug!("Ignored-line sink closed after {} lines", written);
        Ok((writer, written))
    }
}

impl IgnoredSink<BufWriter<File>> {
    /// Sink into a file, truncating any previous contents
    pub fn create<P: AsRef<Path>>(path: P, capacity: usize) -> Result<Self, SinkError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let file = File::create(path)?;
        Ok(Self::spawn(BufWriter::new(file), capacity))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_lines_are_written_whole_and_counted() {
        let sink = IgnoredSink::spawn(Vec::new(), 4);
        let sender = sink.sender();

        let mut producers = Vec::new();
        for worker in 0..4 {
            let sender = sender.clone();
            producers.push(tokio::task::spawn_blocking(move || {
                for i in 0..25 {
                    sender
                        .send_blocking(&format!("worker {} line {}", worker, i))
                        .unwrap();
                }
            }));
        }
        for producer in producers {
            producer.await.unwrap();
        }
        sender.send("async line").await.unwrap();
        drop(sender);

        let (buffer, written) = sink.finish().await.unwrap();
        let text = String::from_utf8(buffer).unwrap();

        assert_eq!(written, 101);
        assert_eq!(text.lines().count(), 101);
        assert!(text.lines().all(|l| l.starts_with("worker ") || l == "async line"));
    }

    #[tokio::test]
    async fn test_create_truncates_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join(".ignored");
        std::fs::write(&path, "stale\n").unwrap();

        let sink = IgnoredSink::create(&path, 8).unwrap();
        sink.sender().send("fresh").await.unwrap();
        sink.finish().await.unwrap();

        assert_eq!(std::fs::read_to_string(&path).unwrap(), "fresh\n");
    }
}

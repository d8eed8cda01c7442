//! Persistence sinks
//!
//! The writer hands each `(symbol, stream)` batch to a `PersistenceSink`.
//! A sink must tolerate the same batch being retried after a failure.
//!
//! # File layout (`JsonLinesSink`)
//! ```text
//! <output_directory>/<SYMBOL>/<stream>_<SYMBOL>_<YYYYMMDD>.jsonl
//! ```
//! One JSON object per line. The date is the UTC day of each record's
//! ingestion time, so a batch straddling midnight lands in two files.

use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use thiserror::Error;
use tracing::{debug, info};
use types::ids::Symbol;
use types::market::StreamKind;

use crate::events::NormalizedRecord;

#[derive(Error, Debug)]
pub enum SinkError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Sink task failed: {0}")]
    Task(String),

    #[error("Write rejected: {0}")]
    Rejected(String),
}

/// Destination for record batches.
#[async_trait]
pub trait PersistenceSink: Send + Sync {
    async fn write_batch(
        &self,
        symbol: &Symbol,
        stream: StreamKind,
        records: &[NormalizedRecord],
    ) -> Result<(), SinkError>;

    /// Short label for logs and status.
    fn name(&self) -> &'static str;
}

// ── JSON lines ──────────────────────────────────────────────────────

/// Appends records as JSON lines, one file per symbol, stream and day.
pub struct JsonLinesSink {
    root: PathBuf,
}

impl JsonLinesSink {
    /// Create the sink, creating the output directory if needed.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, SinkError> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        info!(path = %root.display(), "JSON lines sink ready");
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// File that holds records of `stream` for `symbol` on the UTC day of
    /// `ingested_at` (Unix millis).
    pub fn file_path(&self, symbol: &Symbol, stream: StreamKind, ingested_at: i64) -> PathBuf {
        let day = Utc
            .timestamp_millis_opt(ingested_at)
            .single()
            .unwrap_or_default()
            .format("%Y%m%d");
        self.root
            .join(symbol.as_str())
            .join(format!("{}_{}_{}.jsonl", stream.as_str(), symbol, day))
    }

    fn append_lines(path: &Path, lines: &[String]) -> Result<(), SinkError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let mut writer = BufWriter::new(file);
        for line in lines {
            writer.write_all(line.as_bytes())?;
            writer.write_all(b"\n")?;
        }
        writer.flush()?;
        Ok(())
    }
}

#[async_trait]
impl PersistenceSink for JsonLinesSink {
    async fn write_batch(
        &self,
        symbol: &Symbol,
        stream: StreamKind,
        records: &[NormalizedRecord],
    ) -> Result<(), SinkError> {
        if records.is_empty() {
            return Ok(());
        }

        // BTreeMap keeps day files in date order
        let mut by_file: BTreeMap<PathBuf, Vec<String>> = BTreeMap::new();
        for record in records {
            let path = self.file_path(symbol, stream, record.ingested_at);
            by_file
                .entry(path)
                .or_default()
                .push(serde_json::to_string(record)?);
        }

        let files = by_file.len();
        tokio::task::spawn_blocking(move || {
            for (path, lines) in &by_file {
                Self::append_lines(path, lines)?;
            }
            Ok::<(), SinkError>(())
        })
        .await
        .map_err(|e| SinkError::Task(e.to_string()))??;

        debug!(
            symbol = %symbol,
            stream = %stream,
            records = records.len(),
            files,
            "Batch appended"
        );
        Ok(())
    }

    fn name(&self) -> &'static str {
        "jsonl"
    }
}

// ── Log only ────────────────────────────────────────────────────────

/// Logs batch sizes and discards the records. For dry runs.
#[derive(Debug, Default)]
pub struct LogSink;

#[async_trait]
impl PersistenceSink for LogSink {
    async fn write_batch(
        &self,
        symbol: &Symbol,
        stream: StreamKind,
        records: &[NormalizedRecord],
    ) -> Result<(), SinkError> {
        info!(
            symbol = %symbol,
            stream = %stream,
            records = records.len(),
            first_sequence = records.first().map(|r| r.exchange_sequence()),
            last_sequence = records.last().map(|r| r.exchange_sequence()),
            "Batch received"
        );
        Ok(())
    }

    fn name(&self) -> &'static str {
        "log"
    }
}

// ── In memory ───────────────────────────────────────────────────────

/// A batch as received by `MemorySink`.
#[derive(Debug, Clone)]
pub struct WrittenBatch {
    pub symbol: Symbol,
    pub stream: StreamKind,
    pub records: Vec<NormalizedRecord>,
}

/// Keeps every batch in memory. Can be told to fail the next N writes.
#[derive(Debug, Default)]
pub struct MemorySink {
    batches: Mutex<Vec<WrittenBatch>>,
    fail_next: AtomicU32,
    attempts: AtomicU32,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` writes fail.
    pub fn fail_next(&self, n: u32) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    /// All batches written so far, in write order.
    pub fn batches(&self) -> Vec<WrittenBatch> {
        self.batches.lock().map(|b| b.clone()).unwrap_or_default()
    }

    /// All records written so far, flattened in write order.
    pub fn records(&self) -> Vec<NormalizedRecord> {
        self.batches()
            .into_iter()
            .flat_map(|b| b.records)
            .collect()
    }

    /// Write attempts including failed ones.
    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PersistenceSink for MemorySink {
    async fn write_batch(
        &self,
        symbol: &Symbol,
        stream: StreamKind,
        records: &[NormalizedRecord],
    ) -> Result<(), SinkError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(SinkError::Rejected("injected failure".to_string()));
        }

        let mut batches = self
            .batches
            .lock()
            .map_err(|_| SinkError::Task("memory sink poisoned".to_string()))?;
        batches.push(WrittenBatch {
            symbol: symbol.clone(),
            stream,
            records: records.to_vec(),
        });
        Ok(())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

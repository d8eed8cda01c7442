//! Writer consumer
//!
//! Single consumer of the transport channel. Records are grouped per
//! `(symbol, stream)` and each group is handed to the sink when it reaches
//! `batch_size` or when the flush interval ticks, whichever comes first.
//!
//! A failed batch is retried as-is after `retry_backoff`. While a batch is
//! being retried nothing else is drained, so a stuck sink pushes
//! backpressure onto the producers instead of growing memory here. After
//! `escalate_after_failures` consecutive failures the supervisor is told.
//!
//! Buffered groups and the batch being written live in a `WriterState`
//! owned by the supervisor. A writer that panics or is aborted leaves them
//! there and its replacement writes them before reading anything new.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Mutex};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use types::ids::Symbol;
use types::market::StreamKind;

use crate::events::{now_ms, NormalizedRecord};
use crate::metrics::PipelineMetrics;
use crate::sink::{PersistenceSink, SinkError};
use crate::supervisor::{HealthEvent, HealthSender};
use crate::transport::SharedReceiver;

pub type BatchKey = (Symbol, StreamKind);

#[derive(Debug, Clone)]
pub struct WriterConfig {
    pub batch_size: usize,
    pub flush_interval: Duration,
    pub retry_backoff: Duration,
    pub escalate_after_failures: u32,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            batch_size: 500,
            flush_interval: Duration::from_millis(1000),
            retry_backoff: Duration::from_millis(500),
            escalate_after_failures: 5,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum WriterError {
    #[error("{records} records for {symbol}/{stream} not persisted at shutdown: {source}")]
    Unflushed {
        symbol: Symbol,
        stream: StreamKind,
        records: usize,
        #[source]
        source: SinkError,
    },
}

/// Accumulates records per `(symbol, stream)`.
pub struct BatchBuffer {
    batches: BTreeMap<BatchKey, Vec<NormalizedRecord>>,
    batch_size: usize,
    pending: usize,
}

impl BatchBuffer {
    pub fn new(batch_size: usize) -> Self {
        Self {
            batches: BTreeMap::new(),
            batch_size: batch_size.max(1),
            pending: 0,
        }
    }

    /// Add a record. Returns its group if that group is now full.
    pub fn add(&mut self, record: NormalizedRecord) -> Option<(BatchKey, Vec<NormalizedRecord>)> {
        let key = (record.symbol.clone(), record.stream_kind());
        let batch = self.batches.entry(key.clone()).or_default();
        batch.push(record);
        self.pending += 1;

        if batch.len() >= self.batch_size {
            let full = std::mem::take(batch);
            self.batches.remove(&key);
            self.pending -= full.len();
            Some((key, full))
        } else {
            None
        }
    }

    /// Take the first non-empty group in key order.
    pub fn take_next(&mut self) -> Option<(BatchKey, Vec<NormalizedRecord>)> {
        while let Some((key, records)) = self.batches.pop_first() {
            if !records.is_empty() {
                self.pending -= records.len();
                return Some((key, records));
            }
        }
        None
    }

    pub fn pending_count(&self) -> usize {
        self.pending
    }

    pub fn is_empty(&self) -> bool {
        self.pending == 0
    }
}

/// Records taken off the channel but not yet persisted.
pub struct WriterState {
    buffer: BatchBuffer,
    in_flight: Option<(BatchKey, Vec<NormalizedRecord>)>,
}

pub type SharedWriterState = Arc<Mutex<WriterState>>;

impl WriterState {
    pub fn new(batch_size: usize) -> Self {
        Self {
            buffer: BatchBuffer::new(batch_size),
            in_flight: None,
        }
    }

    pub fn shared(batch_size: usize) -> SharedWriterState {
        Arc::new(Mutex::new(Self::new(batch_size)))
    }

    /// Buffered records plus the batch that was being written, if any.
    pub fn unpersisted(&self) -> usize {
        let in_flight = self.in_flight.as_ref().map_or(0, |(_, batch)| batch.len());
        self.buffer.pending_count() + in_flight
    }
}

/// Writer health shared with the supervisor and status surface.
#[derive(Debug, Default)]
pub struct WriterStatus {
    last_heartbeat_ms: AtomicI64,
    backlog: AtomicUsize,
    consecutive_failures: AtomicU32,
    escalated: AtomicBool,
    batches_written: AtomicU64,
}

/// Point-in-time copy of `WriterStatus`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriterStatusSnapshot {
    pub last_heartbeat_ms: i64,
    /// Records held by the writer but not yet persisted.
    pub backlog: usize,
    pub consecutive_failures: u32,
    pub escalated: bool,
    pub batches_written: u64,
}

impl WriterStatus {
    pub fn new() -> Self {
        let status = Self::default();
        status.heartbeat();
        status
    }

    pub fn heartbeat(&self) {
        self.last_heartbeat_ms.store(now_ms(), Ordering::Relaxed);
    }

    pub fn last_heartbeat_ms(&self) -> i64 {
        self.last_heartbeat_ms.load(Ordering::Relaxed)
    }

    pub fn backlog(&self) -> usize {
        self.backlog.load(Ordering::Relaxed)
    }

    pub fn is_escalated(&self) -> bool {
        self.escalated.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> WriterStatusSnapshot {
        WriterStatusSnapshot {
            last_heartbeat_ms: self.last_heartbeat_ms(),
            backlog: self.backlog(),
            consecutive_failures: self.consecutive_failures.load(Ordering::Relaxed),
            escalated: self.is_escalated(),
            batches_written: self.batches_written.load(Ordering::Relaxed),
        }
    }
}

pub struct WriterConsumer {
    receiver: SharedReceiver,
    state: SharedWriterState,
    sink: Arc<dyn PersistenceSink>,
    config: WriterConfig,
    status: Arc<WriterStatus>,
    metrics: Arc<PipelineMetrics>,
    health: HealthSender,
}

impl WriterConsumer {
    pub fn new(
        receiver: SharedReceiver,
        state: SharedWriterState,
        sink: Arc<dyn PersistenceSink>,
        config: WriterConfig,
        status: Arc<WriterStatus>,
        metrics: Arc<PipelineMetrics>,
        health: HealthSender,
    ) -> Self {
        Self {
            receiver,
            state,
            sink,
            config,
            status,
            metrics,
            health,
        }
    }

    /// Drain the channel until `shutdown` flips to true or every sender is
    /// gone, then flush what is left.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<(), WriterError> {
        let receiver = Arc::clone(&self.receiver);
        let mut rx = receiver.lock().await;
        let state = Arc::clone(&self.state);
        let mut state = state.lock().await;
        let mut ticker = interval(self.config.flush_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.reset();

        info!(
            sink = self.sink.name(),
            batch_size = self.config.batch_size,
            flush_interval_ms = self.config.flush_interval.as_millis() as u64,
            resumed = state.unpersisted(),
            "Writer started"
        );

        // whatever the previous writer was holding goes out before new records
        self.write_in_flight(&mut state, &shutdown).await?;

        loop {
            self.status.heartbeat();
            tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                record = rx.recv() => match record {
                    Some(record) => {
                        if let Some(full) = state.buffer.add(record) {
                            state.in_flight = Some(full);
                            self.write_in_flight(&mut state, &shutdown).await?;
                        }
                    }
                    None => {
                        info!("Transport channel closed");
                        break;
                    }
                },
                _ = ticker.tick() => self.flush_buffered(&mut state, &shutdown).await?,
            }
            self.status.backlog.store(state.unpersisted(), Ordering::Relaxed);
        }

        // producers are stopped first, so whatever is queued now is final
        let mut drained = 0usize;
        while let Ok(record) = rx.try_recv() {
            drained += 1;
            if let Some(full) = state.buffer.add(record) {
                state.in_flight = Some(full);
                self.write_in_flight(&mut state, &shutdown).await?;
            }
        }
        self.flush_buffered(&mut state, &shutdown).await?;
        self.status.backlog.store(0, Ordering::Relaxed);

        info!(drained, "Writer stopped");
        Ok(())
    }

    async fn flush_buffered(
        &self,
        state: &mut WriterState,
        shutdown: &watch::Receiver<bool>,
    ) -> Result<(), WriterError> {
        while let Some(group) = state.buffer.take_next() {
            state.in_flight = Some(group);
            self.write_in_flight(state, shutdown).await?;
        }
        Ok(())
    }

    /// Write the in-flight batch, retrying the same records until the sink
    /// accepts them. The batch stays in `state` until it is persisted.
    /// During shutdown it is given up after `escalate_after_failures`
    /// attempts.
    async fn write_in_flight(
        &self,
        state: &mut WriterState,
        shutdown: &watch::Receiver<bool>,
    ) -> Result<(), WriterError> {
        let backlog = state.unpersisted();
        let Some(((symbol, stream), batch)) = state.in_flight.as_ref() else {
            return Ok(());
        };
        let stream = *stream;
        self.status.backlog.store(backlog, Ordering::Relaxed);

        let mut failures: u32 = 0;
        loop {
            self.status.heartbeat();
            match self.sink.write_batch(symbol, stream, batch).await {
                Ok(()) => {
                    let oldest = batch.iter().map(|r| r.ingested_at).min().unwrap_or_else(now_ms);
                    let latency_ms = (now_ms() - oldest).max(0) as u64;
                    self.metrics.record_batch_written(batch.len(), latency_ms);
                    self.status.batches_written.fetch_add(1, Ordering::Relaxed);
                    self.status.consecutive_failures.store(0, Ordering::Relaxed);
                    if self.status.escalated.swap(false, Ordering::Relaxed) {
                        info!(symbol = %symbol, stream = %stream, failures, "Sink recovered");
                        let _ = self.health.send(HealthEvent::WriterRecovered);
                    }
                    debug!(
                        symbol = %symbol,
                        stream = %stream,
                        records = batch.len(),
                        latency_ms,
                        "Batch persisted"
                    );
                    state.in_flight = None;
                    return Ok(());
                }
                Err(e) => {
                    failures += 1;
                    self.metrics.record_sink_failure();
                    self.status.consecutive_failures.store(failures, Ordering::Relaxed);
                    warn!(
                        symbol = %symbol,
                        stream = %stream,
                        records = batch.len(),
                        failures,
                        error = %e,
                        "Batch write failed, retrying"
                    );

                    if failures == self.config.escalate_after_failures {
                        self.status.escalated.store(true, Ordering::Relaxed);
                        error!(
                            symbol = %symbol,
                            stream = %stream,
                            failures,
                            "Sink keeps failing, escalating; draining paused"
                        );
                        let _ = self.health.send(HealthEvent::WriterEscalated {
                            symbol: symbol.clone(),
                            stream,
                            failures,
                            error: e.to_string(),
                        });
                    }

                    if *shutdown.borrow() && failures >= self.config.escalate_after_failures {
                        error!(
                            symbol = %symbol,
                            stream = %stream,
                            records = batch.len(),
                            "Giving up on batch during shutdown"
                        );
                        return Err(WriterError::Unflushed {
                            symbol: symbol.clone(),
                            stream,
                            records: batch.len(),
                            source: e,
                        });
                    }

                    tokio::time::sleep(self.config.retry_backoff).await;
                }
            }
        }
    }
}

//! Ingestion worker
//!
//! One worker per symbol. It owns the stream connection, the order book
//! engine and a publisher onto the transport channel, and runs until told
//! to stop.
//!
//! Within one connection the worker waits on exactly four things:
//!
//! ```text
//!   shutdown signal ─┐
//!   snapshot fetch ──┼──▶ select! ──▶ handle one event ──▶ publish
//!   stream message ──┤
//!   timers ──────────┘   (heartbeat, book summary)
//! ```
//!
//! A lost connection is retried every `reconnect_delay` for as long as the
//! worker runs, and each new connection starts the book from `Unsynced`.
//! Trade and candle messages need no state and resume as they arrive.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, info, info_span, warn, Instrument};
use types::ids::Symbol;
use types::market::StreamKind;

use crate::backpressure::{PublishError, Publisher};
use crate::delta::DepthDelta;
use crate::engine::{BookState, DeltaOutcome, EngineConfig, OrderBookEngine, SyncError};
use crate::error::FeedError;
use crate::events::{now_ms, BookSummaryEvent, NormalizedRecord, RecordPayload};
use crate::metrics::PipelineMetrics;
use crate::order_book::BookSummary;
use crate::snapshot::{Snapshot, SnapshotSource};
use crate::stream::{MarketStream, StreamConnector, StreamMessage};
use crate::supervisor::{HealthEvent, HealthSender};

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(1);

/// Everything one worker needs, resolved before spawn.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub symbol: Symbol,
    pub streams: Vec<StreamKind>,
    /// Publish a record for every merged snapshot.
    pub publish_snapshots: bool,
    /// Publish a summary record on every summary tick while synced.
    pub publish_summaries: bool,
    /// Levels requested from the snapshot endpoint.
    pub depth_limit: u32,
    pub reconnect_delay: Duration,
    /// Minimum spacing between two snapshot requests.
    pub resync_cooldown: Duration,
    pub summary_interval: Duration,
    pub summary_levels: usize,
    pub engine: EngineConfig,
}

impl WorkerConfig {
    pub fn new(symbol: Symbol, streams: Vec<StreamKind>) -> Self {
        Self {
            symbol,
            streams,
            publish_snapshots: true,
            publish_summaries: true,
            depth_limit: 1000,
            reconnect_delay: Duration::from_secs(5),
            resync_cooldown: Duration::from_secs(5),
            summary_interval: Duration::from_secs(10),
            summary_levels: 5,
            engine: EngineConfig::default(),
        }
    }

    fn wants(&self, kind: StreamKind) -> bool {
        self.streams.contains(&kind)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WorkerError {
    #[error("transport channel closed")]
    ChannelClosed,

    #[error("invalid worker configuration: {0}")]
    Config(String),
}

impl From<PublishError> for WorkerError {
    fn from(e: PublishError) -> Self {
        match e {
            PublishError::Closed => WorkerError::ChannelClosed,
        }
    }
}

/// Live view of one worker, shared with the supervisor.
#[derive(Debug)]
pub struct WorkerStatus {
    symbol: Symbol,
    last_heartbeat_ms: AtomicI64,
    state: AtomicU8,
    connected: AtomicBool,
    resync_storm: AtomicBool,
    messages: AtomicU64,
    updates_applied: AtomicU64,
    resync_count: AtomicU64,
    records_dropped: AtomicU64,
    summary: Mutex<Option<BookSummary>>,
}

/// Point-in-time copy of `WorkerStatus`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerStatusSnapshot {
    pub symbol: Symbol,
    pub last_heartbeat_ms: i64,
    pub book_state: BookState,
    pub connected: bool,
    pub resync_storm: bool,
    pub messages: u64,
    pub updates_applied: u64,
    pub resync_count: u64,
    pub records_dropped: u64,
    pub summary: Option<BookSummary>,
}

impl WorkerStatus {
    pub fn new(symbol: Symbol) -> Self {
        Self {
            symbol,
            last_heartbeat_ms: AtomicI64::new(now_ms()),
            state: AtomicU8::new(BookState::Unsynced.to_u8()),
            connected: AtomicBool::new(false),
            resync_storm: AtomicBool::new(false),
            messages: AtomicU64::new(0),
            updates_applied: AtomicU64::new(0),
            resync_count: AtomicU64::new(0),
            records_dropped: AtomicU64::new(0),
            summary: Mutex::new(None),
        }
    }

    pub fn symbol(&self) -> &Symbol {
        &self.symbol
    }

    pub fn heartbeat(&self) {
        self.last_heartbeat_ms.store(now_ms(), Ordering::Relaxed);
    }

    pub fn last_heartbeat_ms(&self) -> i64 {
        self.last_heartbeat_ms.load(Ordering::Relaxed)
    }

    pub fn book_state(&self) -> BookState {
        BookState::from_u8(self.state.load(Ordering::Relaxed))
    }

    pub fn resync_count(&self) -> u64 {
        self.resync_count.load(Ordering::Relaxed)
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> WorkerStatusSnapshot {
        WorkerStatusSnapshot {
            symbol: self.symbol.clone(),
            last_heartbeat_ms: self.last_heartbeat_ms(),
            book_state: self.book_state(),
            connected: self.is_connected(),
            resync_storm: self.resync_storm.load(Ordering::Relaxed),
            messages: self.messages.load(Ordering::Relaxed),
            updates_applied: self.updates_applied.load(Ordering::Relaxed),
            resync_count: self.resync_count(),
            records_dropped: self.records_dropped.load(Ordering::Relaxed),
            summary: self.summary.lock().ok().and_then(|s| s.clone()),
        }
    }

    /// Re-evaluate the resync window. The flag clears once old resyncs age
    /// out, not only when a new one happens.
    fn refresh_resync_storm(&self, engine: &mut OrderBookEngine) -> bool {
        let storm = engine.is_resync_storm();
        self.resync_storm.store(storm, Ordering::Relaxed);
        storm
    }

    fn observe(&self, engine: &OrderBookEngine) {
        let stats = engine.stats();
        self.state.store(engine.state().to_u8(), Ordering::Relaxed);
        self.updates_applied.store(stats.updates_applied, Ordering::Relaxed);
        self.resync_count.store(stats.resync_count, Ordering::Relaxed);
    }
}

type SnapshotFuture = Pin<Box<dyn Future<Output = Result<Snapshot, FeedError>> + Send>>;

/// How a connection ended.
enum SessionEnd {
    Shutdown,
    Disconnected,
}

pub struct IngestionWorker {
    config: WorkerConfig,
    connector: Arc<dyn StreamConnector>,
    snapshots: Arc<dyn SnapshotSource>,
    publisher: Publisher,
    engine: OrderBookEngine,
    status: Arc<WorkerStatus>,
    metrics: Arc<PipelineMetrics>,
    health: HealthSender,
    pending_snapshot: Option<SnapshotFuture>,
    last_snapshot_request: Option<Instant>,
}

impl IngestionWorker {
    pub fn new(
        config: WorkerConfig,
        connector: Arc<dyn StreamConnector>,
        snapshots: Arc<dyn SnapshotSource>,
        publisher: Publisher,
        status: Arc<WorkerStatus>,
        metrics: Arc<PipelineMetrics>,
        health: HealthSender,
    ) -> Self {
        Self {
            engine: OrderBookEngine::new(config.symbol.clone(), config.engine.clone()),
            config,
            connector,
            snapshots,
            publisher,
            status,
            metrics,
            health,
            pending_snapshot: None,
            last_snapshot_request: None,
        }
    }

    pub fn status(&self) -> Arc<WorkerStatus> {
        Arc::clone(&self.status)
    }

    /// Run until `shutdown` flips to true. Returns `Err` only for faults
    /// that retrying cannot fix.
    pub async fn run(self, shutdown: watch::Receiver<bool>) -> Result<(), WorkerError> {
        let span = info_span!("worker", symbol = %self.config.symbol);
        self.run_inner(shutdown).instrument(span).await
    }

    async fn run_inner(mut self, mut shutdown: watch::Receiver<bool>) -> Result<(), WorkerError> {
        if self.config.streams.is_empty() {
            return Err(WorkerError::Config("no streams enabled".to_string()));
        }
        let streams: Vec<StreamKind> = self
            .config
            .streams
            .iter()
            .copied()
            .filter(|k| StreamKind::SUBSCRIBABLE.contains(k))
            .collect();
        if streams.is_empty() {
            return Err(WorkerError::Config("no subscribable streams".to_string()));
        }

        info!(streams = ?streams, "Worker started");

        loop {
            if *shutdown.borrow() {
                break;
            }

            let connector = Arc::clone(&self.connector);
            let symbol = self.config.symbol.clone();
            let subscribe = streams.clone();
            let connect = async move { connector.connect(&symbol, &subscribe).await };
            let Some(connected) = until_stopped(connect, &mut shutdown, &self.status).await else {
                break;
            };

            match connected {
                Ok(stream) => {
                    self.status.connected.store(true, Ordering::Relaxed);
                    let end = self.session(stream, &mut shutdown).await;
                    self.status.connected.store(false, Ordering::Relaxed);
                    match end? {
                        SessionEnd::Shutdown => break,
                        SessionEnd::Disconnected => {
                            self.metrics.record_reconnect();
                            warn!(
                                delay_secs = self.config.reconnect_delay.as_secs_f64(),
                                "Connection lost, reconnecting"
                            );
                        }
                    }
                }
                Err(e) => {
                    warn!(
                        error = %e,
                        kind = e.kind(),
                        delay_secs = self.config.reconnect_delay.as_secs_f64(),
                        "Connect failed, retrying"
                    );
                }
            }

            let delay = tokio::time::sleep(self.config.reconnect_delay);
            if until_stopped(delay, &mut shutdown, &self.status).await.is_none() {
                break;
            }
        }

        let drained = self.publisher.drain().await?;
        info!(
            flushed = drained.sent,
            dropped = self.publisher.dropped(),
            "Worker stopped"
        );
        Ok(())
    }

    async fn session(
        &mut self,
        mut stream: Box<dyn MarketStream>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<SessionEnd, WorkerError> {
        self.engine.reset();
        self.pending_snapshot = None;
        self.status.observe(&self.engine);

        let mut heartbeat = interval(HEARTBEAT_INTERVAL);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut summary = interval(self.config.summary_interval);
        summary.set_missed_tick_behavior(MissedTickBehavior::Delay);
        summary.reset();

        loop {
            tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        stream.close().await;
                        return Ok(SessionEnd::Shutdown);
                    }
                }
                fetched = poll_snapshot(&mut self.pending_snapshot) => {
                    self.pending_snapshot = None;
                    self.on_snapshot_result(fetched).await?;
                }
                message = stream.next_message() => match message {
                    Some(Ok(message)) => self.on_message(message).await?,
                    Some(Err(e)) => {
                        self.metrics.record_decode_error();
                        warn!(error = %e, kind = e.kind(), "Skipping undecodable message");
                    }
                    None => {
                        stream.close().await;
                        return Ok(SessionEnd::Disconnected);
                    }
                },
                _ = heartbeat.tick() => {
                    self.status.heartbeat();
                    self.status.refresh_resync_storm(&mut self.engine);
                }
                _ = summary.tick() => self.on_summary_tick().await?,
            }
        }
    }

    async fn on_message(&mut self, message: StreamMessage) -> Result<(), WorkerError> {
        let ingested_at = now_ms();
        self.metrics.record_message();
        self.status.messages.fetch_add(1, Ordering::Relaxed);
        self.status.heartbeat();

        match message {
            StreamMessage::Trade(trade) => {
                let record = self.record(RecordPayload::Trade(trade), ingested_at);
                self.publish(vec![record]).await
            }
            StreamMessage::Candle(candle) => {
                let record = self.record(RecordPayload::Candle(candle), ingested_at);
                self.publish(vec![record]).await
            }
            StreamMessage::Depth(delta) => self.on_delta(delta, ingested_at).await,
        }
    }

    async fn on_delta(&mut self, delta: DepthDelta, ingested_at: i64) -> Result<(), WorkerError> {
        let outcome = self.engine.on_delta_at(delta, ingested_at);
        let result = match outcome {
            DeltaOutcome::SnapshotRequired => {
                self.request_snapshot(Duration::ZERO);
                Ok(())
            }
            DeltaOutcome::Buffered => {
                if self.engine.state() == BookState::Resyncing && self.pending_snapshot.is_none() {
                    self.request_snapshot(Duration::ZERO);
                }
                Ok(())
            }
            DeltaOutcome::Applied(update) => {
                self.metrics.record_book_update();
                let record = self.record(RecordPayload::BookUpdate(update), ingested_at);
                self.publish(vec![record]).await
            }
            DeltaOutcome::Stale => {
                debug!("Stale delta ignored");
                Ok(())
            }
            DeltaOutcome::ResyncRequired(err) => {
                self.on_resync(&err);
                self.request_snapshot(Duration::ZERO);
                Ok(())
            }
        };
        self.status.observe(&self.engine);
        result
    }

    async fn on_snapshot_result(&mut self, fetched: Result<Snapshot, FeedError>) -> Result<(), WorkerError> {
        let snapshot = match fetched {
            Ok(snapshot) => snapshot,
            Err(e) => {
                self.metrics.record_snapshot(false);
                warn!(
                    error = %e,
                    kind = e.kind(),
                    retry_in_secs = self.config.reconnect_delay.as_secs_f64(),
                    "Snapshot fetch failed"
                );
                self.request_snapshot(self.config.reconnect_delay);
                return Ok(());
            }
        };

        self.metrics.record_snapshot(true);
        let fetched_at = now_ms();
        let event = self.config.publish_snapshots.then(|| snapshot.to_event(fetched_at));

        let result = match self.engine.on_snapshot(snapshot) {
            Ok(merged) => {
                let mut records = Vec::with_capacity(merged.applied.len() + 1);
                if let Some(event) = event {
                    records.push(self.record(RecordPayload::BookSnapshotEvent(event), fetched_at));
                }
                for replayed in merged.applied {
                    self.metrics.record_book_update();
                    records.push(self.record(RecordPayload::BookUpdate(replayed.update), replayed.received_at));
                }
                if !merged.synced {
                    debug!(discarded = merged.discarded, "Waiting for a delta that bridges the snapshot");
                }
                self.publish(records).await
            }
            Err(SyncError::UnexpectedSnapshot { state }) => {
                debug!(state = ?state, "Dropping snapshot that is no longer wanted");
                Ok(())
            }
            Err(err) => {
                self.on_resync(&err);
                self.request_snapshot(Duration::ZERO);
                Ok(())
            }
        };
        self.status.observe(&self.engine);
        result
    }

    /// Start a snapshot fetch no earlier than `min_delay` from now and no
    /// earlier than `resync_cooldown` after the previous request.
    fn request_snapshot(&mut self, min_delay: Duration) {
        self.engine.begin_snapshot();

        let cooldown_left = self
            .last_snapshot_request
            .map(|at| self.config.resync_cooldown.saturating_sub(at.elapsed()))
            .unwrap_or(Duration::ZERO);
        let delay = cooldown_left.max(min_delay);
        self.last_snapshot_request = Some(Instant::now() + delay);

        let source = Arc::clone(&self.snapshots);
        let symbol = self.config.symbol.clone();
        let depth_limit = self.config.depth_limit;
        if !delay.is_zero() {
            debug!(delay_ms = delay.as_millis() as u64, "Snapshot request delayed");
        }
        self.pending_snapshot = Some(Box::pin(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            source.fetch(&symbol, depth_limit).await
        }));
    }

    fn on_resync(&mut self, err: &SyncError) {
        self.metrics.record_resync();
        if self.status.refresh_resync_storm(&mut self.engine) {
            let recent = self.engine.recent_resyncs();
            let _ = self.health.send(HealthEvent::ResyncStorm {
                symbol: self.config.symbol.clone(),
                recent,
                reason: err.to_string(),
            });
        }
    }

    fn record(&self, payload: RecordPayload, ingested_at: i64) -> NormalizedRecord {
        NormalizedRecord::with_ingested_at(self.config.symbol.clone(), payload, ingested_at)
    }

    async fn publish(&mut self, records: Vec<NormalizedRecord>) -> Result<(), WorkerError> {
        if records.is_empty() {
            return Ok(());
        }
        let report = self.publisher.publish(records).await?;
        if report.dropped > 0 {
            self.status
                .records_dropped
                .fetch_add(report.dropped as u64, Ordering::Relaxed);
        }
        Ok(())
    }

    /// Log the book and, while it is synced, persist the same view.
    async fn on_summary_tick(&mut self) -> Result<(), WorkerError> {
        if !self.config.wants(StreamKind::Depth) {
            return Ok(());
        }
        let summary = self.engine.summary(self.config.summary_levels);
        let stats = self.engine.stats();
        info!(
            state = self.engine.state().as_str(),
            best_bid = ?summary.best_bid.as_ref().map(|l| l.price),
            best_ask = ?summary.best_ask.as_ref().map(|l| l.price),
            spread = ?summary.spread,
            bid_levels = summary.bid_depth,
            ask_levels = summary.ask_depth,
            updates_applied = stats.updates_applied,
            resyncs = stats.resync_count,
            pending_publish = self.publisher.pending(),
            "Book summary"
        );
        if let Ok(mut slot) = self.status.summary.lock() {
            *slot = Some(summary.clone());
        }

        if !self.config.publish_summaries || self.engine.state() != BookState::Synced {
            return Ok(());
        }
        let generated_at = now_ms();
        let event = BookSummaryEvent {
            summary,
            updates_applied: stats.updates_applied,
            resync_count: stats.resync_count,
            generated_at,
        };
        let record = self.record(RecordPayload::BookSummary(event), generated_at);
        self.publish(vec![record]).await
    }
}

/// Drive `fut` to completion, keeping the heartbeat fresh. `None` if
/// shutdown was requested first.
async fn until_stopped<F: Future>(
    fut: F,
    shutdown: &mut watch::Receiver<bool>,
    status: &WorkerStatus,
) -> Option<F::Output> {
    tokio::pin!(fut);
    let mut heartbeat = interval(HEARTBEAT_INTERVAL);
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            biased;
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    return None;
                }
            }
            output = &mut fut => return Some(output),
            _ = heartbeat.tick() => status.heartbeat(),
        }
    }
}

async fn poll_snapshot(pending: &mut Option<SnapshotFuture>) -> Result<Snapshot, FeedError> {
    match pending {
        Some(fetch) => fetch.await,
        None => std::future::pending().await,
    }
}

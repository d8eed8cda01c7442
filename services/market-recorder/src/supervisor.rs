//! Supervisor
//!
//! Owns the lifecycle of every unit: one ingestion worker per symbol plus
//! the writer. Each unit is its own tokio task, so a panic in one symbol's
//! worker ends at its `JoinHandle` and never touches another unit's state.
//!
//! # Restart policy
//!
//! Restarts are driven by a per-role table rather than special cases:
//!
//! | role   | max restarts      | backoff                    |
//! |--------|-------------------|----------------------------|
//! | writer | `writer_max_restarts`, unbounded by default | `writer_restart_backoff` |
//! | worker | `worker_max_restarts` | `worker_restart_backoff` |
//!
//! A worker that fails once more after exhausting its restarts is marked
//! failed and left down. A writer that does the same is fatal: nothing
//! else drains the channel, so the supervisor stops the run. Failures are:
//! returning an error, panicking, returning `Ok` while not asked to stop,
//! or a heartbeat older than `liveness_timeout`.
//!
//! The writer's unpersisted records live in a `WriterState` held here, so
//! a restarted writer picks up the batch its predecessor was writing.
//!
//! # Shutdown
//!
//! Workers are stopped first so that the writer can drain everything they
//! published. Each phase waits up to `shutdown_grace` and aborts whatever
//! is still running after that. Records left in the writer state or the
//! channel afterwards are counted as dropped and make the run unclean.

use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinError, JoinHandle};
use tokio::time::{interval, timeout_at, Instant, MissedTickBehavior};
use tracing::{error, info, warn};
use types::ids::Symbol;
use types::market::StreamKind;

use crate::backpressure::{Publisher, PublisherConfig};
use crate::events::now_ms;
use crate::metrics::{AlertLevel, AlertThresholds, PipelineMetrics};
use crate::sink::PersistenceSink;
use crate::snapshot::SnapshotSource;
use crate::status::StatusRegistry;
use crate::stream::StreamConnector;
use crate::transport::{self, RecordSender, SharedReceiver};
use crate::worker::{IngestionWorker, WorkerConfig, WorkerStatus};
use crate::writer::{SharedWriterState, WriterConfig, WriterConsumer, WriterState, WriterStatus};

/// Health signals sent by units to the supervisor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthEvent {
    /// A symbol exceeded its resync threshold within the window.
    ResyncStorm {
        symbol: Symbol,
        recent: usize,
        reason: String,
    },
    /// The writer has failed the same batch repeatedly and paused draining.
    WriterEscalated {
        symbol: Symbol,
        stream: StreamKind,
        failures: u32,
        error: String,
    },
    WriterRecovered,
}

pub type HealthSender = mpsc::UnboundedSender<HealthEvent>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitRole {
    Writer,
    Worker,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RestartPolicy {
    /// `None` restarts forever.
    pub max_restarts: Option<u32>,
    pub backoff: Duration,
}

impl RestartPolicy {
    pub fn unbounded(backoff: Duration) -> Self {
        Self {
            max_restarts: None,
            backoff,
        }
    }

    pub fn bounded(max_restarts: u32, backoff: Duration) -> Self {
        Self {
            max_restarts: Some(max_restarts),
            backoff,
        }
    }

    /// Whether a unit that has already been restarted `restarts` times may
    /// be restarted again.
    pub fn allows(&self, restarts: u32) -> bool {
        match self.max_restarts {
            None => true,
            Some(max) => restarts < max,
        }
    }
}

/// Restart policy per unit role.
#[derive(Debug, Clone)]
pub struct RestartPolicyTable {
    policies: BTreeMap<UnitRole, RestartPolicy>,
}

impl RestartPolicyTable {
    pub fn new(writer: RestartPolicy, worker: RestartPolicy) -> Self {
        let mut policies = BTreeMap::new();
        policies.insert(UnitRole::Writer, writer);
        policies.insert(UnitRole::Worker, worker);
        Self { policies }
    }

    pub fn get(&self, role: UnitRole) -> RestartPolicy {
        self.policies
            .get(&role)
            .copied()
            .unwrap_or_else(|| RestartPolicy::bounded(0, Duration::ZERO))
    }
}

impl Default for RestartPolicyTable {
    fn default() -> Self {
        Self::new(
            RestartPolicy::unbounded(Duration::from_secs(1)),
            RestartPolicy::bounded(3, Duration::from_secs(1)),
        )
    }
}

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub mode: String,
    pub poll_interval: Duration,
    pub liveness_timeout: Duration,
    pub shutdown_grace: Duration,
    /// How often the status line is logged and alerts are checked.
    pub status_interval: Duration,
    pub channel_capacity: usize,
    pub writer: WriterConfig,
    pub publisher: PublisherConfig,
    pub policies: RestartPolicyTable,
    pub alert_thresholds: AlertThresholds,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            mode: "default".to_string(),
            poll_interval: Duration::from_millis(1000),
            liveness_timeout: Duration::from_secs(30),
            shutdown_grace: Duration::from_secs(10),
            status_interval: Duration::from_secs(10),
            channel_capacity: 10_000,
            writer: WriterConfig::default(),
            publisher: PublisherConfig::default(),
            policies: RestartPolicyTable::default(),
            alert_thresholds: AlertThresholds::default(),
        }
    }
}

/// External collaborators shared by every unit and every restart.
#[derive(Clone)]
pub struct Dependencies {
    pub connector: Arc<dyn StreamConnector>,
    pub snapshots: Arc<dyn SnapshotSource>,
    pub sink: Arc<dyn PersistenceSink>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SupervisorError {
    #[error("no enabled symbols to ingest")]
    NoWorkers,

    #[error("symbol {0} configured more than once")]
    DuplicateSymbol(Symbol),
}

/// Outcome of a supervised run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ShutdownReport {
    /// Every unit exited on its own within the grace period.
    pub clean: bool,
    pub workers_stopped: usize,
    pub workers_aborted: Vec<Symbol>,
    pub unit_errors: Vec<String>,
    pub writer_clean: bool,
    /// The writer exhausted its restarts and the run was stopped early.
    pub writer_failed: bool,
    /// Records that never reached the sink.
    pub records_unpersisted: usize,
    pub failed_symbols: Vec<Symbol>,
}

impl ShutdownReport {
    pub fn exit_code(&self) -> i32 {
        if self.clean {
            0
        } else {
            1
        }
    }
}

type UnitJoin = JoinHandle<Result<(), String>>;

struct WorkerSlot {
    config: WorkerConfig,
    status: Arc<WorkerStatus>,
    handle: Option<UnitJoin>,
    restarts: u32,
    restart_at: Option<Instant>,
    failed: bool,
}

struct WriterSlot {
    state: SharedWriterState,
    status: Arc<WriterStatus>,
    handle: Option<UnitJoin>,
    restarts: u32,
    restart_at: Option<Instant>,
    failed: bool,
}

pub struct Supervisor {
    config: SupervisorConfig,
    workers: Vec<WorkerConfig>,
    deps: Dependencies,
    metrics: Arc<PipelineMetrics>,
    sender: RecordSender,
    receiver: SharedReceiver,
    registry: Arc<StatusRegistry>,
    health_tx: HealthSender,
    health_rx: mpsc::UnboundedReceiver<HealthEvent>,
}

impl Supervisor {
    /// Validate the unit set and build the transport channel. Nothing is
    /// spawned until `run`.
    pub fn new(
        config: SupervisorConfig,
        workers: Vec<WorkerConfig>,
        deps: Dependencies,
        metrics: Arc<PipelineMetrics>,
    ) -> Result<Self, SupervisorError> {
        if workers.is_empty() {
            return Err(SupervisorError::NoWorkers);
        }
        let mut seen = BTreeSet::new();
        for worker in &workers {
            if !seen.insert(worker.symbol.clone()) {
                return Err(SupervisorError::DuplicateSymbol(worker.symbol.clone()));
            }
        }

        let (sender, receiver) = transport::channel(config.channel_capacity);
        let registry = Arc::new(StatusRegistry::new(
            config.mode.clone(),
            sender.clone(),
            Arc::clone(&metrics),
            Arc::new(WriterStatus::new()),
        ));
        let (health_tx, health_rx) = mpsc::unbounded_channel();

        Ok(Self {
            config,
            workers,
            deps,
            metrics,
            sender,
            receiver,
            registry,
            health_tx,
            health_rx,
        })
    }

    pub fn registry(&self) -> Arc<StatusRegistry> {
        Arc::clone(&self.registry)
    }

    /// Spawn every unit and supervise them until `shutdown` resolves.
    pub async fn run(mut self, shutdown: impl Future<Output = ()>) -> ShutdownReport {
        let (worker_stop, worker_stop_rx) = watch::channel(false);
        let (writer_stop, writer_stop_rx) = watch::channel(false);

        info!(
            mode = %self.config.mode,
            workers = self.workers.len(),
            channel_capacity = self.config.channel_capacity,
            "Supervisor starting"
        );

        let mut writer = WriterSlot {
            state: WriterState::shared(self.config.writer.batch_size),
            status: Arc::new(WriterStatus::new()),
            handle: None,
            restarts: 0,
            restart_at: None,
            failed: false,
        };
        self.spawn_writer(&mut writer, &writer_stop_rx);

        let mut slots: Vec<WorkerSlot> = std::mem::take(&mut self.workers)
            .into_iter()
            .map(|config| WorkerSlot {
                status: Arc::new(WorkerStatus::new(config.symbol.clone())),
                config,
                handle: None,
                restarts: 0,
                restart_at: None,
                failed: false,
            })
            .collect();
        for slot in slots.iter_mut() {
            self.spawn_worker(slot, &worker_stop_rx);
        }

        let mut poll = interval(self.config.poll_interval);
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut last_status = Instant::now();
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                biased;
                _ = &mut shutdown => {
                    info!("Shutdown requested");
                    break;
                }
                Some(event) = self.health_rx.recv() => self.on_health(event),
                _ = poll.tick() => {
                    if self.poll_writer(&mut writer, &writer_stop_rx).await {
                        error!("Writer cannot be restarted, stopping");
                        break;
                    }
                    for slot in slots.iter_mut() {
                        self.poll_worker(slot, &worker_stop_rx).await;
                    }
                    if last_status.elapsed() >= self.config.status_interval {
                        last_status = Instant::now();
                        self.log_status();
                    }
                }
            }
        }

        self.shutdown(slots, writer, worker_stop, writer_stop, writer_stop_rx)
            .await
    }

    fn spawn_worker(&self, slot: &mut WorkerSlot, stop: &watch::Receiver<bool>) {
        let status = Arc::new(WorkerStatus::new(slot.config.symbol.clone()));
        let publisher = Publisher::new(
            slot.config.symbol.clone(),
            self.sender.clone(),
            self.config.publisher.clone(),
            Arc::clone(&self.metrics),
        );
        let worker = IngestionWorker::new(
            slot.config.clone(),
            Arc::clone(&self.deps.connector),
            Arc::clone(&self.deps.snapshots),
            publisher,
            Arc::clone(&status),
            Arc::clone(&self.metrics),
            self.health_tx.clone(),
        );
        let stop = stop.clone();
        slot.handle = Some(tokio::spawn(async move {
            worker.run(stop).await.map_err(|e| e.to_string())
        }));
        slot.status = Arc::clone(&status);
        slot.restart_at = None;
        self.registry.set_worker(status, slot.restarts);
    }

    fn spawn_writer(&self, slot: &mut WriterSlot, stop: &watch::Receiver<bool>) {
        let status = Arc::new(WriterStatus::new());
        let writer = WriterConsumer::new(
            Arc::clone(&self.receiver),
            Arc::clone(&slot.state),
            Arc::clone(&self.deps.sink),
            self.config.writer.clone(),
            Arc::clone(&status),
            Arc::clone(&self.metrics),
            self.health_tx.clone(),
        );
        let stop = stop.clone();
        slot.handle = Some(tokio::spawn(async move {
            writer.run(stop).await.map_err(|e| e.to_string())
        }));
        slot.status = Arc::clone(&status);
        slot.restart_at = None;
        self.registry.set_writer(status, slot.restarts);
    }

    async fn poll_worker(&self, slot: &mut WorkerSlot, stop: &watch::Receiver<bool>) {
        if slot.failed {
            return;
        }
        let symbol = slot.config.symbol.clone();

        if slot.handle.is_none() {
            if slot.restart_at.is_some_and(|at| Instant::now() >= at) {
                info!(symbol = %symbol, restart = slot.restarts, "Restarting worker");
                self.spawn_worker(slot, stop);
            }
            return;
        }
        let Some(handle) = slot.handle.as_ref() else {
            return;
        };

        let failure = if handle.is_finished() {
            match slot.handle.take() {
                Some(handle) => Some(exit_reason(handle.await)),
                None => None,
            }
        } else if self.is_stale(slot.status.last_heartbeat_ms()) {
            handle.abort();
            slot.handle = None;
            Some(format!(
                "no heartbeat for more than {}s",
                self.config.liveness_timeout.as_secs()
            ))
        } else {
            None
        };

        let Some(reason) = failure else {
            return;
        };

        let policy = self.config.policies.get(UnitRole::Worker);
        if policy.allows(slot.restarts) {
            slot.restarts += 1;
            slot.restart_at = Some(Instant::now() + policy.backoff);
            self.registry.mark_worker_down(&symbol, false);
            warn!(
                symbol = %symbol,
                reason = %reason,
                restarts = slot.restarts,
                max_restarts = ?policy.max_restarts,
                backoff_ms = policy.backoff.as_millis() as u64,
                "Worker failed, scheduling restart"
            );
        } else {
            slot.failed = true;
            self.registry.mark_worker_down(&symbol, true);
            error!(
                symbol = %symbol,
                reason = %reason,
                restarts = slot.restarts,
                "Worker exceeded restart limit, symbol marked failed"
            );
        }
    }

    /// Returns true once the writer has failed for good.
    async fn poll_writer(&self, slot: &mut WriterSlot, stop: &watch::Receiver<bool>) -> bool {
        if slot.failed {
            return true;
        }
        if slot.handle.is_none() {
            if slot.restart_at.is_some_and(|at| Instant::now() >= at) {
                info!(restart = slot.restarts, "Restarting writer");
                self.spawn_writer(slot, stop);
            }
            return false;
        }
        let Some(handle) = slot.handle.as_ref() else {
            return false;
        };

        let failure = if handle.is_finished() {
            match slot.handle.take() {
                Some(handle) => Some(exit_reason(handle.await)),
                None => None,
            }
        } else if self.is_stale(slot.status.last_heartbeat_ms()) {
            handle.abort();
            if let Some(handle) = slot.handle.take() {
                // wait for the abort so the writer state is released
                let _ = handle.await;
            }
            Some("writer heartbeat stale".to_string())
        } else {
            None
        };

        let Some(reason) = failure else {
            return false;
        };

        let policy = self.config.policies.get(UnitRole::Writer);
        if policy.allows(slot.restarts) {
            slot.restarts += 1;
            slot.restart_at = Some(Instant::now() + policy.backoff);
            error!(
                reason = %reason,
                restarts = slot.restarts,
                max_restarts = ?policy.max_restarts,
                backoff_ms = policy.backoff.as_millis() as u64,
                "Writer failed, scheduling restart"
            );
            false
        } else {
            slot.failed = true;
            self.registry.mark_writer_failed();
            error!(
                reason = %reason,
                restarts = slot.restarts,
                "Writer exceeded restart limit"
            );
            true
        }
    }

    /// Count and discard what the writer never persisted: its buffered and
    /// in-flight records plus whatever is still queued in the channel. Only
    /// called once no writer task is running.
    async fn collect_unpersisted(&self, state: &SharedWriterState) -> usize {
        let held = state.lock().await.unpersisted();
        let mut rx = self.receiver.lock().await;
        let mut queued = 0usize;
        while rx.try_recv().is_ok() {
            queued += 1;
        }
        held + queued
    }

    fn is_stale(&self, last_heartbeat_ms: i64) -> bool {
        let age = now_ms().saturating_sub(last_heartbeat_ms);
        age > self.config.liveness_timeout.as_millis() as i64
    }

    fn on_health(&self, event: HealthEvent) {
        match event {
            HealthEvent::ResyncStorm { symbol, recent, reason } => {
                warn!(symbol = %symbol, recent, reason = %reason, "Resync threshold exceeded");
            }
            HealthEvent::WriterEscalated {
                symbol,
                stream,
                failures,
                error,
            } => {
                error!(
                    symbol = %symbol,
                    stream = %stream,
                    failures,
                    error = %error,
                    "Writer escalated sink failure; ingestion is backpressured until it recovers"
                );
            }
            HealthEvent::WriterRecovered => info!("Writer recovered"),
        }
    }

    fn log_status(&self) {
        let snapshot = self.registry.snapshot();
        info!(
            workers = snapshot.worker_count,
            failed = snapshot.failed_symbols.len(),
            occupancy = snapshot.channel_occupancy,
            capacity = snapshot.channel_capacity,
            writer_backlog = snapshot.writer.live.backlog,
            writer_restarts = snapshot.writer.restarts,
            "Supervisor status"
        );
        for alert in self.metrics.check_thresholds(&self.config.alert_thresholds) {
            match alert.level {
                AlertLevel::Critical => error!(metric = %alert.metric, "{}", alert.message),
                _ => warn!(metric = %alert.metric, "{}", alert.message),
            }
        }
    }

    async fn shutdown(
        &self,
        slots: Vec<WorkerSlot>,
        mut writer: WriterSlot,
        worker_stop: watch::Sender<bool>,
        writer_stop: watch::Sender<bool>,
        writer_stop_rx: watch::Receiver<bool>,
    ) -> ShutdownReport {
        let mut report = ShutdownReport {
            clean: true,
            writer_clean: !writer.failed,
            writer_failed: writer.failed,
            failed_symbols: slots
                .iter()
                .filter(|s| s.failed)
                .map(|s| s.config.symbol.clone())
                .collect(),
            ..ShutdownReport::default()
        };

        let _ = worker_stop.send(true);
        let deadline = Instant::now() + self.config.shutdown_grace;
        for mut slot in slots {
            let Some(mut handle) = slot.handle.take() else {
                continue;
            };
            let symbol = slot.config.symbol;
            match timeout_at(deadline, &mut handle).await {
                Ok(Ok(Ok(()))) => report.workers_stopped += 1,
                Ok(result) => {
                    let reason = exit_reason(result);
                    warn!(symbol = %symbol, reason = %reason, "Worker exited with error during shutdown");
                    report.clean = false;
                    report.unit_errors.push(format!("{symbol}: {reason}"));
                }
                Err(_) => {
                    handle.abort();
                    warn!(symbol = %symbol, "Worker did not stop in time, aborted");
                    report.clean = false;
                    report.workers_aborted.push(symbol);
                }
            }
        }

        let _ = writer_stop.send(true);
        if writer.failed {
            report.unit_errors.push("writer: exceeded restart limit".to_string());
        } else if writer.handle.is_none() {
            // writer was down; bring it back to drain the channel
            self.spawn_writer(&mut writer, &writer_stop_rx);
        }
        let deadline = Instant::now() + self.config.shutdown_grace;
        if let Some(mut handle) = writer.handle.take() {
            match timeout_at(deadline, &mut handle).await {
                Ok(Ok(Ok(()))) => {}
                Ok(result) => {
                    let reason = exit_reason(result);
                    error!(reason = %reason, "Writer exited with error during shutdown");
                    report.writer_clean = false;
                    report.unit_errors.push(format!("writer: {reason}"));
                }
                Err(_) => {
                    handle.abort();
                    let _ = handle.await;
                    error!("Writer did not drain in time, aborted");
                    report.writer_clean = false;
                }
            }
        }

        report.records_unpersisted = self.collect_unpersisted(&writer.state).await;
        if report.records_unpersisted > 0 {
            self.metrics.record_unpersisted(report.records_unpersisted);
            error!(records = report.records_unpersisted, "Records were never persisted");
            report.writer_clean = false;
        }
        report.clean &= report.writer_clean;

        info!(
            clean = report.clean,
            records_unpersisted = report.records_unpersisted,
            workers_stopped = report.workers_stopped,
            workers_aborted = report.workers_aborted.len(),
            failed_symbols = report.failed_symbols.len(),
            "Supervisor stopped"
        );
        report
    }
}

/// Describe why a unit's task ended, treating a plain `Ok` as unexpected.
fn exit_reason(result: Result<Result<(), String>, JoinError>) -> String {
    match result {
        Ok(Ok(())) => "exited without being asked to stop".to_string(),
        Ok(Err(e)) => e,
        Err(join) if join.is_panic() => {
            let payload = join.into_panic();
            let message = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            format!("panicked: {message}")
        }
        Err(_) => "cancelled".to_string(),
    }
}

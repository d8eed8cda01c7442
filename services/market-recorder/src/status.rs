//! Read-only process status
//!
//! The supervisor registers every unit here and keeps restart counts and
//! failure flags current. `StatusRegistry::snapshot` assembles a
//! serializable `StatusSnapshot` from the live atomics without pausing
//! anybody. When a listen address is configured the snapshot is served
//! over HTTP:
//!
//! - `GET /status`: the full snapshot
//! - `GET /health`: 200 while healthy, 503 otherwise

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::{Arc, RwLock};

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio::time::Instant;
use tower_http::trace::TraceLayer;
use tracing::info;
use types::ids::Symbol;

use crate::metrics::{Alert, PipelineMetrics};
use crate::transport::{self, RecordSender};
use crate::worker::{WorkerStatus, WorkerStatusSnapshot};
use crate::writer::{WriterStatus, WriterStatusSnapshot};

/// Status of one ingestion worker as seen by the supervisor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerReport {
    pub restarts: u32,
    pub failed: bool,
    #[serde(flatten)]
    pub live: WorkerStatusSnapshot,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriterReport {
    pub restarts: u32,
    /// Exhausted its restarts; nothing is being persisted.
    pub failed: bool,
    #[serde(flatten)]
    pub live: WriterStatusSnapshot,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub mode: String,
    pub uptime_secs: u64,
    /// Workers currently running.
    pub worker_count: usize,
    pub workers: Vec<WorkerReport>,
    pub failed_symbols: Vec<Symbol>,
    pub channel_occupancy: usize,
    pub channel_capacity: usize,
    pub writer: WriterReport,
    pub metrics: BTreeMap<String, u64>,
    pub alerts: Vec<Alert>,
    pub healthy: bool,
}

struct WorkerEntry {
    status: Arc<WorkerStatus>,
    restarts: u32,
    failed: bool,
    running: bool,
}

struct Units {
    workers: BTreeMap<Symbol, WorkerEntry>,
    writer: Arc<WriterStatus>,
    writer_restarts: u32,
    writer_failed: bool,
}

/// Shared between the supervisor (writer side) and status readers.
pub struct StatusRegistry {
    mode: String,
    started: Instant,
    sender: RecordSender,
    metrics: Arc<PipelineMetrics>,
    units: RwLock<Units>,
}

impl StatusRegistry {
    pub fn new(
        mode: impl Into<String>,
        sender: RecordSender,
        metrics: Arc<PipelineMetrics>,
        writer: Arc<WriterStatus>,
    ) -> Self {
        Self {
            mode: mode.into(),
            started: Instant::now(),
            sender,
            metrics,
            units: RwLock::new(Units {
                workers: BTreeMap::new(),
                writer,
                writer_restarts: 0,
                writer_failed: false,
            }),
        }
    }

    /// Register a worker, or replace its status after a restart.
    pub fn set_worker(&self, status: Arc<WorkerStatus>, restarts: u32) {
        if let Ok(mut units) = self.units.write() {
            units.workers.insert(
                status.symbol().clone(),
                WorkerEntry {
                    status,
                    restarts,
                    failed: false,
                    running: true,
                },
            );
        }
    }

    /// Record that a worker is down, and whether for good.
    pub fn mark_worker_down(&self, symbol: &Symbol, failed: bool) {
        if let Ok(mut units) = self.units.write() {
            if let Some(entry) = units.workers.get_mut(symbol) {
                entry.running = false;
                entry.failed = failed;
            }
        }
    }

    pub fn set_writer(&self, status: Arc<WriterStatus>, restarts: u32) {
        if let Ok(mut units) = self.units.write() {
            units.writer = status;
            units.writer_restarts = restarts;
        }
    }

    pub fn mark_writer_failed(&self) {
        if let Ok(mut units) = self.units.write() {
            units.writer_failed = true;
        }
    }

    pub fn metrics(&self) -> &PipelineMetrics {
        &self.metrics
    }

    pub fn channel_occupancy(&self) -> usize {
        transport::occupancy(&self.sender)
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        let (workers, failed_symbols, worker_count, writer) = match self.units.read() {
            Ok(units) => {
                let workers: Vec<WorkerReport> = units
                    .workers
                    .values()
                    .map(|entry| WorkerReport {
                        restarts: entry.restarts,
                        failed: entry.failed,
                        live: entry.status.snapshot(),
                    })
                    .collect();
                let failed: Vec<Symbol> = units
                    .workers
                    .iter()
                    .filter(|(_, e)| e.failed)
                    .map(|(s, _)| s.clone())
                    .collect();
                let running = units.workers.values().filter(|e| e.running).count();
                let writer = WriterReport {
                    restarts: units.writer_restarts,
                    failed: units.writer_failed,
                    live: units.writer.snapshot(),
                };
                (workers, failed, running, writer)
            }
            Err(_) => (
                Vec::new(),
                Vec::new(),
                0,
                WriterReport {
                    restarts: 0,
                    failed: false,
                    live: WriterStatusSnapshot::default(),
                },
            ),
        };

        let healthy = failed_symbols.is_empty() && !writer.failed && !writer.live.escalated;
        StatusSnapshot {
            mode: self.mode.clone(),
            uptime_secs: self.started.elapsed().as_secs(),
            worker_count,
            workers,
            failed_symbols,
            channel_occupancy: self.channel_occupancy(),
            channel_capacity: self.sender.max_capacity(),
            writer,
            metrics: self.metrics.export(),
            alerts: self.metrics.recent_alerts(),
            healthy,
        }
    }
}

async fn get_status(State(registry): State<Arc<StatusRegistry>>) -> Json<StatusSnapshot> {
    Json(registry.snapshot())
}

async fn get_health(State(registry): State<Arc<StatusRegistry>>) -> (StatusCode, Json<serde_json::Value>) {
    let snapshot = registry.snapshot();
    let code = if snapshot.healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    let body = serde_json::json!({
        "healthy": snapshot.healthy,
        "workers": snapshot.worker_count,
        "failed_symbols": snapshot.failed_symbols,
        "writer_escalated": snapshot.writer.live.escalated,
    });
    (code, Json(body))
}

pub fn create_router(registry: Arc<StatusRegistry>) -> Router {
    Router::new()
        .route("/status", get(get_status))
        .route("/health", get(get_health))
        .layer(TraceLayer::new_for_http())
        .with_state(registry)
}

/// Serve the status router until `shutdown` resolves.
pub async fn serve(
    addr: SocketAddr,
    registry: Arc<StatusRegistry>,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!(addr = %addr, "Status endpoint listening");
    axum::serve(listener, create_router(registry))
        .with_graceful_shutdown(shutdown)
        .await
}

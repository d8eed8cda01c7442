//! Pipeline metrics
//!
//! Process-wide counters shared by workers, the writer and the supervisor.
//! Everything is an atomic so the hot path never takes a lock; only the
//! latency window sits behind a mutex.
//!
//! Exposed through the status surface and checked against
//! `AlertThresholds` on every supervisor poll.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

/// Counters for the whole ingestion pipeline.
pub struct PipelineMetrics {
    // Ingestion
    pub messages_received: AtomicU64,
    pub decode_errors: AtomicU64,
    pub reconnects: AtomicU64,

    // Order books
    pub book_updates: AtomicU64,
    pub snapshots_fetched: AtomicU64,
    pub snapshot_failures: AtomicU64,
    pub resyncs: AtomicU64,

    // Transport
    pub records_published: AtomicU64,
    pub dropped_publish_timeout: AtomicU64,
    pub dropped_outbox_overflow: AtomicU64,
    pub dropped_unpersisted: AtomicU64,

    // Writer
    pub batches_written: AtomicU64,
    pub records_persisted: AtomicU64,
    pub sink_failures: AtomicU64,
    pub persist_latency_ms: Mutex<LatencyTracker>,

    pub alerts: Mutex<Vec<Alert>>,
}

impl PipelineMetrics {
    pub fn new() -> Self {
        Self {
            messages_received: AtomicU64::new(0),
            decode_errors: AtomicU64::new(0),
            reconnects: AtomicU64::new(0),
            book_updates: AtomicU64::new(0),
            snapshots_fetched: AtomicU64::new(0),
            snapshot_failures: AtomicU64::new(0),
            resyncs: AtomicU64::new(0),
            records_published: AtomicU64::new(0),
            dropped_publish_timeout: AtomicU64::new(0),
            dropped_outbox_overflow: AtomicU64::new(0),
            dropped_unpersisted: AtomicU64::new(0),
            batches_written: AtomicU64::new(0),
            records_persisted: AtomicU64::new(0),
            sink_failures: AtomicU64::new(0),
            persist_latency_ms: Mutex::new(LatencyTracker::new(1000)),
            alerts: Mutex::new(Vec::new()),
        }
    }

    pub fn record_message(&self) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_decode_error(&self) {
        self.decode_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_reconnect(&self) {
        self.reconnects.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_book_update(&self) {
        self.book_updates.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_snapshot(&self, ok: bool) {
        if ok {
            self.snapshots_fetched.fetch_add(1, Ordering::Relaxed);
        } else {
            self.snapshot_failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_resync(&self) {
        self.resyncs.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_published(&self) {
        self.records_published.fetch_add(1, Ordering::Relaxed);
    }

    /// A record dropped because the channel stayed full past the timeout.
    pub fn record_timeout_drop(&self) {
        self.dropped_publish_timeout.fetch_add(1, Ordering::Relaxed);
    }

    /// A record dropped because a producer's outbox was full.
    pub fn record_overflow_drop(&self) {
        self.dropped_outbox_overflow.fetch_add(1, Ordering::Relaxed);
    }

    /// Records still held by the writer or the channel when it stopped for good.
    pub fn record_unpersisted(&self, records: usize) {
        self.dropped_unpersisted.fetch_add(records as u64, Ordering::Relaxed);
    }

    /// Record a persisted batch and the ingest-to-persist latency of its
    /// oldest record.
    pub fn record_batch_written(&self, records: usize, oldest_latency_ms: u64) {
        self.batches_written.fetch_add(1, Ordering::Relaxed);
        self.records_persisted.fetch_add(records as u64, Ordering::Relaxed);
        if let Ok(mut tracker) = self.persist_latency_ms.lock() {
            tracker.record(oldest_latency_ms);
        }
    }

    pub fn record_sink_failure(&self) {
        self.sink_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Total records lost to overload or to a writer that could not finish.
    pub fn records_dropped(&self) -> u64 {
        self.dropped_publish_timeout.load(Ordering::Relaxed)
            + self.dropped_outbox_overflow.load(Ordering::Relaxed)
            + self.dropped_unpersisted.load(Ordering::Relaxed)
    }

    /// Check alert thresholds and generate alerts.
    pub fn check_thresholds(&self, thresholds: &AlertThresholds) -> Vec<Alert> {
        let mut alerts = Vec::new();

        let dropped = self.records_dropped();
        if dropped > thresholds.max_records_dropped {
            alerts.push(Alert {
                level: AlertLevel::Critical,
                metric: "records_dropped".to_string(),
                message: format!(
                    "Records dropped under backpressure: {} > threshold {}",
                    dropped, thresholds.max_records_dropped
                ),
            });
        }

        let sink_failures = self.sink_failures.load(Ordering::Relaxed);
        if sink_failures > thresholds.max_sink_failures {
            alerts.push(Alert {
                level: AlertLevel::Warning,
                metric: "sink_failures".to_string(),
                message: format!(
                    "Sink failures: {} > threshold {}",
                    sink_failures, thresholds.max_sink_failures
                ),
            });
        }

        let resyncs = self.resyncs.load(Ordering::Relaxed);
        if resyncs > thresholds.max_resyncs {
            alerts.push(Alert {
                level: AlertLevel::Warning,
                metric: "resyncs".to_string(),
                message: format!("Resyncs: {} > threshold {}", resyncs, thresholds.max_resyncs),
            });
        }

        if let Ok(tracker) = self.persist_latency_ms.lock() {
            if let Some(p99) = tracker.percentile(99) {
                if p99 > thresholds.max_persist_latency_p99_ms {
                    alerts.push(Alert {
                        level: AlertLevel::Warning,
                        metric: "persist_latency_p99".to_string(),
                        message: format!(
                            "Ingest-to-persist p99: {}ms > threshold {}ms",
                            p99, thresholds.max_persist_latency_p99_ms
                        ),
                    });
                }
            }
        }

        if let Ok(mut alert_store) = self.alerts.lock() {
            alert_store.extend(alerts.clone());
            let excess = alert_store.len().saturating_sub(MAX_STORED_ALERTS);
            alert_store.drain(..excess);
        }

        alerts
    }

    /// Most recent alerts, oldest first.
    pub fn recent_alerts(&self) -> Vec<Alert> {
        self.alerts.lock().map(|a| a.clone()).unwrap_or_default()
    }

    /// Export counters as a sorted map.
    pub fn export(&self) -> BTreeMap<String, u64> {
        let mut m = BTreeMap::new();
        let counters = [
            ("messages_received", &self.messages_received),
            ("decode_errors", &self.decode_errors),
            ("reconnects", &self.reconnects),
            ("book_updates", &self.book_updates),
            ("snapshots_fetched", &self.snapshots_fetched),
            ("snapshot_failures", &self.snapshot_failures),
            ("resyncs", &self.resyncs),
            ("records_published", &self.records_published),
            ("dropped_publish_timeout", &self.dropped_publish_timeout),
            ("dropped_outbox_overflow", &self.dropped_outbox_overflow),
            ("dropped_unpersisted", &self.dropped_unpersisted),
            ("batches_written", &self.batches_written),
            ("records_persisted", &self.records_persisted),
            ("sink_failures", &self.sink_failures),
        ];
        for (name, counter) in counters {
            m.insert(name.to_string(), counter.load(Ordering::Relaxed));
        }
        if let Ok(tracker) = self.persist_latency_ms.lock() {
            if let Some(p50) = tracker.percentile(50) {
                m.insert("persist_latency_p50_ms".to_string(), p50);
            }
            if let Some(p99) = tracker.percentile(99) {
                m.insert("persist_latency_p99_ms".to_string(), p99);
            }
        }
        m
    }
}

impl Default for PipelineMetrics {
    fn default() -> Self {
        Self::new()
    }
}

const MAX_STORED_ALERTS: usize = 100;

/// Sliding window of latency samples for percentile calculation.
pub struct LatencyTracker {
    samples: VecDeque<u64>,
    max_samples: usize,
}

impl LatencyTracker {
    pub fn new(max_samples: usize) -> Self {
        Self {
            samples: VecDeque::with_capacity(max_samples),
            max_samples,
        }
    }

    pub fn record(&mut self, value: u64) {
        if self.samples.len() >= self.max_samples {
            self.samples.pop_front();
        }
        self.samples.push_back(value);
    }

    /// Get a percentile value (0-100).
    pub fn percentile(&self, p: usize) -> Option<u64> {
        if self.samples.is_empty() {
            return None;
        }

        let mut sorted: Vec<u64> = self.samples.iter().copied().collect();
        sorted.sort_unstable();

        let idx = (p as f64 / 100.0 * (sorted.len() - 1) as f64) as usize;
        Some(sorted[idx.min(sorted.len() - 1)])
    }

    pub fn average(&self) -> Option<u64> {
        if self.samples.is_empty() {
            return None;
        }
        let sum: u64 = self.samples.iter().sum();
        Some(sum / self.samples.len() as u64)
    }

    pub fn count(&self) -> usize {
        self.samples.len()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertLevel {
    Info,
    Warning,
    Critical,
}

/// An alert triggered by threshold breach.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    pub level: AlertLevel,
    pub metric: String,
    pub message: String,
}

#[derive(Debug, Clone)]
pub struct AlertThresholds {
    /// Records lost to backpressure before a critical alert.
    pub max_records_dropped: u64,
    pub max_sink_failures: u64,
    pub max_resyncs: u64,
    pub max_persist_latency_p99_ms: u64,
}

impl Default for AlertThresholds {
    fn default() -> Self {
        Self {
            max_records_dropped: 0,
            max_sink_failures: 10,
            max_resyncs: 50,
            max_persist_latency_p99_ms: 5_000,
        }
    }
}

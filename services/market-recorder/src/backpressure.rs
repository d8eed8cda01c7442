//! Backpressure on the publish path
//!
//! Each worker publishes through its own `Publisher`: a bounded outbox in
//! front of the shared transport channel. A publish call blocks at most
//! `publish_timeout` waiting for channel capacity. When that runs out the
//! oldest unsent record of this producer is dropped and logged, and the
//! rest stay queued for the next call.
//!
//! Memory per producer is capped by `outbox_capacity`; beyond that the
//! configured `DropPolicy` decides which record goes.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::error::SendTimeoutError;
use tracing::{debug, warn};
use types::ids::Symbol;

use crate::events::NormalizedRecord;
use crate::metrics::PipelineMetrics;
use crate::transport::RecordSender;

/// Which record goes when a producer's outbox is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DropPolicy {
    /// Drop the oldest queued record to make room.
    #[default]
    DropOldest,
    /// Reject the incoming record.
    DropNewest,
}

/// Bounded FIFO of records not yet accepted by the channel.
#[derive(Debug)]
pub struct Outbox {
    records: VecDeque<NormalizedRecord>,
    capacity: usize,
    drop_policy: DropPolicy,
    dropped: u64,
}

impl Outbox {
    pub fn new(capacity: usize, drop_policy: DropPolicy) -> Self {
        let capacity = capacity.max(1);
        Self {
            records: VecDeque::with_capacity(capacity.min(4096)),
            capacity,
            drop_policy,
            dropped: 0,
        }
    }

    /// Queue a record. Returns the record that was dropped to make room,
    /// if any.
    pub fn push(&mut self, record: NormalizedRecord) -> Option<NormalizedRecord> {
        if self.records.len() < self.capacity {
            self.records.push_back(record);
            return None;
        }
        self.dropped += 1;
        match self.drop_policy {
            DropPolicy::DropOldest => {
                let evicted = self.records.pop_front();
                self.records.push_back(record);
                evicted
            }
            DropPolicy::DropNewest => Some(record),
        }
    }

    pub fn pop(&mut self) -> Option<NormalizedRecord> {
        self.records.pop_front()
    }

    /// Put a record back at the head after a failed send.
    pub fn push_front(&mut self, record: NormalizedRecord) {
        self.records.push_front(record);
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Records dropped on overflow since creation.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}

#[derive(Debug, Clone)]
pub struct PublisherConfig {
    pub publish_timeout: Duration,
    pub outbox_capacity: usize,
    pub drop_policy: DropPolicy,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            publish_timeout: Duration::from_millis(500),
            outbox_capacity: 1000,
            drop_policy: DropPolicy::DropOldest,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PublishError {
    #[error("transport channel closed")]
    Closed,
}

/// Result of one publish call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublishReport {
    /// Records accepted by the channel during this call.
    pub sent: usize,
    /// Records dropped during this call.
    pub dropped: usize,
}

/// One producer's handle onto the transport channel.
pub struct Publisher {
    symbol: Symbol,
    sender: RecordSender,
    outbox: Outbox,
    config: PublisherConfig,
    metrics: Arc<PipelineMetrics>,
    sent: u64,
    timed_out: u64,
}

impl Publisher {
    pub fn new(
        symbol: Symbol,
        sender: RecordSender,
        config: PublisherConfig,
        metrics: Arc<PipelineMetrics>,
    ) -> Self {
        Self {
            outbox: Outbox::new(config.outbox_capacity, config.drop_policy),
            symbol,
            sender,
            config,
            metrics,
            sent: 0,
            timed_out: 0,
        }
    }

    /// Queue `records` in order and push as many as the channel accepts.
    pub async fn publish(
        &mut self,
        records: impl IntoIterator<Item = NormalizedRecord>,
    ) -> Result<PublishReport, PublishError> {
        let mut report = PublishReport::default();
        for record in records {
            if let Some(lost) = self.outbox.push(record) {
                report.dropped += 1;
                self.metrics.record_overflow_drop();
                warn!(
                    symbol = %self.symbol,
                    record_type = lost.record_type_label(),
                    sequence = lost.exchange_sequence(),
                    outbox_dropped = self.outbox.dropped(),
                    "Outbox full, dropping record"
                );
            }
        }
        let flushed = self.flush().await?;
        report.sent += flushed.sent;
        report.dropped += flushed.dropped;
        Ok(report)
    }

    /// Send queued records until the outbox is empty or one send times out.
    ///
    /// A timeout drops the record that could not be sent, which is always
    /// the oldest unsent one, and ends the call.
    pub async fn flush(&mut self) -> Result<PublishReport, PublishError> {
        let mut report = PublishReport::default();
        while let Some(record) = self.outbox.pop() {
            match self.sender.send_timeout(record, self.config.publish_timeout).await {
                Ok(()) => {
                    report.sent += 1;
                    self.sent += 1;
                    self.metrics.record_published();
                }
                Err(SendTimeoutError::Timeout(lost)) => {
                    report.dropped += 1;
                    self.timed_out += 1;
                    self.metrics.record_timeout_drop();
                    warn!(
                        symbol = %self.symbol,
                        record_type = lost.record_type_label(),
                        sequence = lost.exchange_sequence(),
                        timeout_ms = self.config.publish_timeout.as_millis() as u64,
                        pending = self.outbox.len(),
                        "Transport channel full, dropped oldest unsent record"
                    );
                    break;
                }
                Err(SendTimeoutError::Closed(record)) => {
                    self.outbox.push_front(record);
                    return Err(PublishError::Closed);
                }
            }
        }
        Ok(report)
    }

    /// Flush everything still queued before the worker exits. Each record
    /// left gets at most one timeout's worth of waiting.
    pub async fn drain(&mut self) -> Result<PublishReport, PublishError> {
        let mut total = PublishReport::default();
        while !self.outbox.is_empty() {
            let report = self.flush().await?;
            total.sent += report.sent;
            total.dropped += report.dropped;
        }
        if total.sent > 0 || total.dropped > 0 {
            debug!(
                symbol = %self.symbol,
                sent = total.sent,
                dropped = total.dropped,
                "Outbox drained"
            );
        }
        Ok(total)
    }

    pub fn pending(&self) -> usize {
        self.outbox.len()
    }

    pub fn sent(&self) -> u64 {
        self.sent
    }

    /// Records lost to timeouts plus outbox overflow.
    pub fn dropped(&self) -> u64 {
        self.timed_out + self.outbox.dropped()
    }
}

//! Order book synchronization engine
//!
//! Merges an out-of-band snapshot with the live delta stream into a local
//! book that, whenever it reports `last_applied_id`, equals the exchange
//! book at that update id.
//!
//! ```text
//!  UNSYNCED ──first delta──▶ SNAPSHOTTING ──snapshot──▶ BUFFERING ──bridge──▶ SYNCED
//!                               ▲                          │                   │
//!                               │                      too old              gap
//!                               │                          ▼                   │
//!                               └────begin_snapshot──── RESYNCING ◀────────────┘
//! ```
//!
//! The engine performs no I/O. It tells the caller when a snapshot is
//! needed (`DeltaOutcome::SnapshotRequired` / `ResyncRequired`) and the
//! caller feeds the result back through `on_snapshot`. Deltas that arrive
//! meanwhile are buffered in arrival order, up to `buffer_capacity`.
//!
//! Rules:
//! - A delta whose `final_update_id <= last_applied_id` is a no-op.
//! - After a snapshot `S`, the first applied delta must cover `S + 1`.
//! - Every later delta must pass the continuity check of the configured
//!   `SequencePolicy`, or the book is dropped and resynchronized.

use std::collections::VecDeque;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, warn};
use types::ids::Symbol;

use crate::delta::DepthDelta;
use crate::events::{now_ms, BookUpdate};
use crate::order_book::{BookSummary, LocalOrderBook};
use crate::snapshot::Snapshot;

/// Synchronization state of a book.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BookState {
    /// Nothing received yet.
    Unsynced,
    /// Snapshot requested; deltas are buffered.
    Snapshotting,
    /// Snapshot loaded; waiting for the delta that bridges it.
    Buffering,
    /// Book is live.
    Synced,
    /// Gap found; book dropped, a new snapshot is due.
    Resyncing,
}

impl BookState {
    pub fn as_str(&self) -> &'static str {
        match self {
            BookState::Unsynced => "unsynced",
            BookState::Snapshotting => "snapshotting",
            BookState::Buffering => "buffering",
            BookState::Synced => "synced",
            BookState::Resyncing => "resyncing",
        }
    }

    pub(crate) fn to_u8(self) -> u8 {
        match self {
            BookState::Unsynced => 0,
            BookState::Snapshotting => 1,
            BookState::Buffering => 2,
            BookState::Synced => 3,
            BookState::Resyncing => 4,
        }
    }

    pub(crate) fn from_u8(value: u8) -> Self {
        match value {
            1 => BookState::Snapshotting,
            2 => BookState::Buffering,
            3 => BookState::Synced,
            4 => BookState::Resyncing,
            _ => BookState::Unsynced,
        }
    }
}

/// Continuity rule applied to deltas on a synced book.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SequencePolicy {
    /// `first == last + 1`, and `pu == last` whenever `pu` is present.
    #[default]
    Strict,
    /// `pu == last` whenever `pu` is present, otherwise `first == last + 1`.
    PreviousFinal,
}

/// Reasons the engine abandons a book.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SyncError {
    #[error("sequence gap: expected first update {expected}, got {first}..{last}")]
    Gap { expected: u64, first: u64, last: u64 },

    #[error("previous final update mismatch: expected {expected}, got {actual}")]
    PreviousFinalMismatch { expected: u64, actual: u64 },

    #[error("snapshot {snapshot_id} is older than buffered deltas starting at {first_buffered}")]
    SnapshotTooOld { snapshot_id: u64, first_buffered: u64 },

    #[error("snapshot arrived while {state:?}")]
    UnexpectedSnapshot { state: BookState },
}

/// Result of feeding one delta to the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeltaOutcome {
    /// First delta on an unsynced book: fetch a snapshot.
    SnapshotRequired,
    /// Held until the pending snapshot is merged.
    Buffered,
    /// Applied to the book.
    Applied(BookUpdate),
    /// Already reflected in the book.
    Stale,
    /// Continuity failed: the book was dropped and a snapshot is needed.
    ResyncRequired(SyncError),
}

/// A buffered delta applied during a merge, with its original arrival time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplayedUpdate {
    pub update: BookUpdate,
    /// Local Unix millis at which the delta was received.
    pub received_at: i64,
}

/// Result of merging a snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeOutcome {
    /// Buffered deltas applied on top of the snapshot, in order.
    pub applied: Vec<ReplayedUpdate>,
    /// Buffered deltas discarded as already covered by the snapshot.
    pub discarded: usize,
    /// False when no buffered delta bridges the snapshot yet.
    pub synced: bool,
}

/// Engine tuning.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Maximum deltas held while waiting for a snapshot.
    pub buffer_capacity: usize,
    /// Levels kept per side after each update. Zero keeps everything.
    pub max_depth: usize,
    pub sequence_policy: SequencePolicy,
    /// Resyncs tolerated within `resync_window` before the book is
    /// reported unhealthy.
    pub resync_threshold: u32,
    pub resync_window: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            buffer_capacity: 1000,
            max_depth: 1000,
            sequence_policy: SequencePolicy::Strict,
            resync_threshold: 5,
            resync_window: Duration::from_secs(60),
        }
    }
}

/// Counts resyncs inside a sliding time window.
#[derive(Debug, Clone)]
pub struct ResyncTracker {
    window: Duration,
    threshold: u32,
    recent: VecDeque<Instant>,
    total: u64,
}

impl ResyncTracker {
    pub fn new(threshold: u32, window: Duration) -> Self {
        Self {
            window,
            threshold,
            recent: VecDeque::new(),
            total: 0,
        }
    }

    /// Record a resync at `now`. Returns true when the threshold is
    /// exceeded within the window.
    pub fn record(&mut self, now: Instant) -> bool {
        self.total += 1;
        self.recent.push_back(now);
        self.is_exceeded(now)
    }

    /// Whether more than `threshold` resyncs happened within the window.
    pub fn is_exceeded(&mut self, now: Instant) -> bool {
        self.evict(now);
        self.recent.len() > self.threshold as usize
    }

    pub fn recent(&mut self, now: Instant) -> usize {
        self.evict(now);
        self.recent.len()
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    fn evict(&mut self, now: Instant) {
        while let Some(oldest) = self.recent.front() {
            if now.duration_since(*oldest) > self.window {
                self.recent.pop_front();
            } else {
                break;
            }
        }
    }
}

/// Counters exposed for status and metrics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineStats {
    pub deltas_received: u64,
    pub updates_applied: u64,
    pub stale_dropped: u64,
    pub buffer_evictions: u64,
    pub snapshots_merged: u64,
    pub resync_count: u64,
}

/// Per-symbol synchronization state machine. Sole owner of its book.
pub struct OrderBookEngine {
    config: EngineConfig,
    state: BookState,
    book: LocalOrderBook,
    /// Deltas with their arrival time.
    buffer: VecDeque<(DepthDelta, i64)>,
    resyncs: ResyncTracker,
    stats: EngineStats,
}

impl OrderBookEngine {
    pub fn new(symbol: Symbol, config: EngineConfig) -> Self {
        debug!(
            symbol = %symbol,
            buffer_capacity = config.buffer_capacity,
            policy = ?config.sequence_policy,
            "OrderBookEngine initialized"
        );
        Self {
            resyncs: ResyncTracker::new(config.resync_threshold, config.resync_window),
            buffer: VecDeque::with_capacity(config.buffer_capacity.min(4096)),
            book: LocalOrderBook::new(symbol),
            state: BookState::Unsynced,
            stats: EngineStats::default(),
            config,
        }
    }

    /// Create an engine with default configuration.
    pub fn with_defaults(symbol: Symbol) -> Self {
        Self::new(symbol, EngineConfig::default())
    }

    /// Feed one delta, in stream order, received now.
    pub fn on_delta(&mut self, delta: DepthDelta) -> DeltaOutcome {
        self.on_delta_at(delta, now_ms())
    }

    /// Feed one delta that arrived at `received_at` (Unix millis). The time
    /// travels with the delta if it has to wait for a snapshot.
    pub fn on_delta_at(&mut self, delta: DepthDelta, received_at: i64) -> DeltaOutcome {
        self.stats.deltas_received += 1;

        match self.state {
            BookState::Unsynced => {
                self.push_buffered(delta, received_at);
                self.state = BookState::Snapshotting;
                DeltaOutcome::SnapshotRequired
            }
            BookState::Snapshotting | BookState::Resyncing => {
                self.push_buffered(delta, received_at);
                DeltaOutcome::Buffered
            }
            BookState::Buffering => {
                let Some(last) = self.book.last_applied_id() else {
                    return self.resync(delta, received_at, SyncError::UnexpectedSnapshot { state: self.state });
                };
                if delta.is_stale(last) {
                    self.stats.stale_dropped += 1;
                    return DeltaOutcome::Stale;
                }
                if delta.covers(last + 1) {
                    let update = self.apply(delta);
                    self.state = BookState::Synced;
                    info!(
                        symbol = %self.book.symbol(),
                        last_applied = update.delta.final_update_id,
                        "Order book synchronized"
                    );
                    DeltaOutcome::Applied(update)
                } else {
                    let err = SyncError::Gap {
                        expected: last + 1,
                        first: delta.first_update_id,
                        last: delta.final_update_id,
                    };
                    self.resync(delta, received_at, err)
                }
            }
            BookState::Synced => {
                let Some(last) = self.book.last_applied_id() else {
                    return self.resync(delta, received_at, SyncError::UnexpectedSnapshot { state: self.state });
                };
                if delta.is_stale(last) {
                    self.stats.stale_dropped += 1;
                    return DeltaOutcome::Stale;
                }
                match self.check_continuity(&delta, last) {
                    Ok(()) => DeltaOutcome::Applied(self.apply(delta)),
                    Err(err) => self.resync(delta, received_at, err),
                }
            }
        }
    }

    /// Mark a snapshot request as issued. Valid from `Unsynced`,
    /// `Resyncing` and `Snapshotting` (a retry).
    pub fn begin_snapshot(&mut self) {
        match self.state {
            BookState::Unsynced | BookState::Resyncing | BookState::Snapshotting => {
                self.state = BookState::Snapshotting;
            }
            BookState::Buffering | BookState::Synced => {
                debug!(state = ?self.state, "Snapshot request ignored");
            }
        }
    }

    /// Merge a fetched snapshot with the buffered deltas.
    ///
    /// On `Err` the snapshot is discarded, the engine is `Resyncing` and
    /// the buffer is kept for the next attempt.
    pub fn on_snapshot(&mut self, snapshot: Snapshot) -> Result<MergeOutcome, SyncError> {
        if self.state != BookState::Snapshotting {
            return Err(SyncError::UnexpectedSnapshot { state: self.state });
        }

        let snapshot_id = snapshot.last_update_id;
        self.book = LocalOrderBook::from_snapshot(self.book.symbol().clone(), &snapshot);
        self.book.trim(self.config.max_depth);
        self.state = BookState::Buffering;
        self.stats.snapshots_merged += 1;

        let before = self.buffer.len();
        self.buffer.retain(|(d, _)| !d.is_stale(snapshot_id));
        let discarded = before - self.buffer.len();
        self.stats.stale_dropped += discarded as u64;

        let Some((front, _)) = self.buffer.front() else {
            debug!(
                symbol = %self.book.symbol(),
                snapshot_id,
                discarded,
                "Snapshot loaded, waiting for bridging delta"
            );
            return Ok(MergeOutcome {
                applied: Vec::new(),
                discarded,
                synced: false,
            });
        };

        if !front.covers(snapshot_id + 1) {
            let err = SyncError::SnapshotTooOld {
                snapshot_id,
                first_buffered: front.first_update_id,
            };
            self.abandon_snapshot(&err);
            return Err(err);
        }

        let mut applied = Vec::with_capacity(self.buffer.len());
        let mut first = true;
        while let Some((delta, received_at)) = self.buffer.pop_front() {
            let Some(last) = self.book.last_applied_id() else {
                break;
            };
            if delta.is_stale(last) {
                self.stats.stale_dropped += 1;
                continue;
            }
            if !first {
                if let Err(err) = self.check_continuity(&delta, last) {
                    self.buffer.push_front((delta, received_at));
                    self.abandon_snapshot(&err);
                    return Err(err);
                }
            }
            first = false;
            applied.push(ReplayedUpdate {
                update: self.apply(delta),
                received_at,
            });
        }

        self.state = BookState::Synced;
        info!(
            symbol = %self.book.symbol(),
            snapshot_id,
            discarded,
            replayed = applied.len(),
            last_applied = ?self.book.last_applied_id(),
            "Order book synchronized from snapshot"
        );

        Ok(MergeOutcome {
            applied,
            discarded,
            synced: true,
        })
    }

    /// Forget everything and return to `Unsynced`. Used after reconnects.
    pub fn reset(&mut self) {
        self.book.clear();
        self.buffer.clear();
        self.state = BookState::Unsynced;
    }

    pub fn state(&self) -> BookState {
        self.state
    }

    pub fn book(&self) -> &LocalOrderBook {
        &self.book
    }

    /// `Some` only while the book reflects a known exchange update id.
    pub fn last_applied_id(&self) -> Option<u64> {
        match self.state {
            BookState::Synced | BookState::Buffering => self.book.last_applied_id(),
            _ => None,
        }
    }

    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }

    pub fn stats(&self) -> EngineStats {
        self.stats
    }

    /// Whether resyncs in the recent window exceed the threshold.
    pub fn is_resync_storm(&mut self) -> bool {
        self.resyncs.is_exceeded(Instant::now())
    }

    pub fn recent_resyncs(&mut self) -> usize {
        self.resyncs.recent(Instant::now())
    }

    pub fn summary(&self, levels: usize) -> BookSummary {
        self.book.summary(levels)
    }

    fn check_continuity(&self, delta: &DepthDelta, last: u64) -> Result<(), SyncError> {
        let first_ok = || {
            if delta.first_update_id == last + 1 {
                Ok(())
            } else {
                Err(SyncError::Gap {
                    expected: last + 1,
                    first: delta.first_update_id,
                    last: delta.final_update_id,
                })
            }
        };
        let prev_ok = |pu: u64| {
            if pu == last {
                Ok(())
            } else {
                Err(SyncError::PreviousFinalMismatch {
                    expected: last,
                    actual: pu,
                })
            }
        };

        match (self.config.sequence_policy, delta.prev_final_update_id) {
            (SequencePolicy::Strict, Some(pu)) => first_ok().and_then(|_| prev_ok(pu)),
            (SequencePolicy::PreviousFinal, Some(pu)) => prev_ok(pu),
            (_, None) => first_ok(),
        }
    }

    fn apply(&mut self, delta: DepthDelta) -> BookUpdate {
        self.book.apply_delta(&delta);
        self.book.trim(self.config.max_depth);
        self.stats.updates_applied += 1;
        BookUpdate {
            best_bid: self.book.best_bid(),
            best_ask: self.book.best_ask(),
            delta,
        }
    }

    fn push_buffered(&mut self, delta: DepthDelta, received_at: i64) {
        if self.buffer.len() >= self.config.buffer_capacity {
            self.buffer.pop_front();
            self.stats.buffer_evictions += 1;
            warn!(
                symbol = %self.book.symbol(),
                capacity = self.config.buffer_capacity,
                evictions = self.stats.buffer_evictions,
                "Delta buffer full, dropping oldest"
            );
        }
        self.buffer.push_back((delta, received_at));
    }

    /// Drop the book and keep `delta` buffered for the next snapshot.
    fn resync(&mut self, delta: DepthDelta, received_at: i64, err: SyncError) -> DeltaOutcome {
        self.buffer.clear();
        self.abandon_snapshot(&err);
        self.push_buffered(delta, received_at);
        DeltaOutcome::ResyncRequired(err)
    }

    fn abandon_snapshot(&mut self, err: &SyncError) {
        self.book.clear();
        self.state = BookState::Resyncing;
        self.stats.resync_count += 1;
        let storm = self.resyncs.record(Instant::now());
        if storm {
            warn!(
                symbol = %self.book.symbol(),
                resyncs = self.stats.resync_count,
                threshold = self.config.resync_threshold,
                window_secs = self.config.resync_window.as_secs(),
                reason = %err,
                "Resync threshold exceeded"
            );
        } else {
            warn!(symbol = %self.book.symbol(), reason = %err, "Order book resync required");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::order_book::PriceLevel;
    use std::str::FromStr;
    use types::market::BookSide;
    use types::numeric::{Price, Quantity};

    fn level(price: u64, qty: &str) -> PriceLevel {
        PriceLevel::new(Price::from_u64(price), Quantity::from_str(qty).unwrap())
    }

    fn make_delta(first: u64, last: u64) -> DepthDelta {
        DepthDelta {
            first_update_id: first,
            final_update_id: last,
            prev_final_update_id: None,
            event_time: 1708123456789,
            bids: Vec::new(),
            asks: Vec::new(),
        }
    }

    fn make_snapshot(id: u64) -> Snapshot {
        Snapshot {
            last_update_id: id,
            bids: vec![level(50000, "1.0")],
            asks: vec![level(50001, "2.0")],
        }
    }

    fn make_engine() -> OrderBookEngine {
        OrderBookEngine::with_defaults(Symbol::try_new("BTCUSDT").unwrap())
    }

    /// Engine synced at `id` with no pending deltas.
    fn synced_engine(id: u64) -> OrderBookEngine {
        let mut engine = make_engine();
        assert_eq!(engine.on_delta(make_delta(id + 1, id + 1)), DeltaOutcome::SnapshotRequired);
        engine.begin_snapshot();
        let merged = engine.on_snapshot(make_snapshot(id)).unwrap();
        assert!(merged.synced);
        engine
    }

    #[test]
    fn test_first_delta_requests_snapshot() {
        let mut engine = make_engine();
        assert_eq!(engine.state(), BookState::Unsynced);

        assert_eq!(engine.on_delta(make_delta(1, 2)), DeltaOutcome::SnapshotRequired);
        assert_eq!(engine.state(), BookState::Snapshotting);
        assert_eq!(engine.on_delta(make_delta(3, 4)), DeltaOutcome::Buffered);
        assert_eq!(engine.buffered_len(), 2);
        assert!(engine.last_applied_id().is_none());
    }

    #[test]
    fn test_merge_discards_covered_and_replays_rest() {
        let mut engine = make_engine();
        engine.on_delta(make_delta(95, 100));
        engine.on_delta(make_delta(101, 101));
        engine.on_delta(make_delta(102, 103));
        engine.begin_snapshot();

        let merged = engine.on_snapshot(make_snapshot(100)).unwrap();
        assert!(merged.synced);
        assert_eq!(merged.discarded, 1);
        assert_eq!(merged.applied.len(), 2);
        assert_eq!(engine.state(), BookState::Synced);
        assert_eq!(engine.last_applied_id(), Some(103));
    }

    #[test]
    fn test_replayed_updates_keep_arrival_time() {
        let mut engine = make_engine();
        engine.on_delta_at(make_delta(95, 100), 1_000);
        engine.on_delta_at(make_delta(101, 101), 1_100);
        engine.on_delta_at(make_delta(102, 103), 1_250);
        engine.begin_snapshot();

        let merged = engine.on_snapshot(make_snapshot(100)).unwrap();
        let replayed: Vec<(u64, i64)> = merged
            .applied
            .iter()
            .map(|r| (r.update.delta.final_update_id, r.received_at))
            .collect();
        assert_eq!(replayed, vec![(101, 1_100), (103, 1_250)]);
    }

    #[test]
    fn test_bridging_delta_may_straddle_snapshot() {
        let mut engine = make_engine();
        engine.on_delta(make_delta(98, 105));
        engine.begin_snapshot();

        let merged = engine.on_snapshot(make_snapshot(100)).unwrap();
        assert!(merged.synced);
        assert_eq!(engine.last_applied_id(), Some(105));
    }

    #[test]
    fn test_snapshot_older_than_buffer_is_gap() {
        let mut engine = make_engine();
        engine.on_delta(make_delta(110, 112));
        engine.begin_snapshot();

        let err = engine.on_snapshot(make_snapshot(100)).unwrap_err();
        assert_eq!(
            err,
            SyncError::SnapshotTooOld {
                snapshot_id: 100,
                first_buffered: 110
            }
        );
        assert_eq!(engine.state(), BookState::Resyncing);
        assert!(engine.book().is_empty());
        assert_eq!(engine.buffered_len(), 1, "buffer kept for the next snapshot");
        assert_eq!(engine.stats().resync_count, 1);

        engine.begin_snapshot();
        let merged = engine.on_snapshot(make_snapshot(109)).unwrap();
        assert!(merged.synced);
        assert_eq!(engine.last_applied_id(), Some(112));
    }

    #[test]
    fn test_snapshot_newer_than_buffer_waits_for_bridge() {
        let mut engine = make_engine();
        engine.on_delta(make_delta(90, 95));
        engine.begin_snapshot();

        let merged = engine.on_snapshot(make_snapshot(100)).unwrap();
        assert!(!merged.synced);
        assert_eq!(engine.state(), BookState::Buffering);
        assert_eq!(engine.last_applied_id(), Some(100));

        assert_eq!(engine.on_delta(make_delta(99, 100)), DeltaOutcome::Stale);
        assert!(matches!(engine.on_delta(make_delta(101, 102)), DeltaOutcome::Applied(_)));
        assert_eq!(engine.state(), BookState::Synced);
    }

    #[test]
    fn test_gap_in_buffering_state() {
        let mut engine = make_engine();
        engine.on_delta(make_delta(90, 95));
        engine.begin_snapshot();
        engine.on_snapshot(make_snapshot(100)).unwrap();

        let outcome = engine.on_delta(make_delta(105, 106));
        assert!(matches!(outcome, DeltaOutcome::ResyncRequired(SyncError::Gap { expected: 101, .. })));
        assert_eq!(engine.state(), BookState::Resyncing);
    }

    #[test]
    fn test_gap_in_synced_state_drops_book() {
        let mut engine = synced_engine(100);

        let outcome = engine.on_delta(make_delta(103, 104));
        assert_eq!(
            outcome,
            DeltaOutcome::ResyncRequired(SyncError::Gap {
                expected: 102,
                first: 103,
                last: 104
            })
        );
        assert_eq!(engine.state(), BookState::Resyncing);
        assert!(engine.last_applied_id().is_none());
        assert!(engine.book().is_empty());
        assert_eq!(engine.buffered_len(), 1);
    }

    #[test]
    fn test_resync_buffers_until_snapshot() {
        let mut engine = synced_engine(100);
        engine.on_delta(make_delta(103, 104));

        assert_eq!(engine.on_delta(make_delta(105, 105)), DeltaOutcome::Buffered);
        engine.begin_snapshot();
        assert_eq!(engine.state(), BookState::Snapshotting);

        let merged = engine.on_snapshot(make_snapshot(104)).unwrap();
        assert!(merged.synced);
        assert_eq!(merged.discarded, 1);
        assert_eq!(engine.last_applied_id(), Some(105));
    }

    #[test]
    fn test_duplicate_delta_is_noop() {
        let mut engine = synced_engine(100);
        let mut removal = make_delta(102, 102);
        removal.bids.push(level(50000, "0"));

        assert!(matches!(engine.on_delta(removal.clone()), DeltaOutcome::Applied(_)));
        assert_eq!(engine.book().bid_depth(), 0);

        assert_eq!(engine.on_delta(removal), DeltaOutcome::Stale);
        assert_eq!(engine.state(), BookState::Synced);
        assert_eq!(engine.last_applied_id(), Some(102));
    }

    #[test]
    fn test_prev_final_checked_under_strict() {
        let mut engine = synced_engine(100);
        let mut delta = make_delta(102, 103);
        delta.prev_final_update_id = Some(99);

        let outcome = engine.on_delta(delta);
        assert_eq!(
            outcome,
            DeltaOutcome::ResyncRequired(SyncError::PreviousFinalMismatch {
                expected: 101,
                actual: 99
            })
        );
    }

    #[test]
    fn test_previous_final_policy_allows_id_jumps() {
        let config = EngineConfig {
            sequence_policy: SequencePolicy::PreviousFinal,
            ..EngineConfig::default()
        };
        let mut engine = OrderBookEngine::new(Symbol::try_new("BTCUSDT").unwrap(), config);
        engine.on_delta(make_delta(99, 101));
        engine.begin_snapshot();
        engine.on_snapshot(make_snapshot(100)).unwrap();

        let mut delta = make_delta(110, 120);
        delta.prev_final_update_id = Some(101);
        assert!(matches!(engine.on_delta(delta), DeltaOutcome::Applied(_)));
        assert_eq!(engine.last_applied_id(), Some(120));

        let mut broken = make_delta(121, 125);
        broken.prev_final_update_id = Some(119);
        assert!(matches!(engine.on_delta(broken), DeltaOutcome::ResyncRequired(_)));
    }

    #[test]
    fn test_buffer_cap_evicts_oldest() {
        let config = EngineConfig {
            buffer_capacity: 3,
            ..EngineConfig::default()
        };
        let mut engine = OrderBookEngine::new(Symbol::try_new("BTCUSDT").unwrap(), config);
        for id in 101..=105 {
            engine.on_delta(make_delta(id, id));
        }
        assert_eq!(engine.buffered_len(), 3);
        assert_eq!(engine.stats().buffer_evictions, 2);

        // the bridge for snapshot 100 was evicted
        engine.begin_snapshot();
        assert!(matches!(
            engine.on_snapshot(make_snapshot(100)),
            Err(SyncError::SnapshotTooOld { first_buffered: 103, .. })
        ));
    }

    #[test]
    fn test_unexpected_snapshot_rejected() {
        let mut engine = make_engine();
        let err = engine.on_snapshot(make_snapshot(1)).unwrap_err();
        assert_eq!(err, SyncError::UnexpectedSnapshot { state: BookState::Unsynced });
    }

    #[test]
    fn test_reset_returns_to_unsynced() {
        let mut engine = synced_engine(100);
        engine.reset();
        assert_eq!(engine.state(), BookState::Unsynced);
        assert!(engine.book().is_empty());
        assert_eq!(engine.on_delta(make_delta(500, 501)), DeltaOutcome::SnapshotRequired);
    }

    #[test]
    fn test_book_update_reports_best_prices() {
        let mut engine = synced_engine(100);
        let mut delta = make_delta(102, 102);
        delta.asks.push(level(50000, "0.5"));

        let DeltaOutcome::Applied(update) = engine.on_delta(delta) else {
            panic!("Expected Applied");
        };
        assert_eq!(update.best_ask, Some(level(50000, "0.5")));
        assert_eq!(update.best_bid, Some(level(50000, "1.0")));
        assert_eq!(
            engine.book().quantity_at(BookSide::Ask, Price::from_u64(50001)),
            Some(Quantity::from_str("2").unwrap())
        );
    }

    #[test]
    fn test_resync_storm_detection() {
        let config = EngineConfig {
            resync_threshold: 2,
            ..EngineConfig::default()
        };
        let mut engine = OrderBookEngine::new(Symbol::try_new("BTCUSDT").unwrap(), config);
        engine.on_delta(make_delta(50, 50));

        for _ in 0..3 {
            engine.begin_snapshot();
            let _ = engine.on_snapshot(make_snapshot(10));
        }
        assert_eq!(engine.stats().resync_count, 3);
        assert!(engine.is_resync_storm());
    }

    #[test]
    fn test_resync_tracker_window() {
        let start = Instant::now();
        let mut tracker = ResyncTracker::new(1, Duration::from_secs(10));

        assert!(!tracker.record(start));
        assert!(tracker.record(start + Duration::from_secs(1)));
        assert!(!tracker.is_exceeded(start + Duration::from_secs(12)));
        assert_eq!(tracker.recent(start + Duration::from_secs(12)), 0);
        assert_eq!(tracker.total(), 2);
    }

    #[test]
    fn test_book_state_round_trip_through_u8() {
        for state in [
            BookState::Unsynced,
            BookState::Snapshotting,
            BookState::Buffering,
            BookState::Synced,
            BookState::Resyncing,
        ] {
            assert_eq!(BookState::from_u8(state.to_u8()), state);
        }
    }
}

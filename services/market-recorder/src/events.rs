//! Normalized records placed on the transport channel
//!
//! Every message that leaves an ingestion worker is a `NormalizedRecord`:
//! a common envelope (id, symbol, local ingestion time) around a
//! `RecordPayload`. Records are immutable once built and are consumed
//! exactly once by the writer.

use chrono::Utc;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use types::ids::{RecordId, Symbol};
use types::market::{Side, StreamKind};
use types::numeric::{Price, Quantity};

use crate::delta::DepthDelta;
use crate::order_book::{BookSummary, PriceLevel};

/// Current Unix time in milliseconds.
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Envelope for everything published by an ingestion worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NormalizedRecord {
    /// Unique record identifier (UUID v7)
    pub record_id: RecordId,
    /// Originating symbol
    pub symbol: Symbol,
    /// Local Unix millis at which the worker received the source message
    pub ingested_at: i64,
    /// Record-specific payload
    pub payload: RecordPayload,
}

/// Record payloads, tagged by `record_type` when serialized.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "record_type", rename_all = "snake_case")]
pub enum RecordPayload {
    Trade(TradePrint),
    BookUpdate(BookUpdate),
    Candle(CandleBar),
    BookSnapshotEvent(BookSnapshotEvent),
    BookSummary(BookSummaryEvent),
}

/// Aggregated trade print.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TradePrint {
    pub aggregate_trade_id: u64,
    pub price: Price,
    pub quantity: Quantity,
    pub first_trade_id: u64,
    pub last_trade_id: u64,
    /// Taker side
    pub aggressor: Side,
    /// Exchange trade time, Unix millis
    pub trade_time: i64,
    /// Exchange event time, Unix millis
    pub event_time: i64,
}

/// A delta that the engine applied to the local book.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookUpdate {
    #[serde(flatten)]
    pub delta: DepthDelta,
    /// Best bid after applying the delta
    pub best_bid: Option<PriceLevel>,
    /// Best ask after applying the delta
    pub best_ask: Option<PriceLevel>,
}

/// Candle update. `closed` is false for in-progress candles.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandleBar {
    pub interval: String,
    pub open_time: i64,
    pub close_time: i64,
    pub open: Price,
    pub high: Price,
    pub low: Price,
    pub close: Price,
    pub volume: Decimal,
    pub quote_volume: Decimal,
    pub trade_count: u64,
    pub closed: bool,
    pub event_time: i64,
}

/// Snapshot that seeded (or re-seeded) the local book.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookSnapshotEvent {
    pub last_update_id: u64,
    /// Best first
    pub bids: Vec<PriceLevel>,
    /// Best first
    pub asks: Vec<PriceLevel>,
    /// SHA-256 over the levels and id, see `snapshot::compute_checksum`
    pub checksum: String,
    /// Local Unix millis at which the fetch completed
    pub fetched_at: i64,
}

/// Periodic view of a synced book.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookSummaryEvent {
    pub summary: BookSummary,
    pub updates_applied: u64,
    pub resync_count: u64,
    /// Local Unix millis at which the summary was taken
    pub generated_at: i64,
}

impl NormalizedRecord {
    /// Wrap a payload, stamping a fresh id and the current time.
    pub fn new(symbol: Symbol, payload: RecordPayload) -> Self {
        Self::with_ingested_at(symbol, payload, now_ms())
    }

    pub fn with_ingested_at(symbol: Symbol, payload: RecordPayload, ingested_at: i64) -> Self {
        Self {
            record_id: RecordId::new(),
            symbol,
            ingested_at,
            payload,
        }
    }

    /// Writer batch key component.
    pub fn stream_kind(&self) -> StreamKind {
        match &self.payload {
            RecordPayload::Trade(_) => StreamKind::Trade,
            RecordPayload::BookUpdate(_) => StreamKind::Depth,
            RecordPayload::Candle(_) => StreamKind::Candle,
            RecordPayload::BookSnapshotEvent(_) => StreamKind::DepthSnapshot,
            RecordPayload::BookSummary(_) => StreamKind::BookSummary,
        }
    }

    /// Exchange-supplied sequence number for this record.
    pub fn exchange_sequence(&self) -> u64 {
        match &self.payload {
            RecordPayload::Trade(t) => t.aggregate_trade_id,
            RecordPayload::BookUpdate(u) => u.delta.final_update_id,
            RecordPayload::Candle(c) => c.open_time.max(0) as u64,
            RecordPayload::BookSnapshotEvent(s) => s.last_update_id,
            RecordPayload::BookSummary(s) => s.summary.last_applied_id.unwrap_or(0),
        }
    }

    /// Exchange-supplied time, Unix millis. Snapshots and summaries carry
    /// none, so the local fetch or generation time stands in.
    pub fn exchange_time(&self) -> i64 {
        match &self.payload {
            RecordPayload::Trade(t) => t.trade_time,
            RecordPayload::BookUpdate(u) => u.delta.event_time,
            RecordPayload::Candle(c) => c.event_time,
            RecordPayload::BookSnapshotEvent(s) => s.fetched_at,
            RecordPayload::BookSummary(s) => s.generated_at,
        }
    }

    /// Record type as a string label for logging.
    pub fn record_type_label(&self) -> &'static str {
        match &self.payload {
            RecordPayload::Trade(_) => "Trade",
            RecordPayload::BookUpdate(_) => "BookUpdate",
            RecordPayload::Candle(_) => "Candle",
            RecordPayload::BookSnapshotEvent(_) => "BookSnapshotEvent",
            RecordPayload::BookSummary(_) => "BookSummary",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn sample_trade(id: u64) -> NormalizedRecord {
        NormalizedRecord::with_ingested_at(
            Symbol::try_new("BTCUSDT").unwrap(),
            RecordPayload::Trade(TradePrint {
                aggregate_trade_id: id,
                price: Price::from_u64(50000),
                quantity: Quantity::from_str("0.25").unwrap(),
                first_trade_id: id * 10,
                last_trade_id: id * 10 + 2,
                aggressor: Side::BUY,
                trade_time: 1708123456789,
                event_time: 1708123456790,
            }),
            1708123456800,
        )
    }

    #[test]
    fn test_stream_kind_mapping() {
        let record = sample_trade(7);
        assert_eq!(record.stream_kind(), StreamKind::Trade);
        assert_eq!(record.exchange_sequence(), 7);
        assert_eq!(record.exchange_time(), 1708123456789);
        assert_eq!(record.record_type_label(), "Trade");
    }

    #[test]
    fn test_serialized_shape_is_tagged() {
        let json = serde_json::to_value(sample_trade(1)).unwrap();
        assert_eq!(json["payload"]["record_type"], "trade");
        assert_eq!(json["payload"]["price"], "50000");
        assert_eq!(json["symbol"], "BTCUSDT");
    }

    #[test]
    fn test_book_update_flattens_delta() {
        let record = NormalizedRecord::new(
            Symbol::try_new("ETHUSDT").unwrap(),
            RecordPayload::BookUpdate(BookUpdate {
                delta: DepthDelta {
                    first_update_id: 11,
                    final_update_id: 12,
                    prev_final_update_id: Some(10),
                    event_time: 1,
                    bids: Vec::new(),
                    asks: Vec::new(),
                },
                best_bid: None,
                best_ask: None,
            }),
        );

        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["payload"]["final_update_id"], 12);
        assert_eq!(record.exchange_sequence(), 12);
        assert_eq!(record.stream_kind(), StreamKind::Depth);
    }

    #[test]
    fn test_book_summary_keyed_by_last_applied_id() {
        let btc = Symbol::try_new("BTCUSDT").unwrap();
        let record = NormalizedRecord::with_ingested_at(
            btc.clone(),
            RecordPayload::BookSummary(BookSummaryEvent {
                summary: BookSummary {
                    symbol: btc,
                    last_applied_id: Some(170),
                    best_bid: None,
                    best_ask: None,
                    spread: None,
                    mid_price: None,
                    bid_depth: 0,
                    ask_depth: 0,
                    top_bids: Vec::new(),
                    top_asks: Vec::new(),
                },
                updates_applied: 3,
                resync_count: 0,
                generated_at: 1708123460000,
            }),
            1708123460000,
        );

        assert_eq!(record.stream_kind(), StreamKind::BookSummary);
        assert_eq!(record.exchange_sequence(), 170);
        assert_eq!(record.exchange_time(), 1708123460000);
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["payload"]["record_type"], "book_summary");
        assert_eq!(json["payload"]["summary"]["last_applied_id"], 170);
    }

    #[test]
    fn test_record_ids_unique() {
        assert_ne!(sample_trade(1).record_id, sample_trade(1).record_id);
    }
}

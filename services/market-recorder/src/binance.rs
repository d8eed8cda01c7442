//! Binance USD-M futures wire formats
//!
//! Decodes REST depth snapshots and combined-stream websocket frames into
//! the crate's typed messages. Prices and quantities arrive as strings and
//! are parsed straight into `Price`/`Quantity`; nothing passes through
//! `f64`.

use serde::Deserialize;
use serde_json::Value;
use types::ids::Symbol;
use types::market::{Side, StreamKind};
use types::numeric::{Price, Quantity};

use crate::delta::DepthDelta;
use crate::error::FeedError;
use crate::events::{CandleBar, TradePrint};
use crate::order_book::PriceLevel;
use crate::snapshot::Snapshot;
use crate::stream::StreamMessage;

/// Candle interval subscribed for the `candle` stream kind.
pub const CANDLE_INTERVAL: &str = "1m";

/// Raw `[price, quantity]` pair.
type WireLevel = [String; 2];

#[derive(Debug, Deserialize)]
struct SnapshotWire {
    #[serde(rename = "lastUpdateId")]
    last_update_id: u64,
    bids: Vec<WireLevel>,
    asks: Vec<WireLevel>,
}

#[derive(Debug, Deserialize)]
struct CombinedEnvelope {
    stream: String,
    data: Value,
}

#[derive(Debug, Deserialize)]
struct DepthUpdateWire {
    #[serde(rename = "E")]
    event_time: i64,
    #[serde(rename = "U")]
    first_update_id: u64,
    #[serde(rename = "u")]
    final_update_id: u64,
    #[serde(rename = "pu", default)]
    prev_final_update_id: Option<u64>,
    #[serde(rename = "b")]
    bids: Vec<WireLevel>,
    #[serde(rename = "a")]
    asks: Vec<WireLevel>,
}

#[derive(Debug, Deserialize)]
struct AggTradeWire {
    #[serde(rename = "E")]
    event_time: i64,
    #[serde(rename = "a")]
    aggregate_trade_id: u64,
    #[serde(rename = "p")]
    price: String,
    #[serde(rename = "q")]
    quantity: String,
    #[serde(rename = "f")]
    first_trade_id: u64,
    #[serde(rename = "l")]
    last_trade_id: u64,
    #[serde(rename = "T")]
    trade_time: i64,
    #[serde(rename = "m")]
    buyer_is_maker: bool,
}

#[derive(Debug, Deserialize)]
struct KlineEventWire {
    #[serde(rename = "E")]
    event_time: i64,
    #[serde(rename = "k")]
    kline: KlineWire,
}

#[derive(Debug, Deserialize)]
struct KlineWire {
    #[serde(rename = "t")]
    open_time: i64,
    #[serde(rename = "T")]
    close_time: i64,
    #[serde(rename = "i")]
    interval: String,
    #[serde(rename = "o")]
    open: String,
    #[serde(rename = "c")]
    close: String,
    #[serde(rename = "h")]
    high: String,
    #[serde(rename = "l")]
    low: String,
    #[serde(rename = "v")]
    volume: String,
    #[serde(rename = "q")]
    quote_volume: String,
    #[serde(rename = "n")]
    trade_count: u64,
    #[serde(rename = "x")]
    closed: bool,
}

fn parse_levels(raw: &[WireLevel]) -> Result<Vec<PriceLevel>, FeedError> {
    raw.iter()
        .map(|[p, q]| -> Result<PriceLevel, FeedError> {
            Ok(PriceLevel::new(p.parse::<Price>()?, q.parse::<Quantity>()?))
        })
        .collect()
}

fn parse_decimal(raw: &str) -> Result<rust_decimal::Decimal, FeedError> {
    raw.parse::<rust_decimal::Decimal>()
        .map_err(|e| FeedError::Decode(format!("{raw:?}: {e}")))
}

/// Decode a REST depth snapshot body.
pub fn parse_snapshot(body: &str) -> Result<Snapshot, FeedError> {
    let wire: SnapshotWire = serde_json::from_str(body)?;
    Ok(Snapshot {
        last_update_id: wire.last_update_id,
        bids: parse_levels(&wire.bids)?,
        asks: parse_levels(&wire.asks)?,
    })
}

/// Stream names for one symbol, in subscription order.
pub fn stream_names(symbol: &Symbol, kinds: &[StreamKind]) -> Vec<String> {
    let base = symbol.stream_name();
    kinds
        .iter()
        .filter_map(|kind| match kind {
            StreamKind::Trade => Some(format!("{base}@aggTrade")),
            StreamKind::Depth => Some(format!("{base}@depth@0ms")),
            StreamKind::Candle => Some(format!("{base}@kline_{CANDLE_INTERVAL}")),
            StreamKind::DepthSnapshot | StreamKind::BookSummary => None,
        })
        .collect()
}

/// Combined-stream URL: `{base}/stream?streams=a/b/c`.
pub fn combined_stream_url(base_url: &str, symbol: &Symbol, kinds: &[StreamKind]) -> String {
    let mut base = base_url.trim_end_matches('/').to_string();
    for suffix in ["/ws", "/stream"] {
        if base.ends_with(suffix) {
            base.truncate(base.len() - suffix.len());
        }
    }
    format!("{}/stream?streams={}", base, stream_names(symbol, kinds).join("/"))
}

/// Decode one text frame.
///
/// Accepts both the combined `{stream, data}` envelope and bare event
/// payloads. Returns `Ok(None)` for frames that carry no market data, such
/// as subscription acknowledgements.
pub fn parse_stream_frame(text: &str) -> Result<Option<StreamMessage>, FeedError> {
    let value: Value = serde_json::from_str(text)?;
    let data = if value.get("stream").is_some() && value.get("data").is_some() {
        let envelope: CombinedEnvelope = serde_json::from_value(value)?;
        if envelope.stream.is_empty() {
            return Err(FeedError::Decode("empty stream name".to_string()));
        }
        envelope.data
    } else {
        value
    };

    let event_type = match data.get("e").and_then(Value::as_str) {
        Some(e) => e.to_string(),
        None => return Ok(None),
    };

    match event_type.as_str() {
        "depthUpdate" => {
            let wire: DepthUpdateWire = serde_json::from_value(data)?;
            let delta = DepthDelta {
                first_update_id: wire.first_update_id,
                final_update_id: wire.final_update_id,
                prev_final_update_id: wire.prev_final_update_id,
                event_time: wire.event_time,
                bids: parse_levels(&wire.bids)?,
                asks: parse_levels(&wire.asks)?,
            };
            if !delta.is_well_formed() {
                return Err(FeedError::Decode(format!(
                    "depth update id range runs backwards: {}..{}",
                    delta.first_update_id, delta.final_update_id
                )));
            }
            Ok(Some(StreamMessage::Depth(delta)))
        }
        "aggTrade" => {
            let wire: AggTradeWire = serde_json::from_value(data)?;
            Ok(Some(StreamMessage::Trade(TradePrint {
                aggregate_trade_id: wire.aggregate_trade_id,
                price: wire.price.parse()?,
                quantity: wire.quantity.parse()?,
                first_trade_id: wire.first_trade_id,
                last_trade_id: wire.last_trade_id,
                aggressor: Side::from_buyer_is_maker(wire.buyer_is_maker),
                trade_time: wire.trade_time,
                event_time: wire.event_time,
            })))
        }
        "kline" => {
            let wire: KlineEventWire = serde_json::from_value(data)?;
            let k = wire.kline;
            Ok(Some(StreamMessage::Candle(CandleBar {
                interval: k.interval,
                open_time: k.open_time,
                close_time: k.close_time,
                open: k.open.parse()?,
                high: k.high.parse()?,
                low: k.low.parse()?,
                close: k.close.parse()?,
                volume: parse_decimal(&k.volume)?,
                quote_volume: parse_decimal(&k.quote_volume)?,
                trade_count: k.trade_count,
                closed: k.closed,
                event_time: wire.event_time,
            })))
        }
        other => Err(FeedError::Decode(format!("unsupported event type {other:?}"))),
    }
}

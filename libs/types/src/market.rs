//! Stream kinds and sides

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::errors::ParseError;

/// Kind of market-data stream a symbol can subscribe to.
///
/// Doubles as the batch key on the writer side: records are grouped per
/// (symbol, kind) before they reach a sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamKind {
    /// Aggregated trade prints
    Trade,
    /// Incremental order book deltas
    Depth,
    /// Candle (kline) updates
    Candle,
    /// Full book snapshots taken during synchronization
    DepthSnapshot,
    /// Periodic top-of-book summaries of a synced book
    BookSummary,
}

impl StreamKind {
    /// Kinds a user can subscribe to. `DepthSnapshot` and `BookSummary` are
    /// derived from `Depth`.
    pub const SUBSCRIBABLE: [StreamKind; 3] =
        [StreamKind::Trade, StreamKind::Depth, StreamKind::Candle];

    pub fn as_str(&self) -> &'static str {
        match self {
            StreamKind::Trade => "trade",
            StreamKind::Depth => "depth",
            StreamKind::Candle => "candle",
            StreamKind::DepthSnapshot => "depth_snapshot",
            StreamKind::BookSummary => "book_summary",
        }
    }
}

impl fmt::Display for StreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StreamKind {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "trade" | "aggTrade" => Ok(StreamKind::Trade),
            "depth" => Ok(StreamKind::Depth),
            "candle" | "kline" | "kline_1m" => Ok(StreamKind::Candle),
            "depth_snapshot" => Ok(StreamKind::DepthSnapshot),
            "book_summary" => Ok(StreamKind::BookSummary),
            other => Err(ParseError::UnknownStream(other.to_string())),
        }
    }
}

/// Side of the order book a level belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BookSide {
    Bid,
    Ask,
}

/// Aggressor side of a trade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side {
    /// Buyer was the taker
    BUY,
    /// Seller was the taker
    SELL,
}

impl Side {
    /// Derive the aggressor from the exchange's "buyer is maker" flag.
    pub fn from_buyer_is_maker(buyer_is_maker: bool) -> Self {
        if buyer_is_maker {
            Side::SELL
        } else {
            Side::BUY
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_kind_parse_aliases() {
        assert_eq!("aggTrade".parse::<StreamKind>().unwrap(), StreamKind::Trade);
        assert_eq!("kline_1m".parse::<StreamKind>().unwrap(), StreamKind::Candle);
        assert!("bookTicker".parse::<StreamKind>().is_err());
    }

    #[test]
    fn test_stream_kind_serde_matches_label() {
        for kind in StreamKind::SUBSCRIBABLE {
            let json = serde_json::to_string(&kind).unwrap();
            assert_eq!(json, format!("\"{}\"", kind.as_str()));
        }
    }

    #[test]
    fn test_derived_kinds_round_trip_but_are_not_subscribable() {
        for kind in [StreamKind::DepthSnapshot, StreamKind::BookSummary] {
            assert_eq!(kind.as_str().parse::<StreamKind>().unwrap(), kind);
            assert!(!StreamKind::SUBSCRIBABLE.contains(&kind));
        }
        assert_eq!(serde_json::to_string(&StreamKind::BookSummary).unwrap(), "\"book_summary\"");
    }

    #[test]
    fn test_aggressor_side() {
        assert_eq!(Side::from_buyer_is_maker(true), Side::SELL);
        assert_eq!(Side::from_buyer_is_maker(false), Side::BUY);
    }
}

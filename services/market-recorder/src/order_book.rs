//! Local order book for a single symbol
//!
//! Holds the reconstructed exchange book as two `BTreeMap`s keyed by
//! `Price`, so iteration order is deterministic and best prices are at the
//! map ends. Quantities are `Decimal`-backed and zero-quantity levels are
//! never stored: a zero in an update removes the level.
//!
//! The book only knows how to apply levels. Whether a delta may be applied
//! at all is decided by the engine (`crate::engine`), which is the sole
//! owner of a `LocalOrderBook`.

use std::collections::BTreeMap;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use types::ids::Symbol;
use types::market::BookSide;
use types::numeric::{Price, Quantity};

use crate::delta::DepthDelta;
use crate::snapshot::Snapshot;

/// A single (price, quantity) pair, as sent by the exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceLevel {
    pub price: Price,
    pub quantity: Quantity,
}

impl PriceLevel {
    pub fn new(price: Price, quantity: Quantity) -> Self {
        Self { price, quantity }
    }

    /// Whether this level, applied as an update, removes the price.
    pub fn is_removal(&self) -> bool {
        self.quantity.is_zero()
    }
}

/// Reconstructed order book.
///
/// Bids iterate best-first via `.rev()`, asks iterate best-first directly.
#[derive(Debug, Clone)]
pub struct LocalOrderBook {
    symbol: Symbol,
    bids: BTreeMap<Price, Quantity>,
    asks: BTreeMap<Price, Quantity>,
    /// `finalUpdateId` of the last applied delta, or the snapshot id.
    last_applied_id: Option<u64>,
}

impl LocalOrderBook {
    /// Create an empty book with no applied id.
    pub fn new(symbol: Symbol) -> Self {
        Self {
            symbol,
            bids: BTreeMap::new(),
            asks: BTreeMap::new(),
            last_applied_id: None,
        }
    }

    /// Seed a book from a snapshot. Zero-quantity levels in the snapshot
    /// are skipped.
    pub fn from_snapshot(symbol: Symbol, snapshot: &Snapshot) -> Self {
        let mut book = Self::new(symbol);
        for level in &snapshot.bids {
            book.apply_level(BookSide::Bid, *level);
        }
        for level in &snapshot.asks {
            book.apply_level(BookSide::Ask, *level);
        }
        book.last_applied_id = Some(snapshot.last_update_id);
        book
    }

    /// Set a level to the given quantity, or remove it when the quantity
    /// is zero. Removing an absent level is a no-op.
    pub fn apply_level(&mut self, side: BookSide, level: PriceLevel) {
        let levels = match side {
            BookSide::Bid => &mut self.bids,
            BookSide::Ask => &mut self.asks,
        };
        if level.is_removal() {
            levels.remove(&level.price);
        } else {
            levels.insert(level.price, level.quantity);
        }
    }

    /// Apply every level update in the delta and advance `last_applied_id`.
    ///
    /// No continuity checking happens here.
    pub fn apply_delta(&mut self, delta: &DepthDelta) {
        for level in &delta.bids {
            self.apply_level(BookSide::Bid, *level);
        }
        for level in &delta.asks {
            self.apply_level(BookSide::Ask, *level);
        }
        self.last_applied_id = Some(delta.final_update_id);
    }

    /// Keep only the best `max_depth` levels per side. Zero disables.
    ///
    /// Returns the number of levels removed.
    pub fn trim(&mut self, max_depth: usize) -> usize {
        if max_depth == 0 {
            return 0;
        }
        let mut removed = 0;
        while self.bids.len() > max_depth {
            // worst bid is the lowest price
            self.bids.pop_first();
            removed += 1;
        }
        while self.asks.len() > max_depth {
            // worst ask is the highest price
            self.asks.pop_last();
            removed += 1;
        }
        removed
    }

    /// Drop every level and forget the applied id.
    pub fn clear(&mut self) {
        self.bids.clear();
        self.asks.clear();
        self.last_applied_id = None;
    }

    pub fn symbol(&self) -> &Symbol {
        &self.symbol
    }

    pub fn last_applied_id(&self) -> Option<u64> {
        self.last_applied_id
    }

    pub fn best_bid(&self) -> Option<PriceLevel> {
        self.bids
            .iter()
            .next_back()
            .map(|(p, q)| PriceLevel::new(*p, *q))
    }

    pub fn best_ask(&self) -> Option<PriceLevel> {
        self.asks
            .iter()
            .next()
            .map(|(p, q)| PriceLevel::new(*p, *q))
    }

    /// Best ask minus best bid.
    pub fn spread(&self) -> Option<Decimal> {
        match (self.best_bid(), self.best_ask()) {
            (Some(bid), Some(ask)) => Some(ask.price.as_decimal() - bid.price.as_decimal()),
            _ => None,
        }
    }

    /// Average of best bid and best ask.
    pub fn mid_price(&self) -> Option<Decimal> {
        match (self.best_bid(), self.best_ask()) {
            (Some(bid), Some(ask)) => {
                Some((bid.price.as_decimal() + ask.price.as_decimal()) / Decimal::from(2))
            }
            _ => None,
        }
    }

    /// Quantity resting at an exact price, if any.
    pub fn quantity_at(&self, side: BookSide, price: Price) -> Option<Quantity> {
        match side {
            BookSide::Bid => self.bids.get(&price).copied(),
            BookSide::Ask => self.asks.get(&price).copied(),
        }
    }

    /// Top `max_levels` bids, best (highest) first.
    pub fn bid_levels(&self, max_levels: usize) -> Vec<PriceLevel> {
        self.bids
            .iter()
            .rev()
            .take(max_levels)
            .map(|(p, q)| PriceLevel::new(*p, *q))
            .collect()
    }

    /// Top `max_levels` asks, best (lowest) first.
    pub fn ask_levels(&self, max_levels: usize) -> Vec<PriceLevel> {
        self.asks
            .iter()
            .take(max_levels)
            .map(|(p, q)| PriceLevel::new(*p, *q))
            .collect()
    }

    pub fn bid_depth(&self) -> usize {
        self.bids.len()
    }

    pub fn ask_depth(&self) -> usize {
        self.asks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bids.is_empty() && self.asks.is_empty()
    }

    /// Condensed view of the book for logs and status queries.
    pub fn summary(&self, levels: usize) -> BookSummary {
        BookSummary {
            symbol: self.symbol.clone(),
            last_applied_id: self.last_applied_id,
            best_bid: self.best_bid(),
            best_ask: self.best_ask(),
            spread: self.spread(),
            mid_price: self.mid_price(),
            bid_depth: self.bid_depth(),
            ask_depth: self.ask_depth(),
            top_bids: self.bid_levels(levels),
            top_asks: self.ask_levels(levels),
        }
    }
}

/// Point-in-time summary of a book.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookSummary {
    pub symbol: Symbol,
    pub last_applied_id: Option<u64>,
    pub best_bid: Option<PriceLevel>,
    pub best_ask: Option<PriceLevel>,
    pub spread: Option<Decimal>,
    pub mid_price: Option<Decimal>,
    pub bid_depth: usize,
    pub ask_depth: usize,
    /// Best first.
    pub top_bids: Vec<PriceLevel>,
    /// Best first.
    pub top_asks: Vec<PriceLevel>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn level(price: &str, qty: &str) -> PriceLevel {
        PriceLevel::new(Price::from_str(price).unwrap(), Quantity::from_str(qty).unwrap())
    }

    fn make_book() -> LocalOrderBook {
        LocalOrderBook::new(Symbol::try_new("BTCUSDT").unwrap())
    }

    #[test]
    fn test_empty_book() {
        let book = make_book();
        assert!(book.is_empty());
        assert!(book.best_bid().is_none());
        assert!(book.best_ask().is_none());
        assert!(book.spread().is_none());
        assert!(book.last_applied_id().is_none());
    }

    #[test]
    fn test_zero_quantity_removes_level() {
        let mut book = make_book();
        book.apply_level(BookSide::Bid, level("50000", "1.0"));
        assert_eq!(book.bid_depth(), 1);

        book.apply_level(BookSide::Bid, level("50000", "0"));
        assert_eq!(book.bid_depth(), 0);

        // removing again is harmless
        book.apply_level(BookSide::Bid, level("50000", "0"));
        assert_eq!(book.bid_depth(), 0);
    }

    #[test]
    fn test_zero_quantity_never_inserted() {
        let mut book = make_book();
        book.apply_level(BookSide::Ask, level("50001", "0.000"));
        assert!(book.is_empty());
    }

    #[test]
    fn test_best_prices_and_spread() {
        let mut book = make_book();
        book.apply_level(BookSide::Bid, level("49000", "1"));
        book.apply_level(BookSide::Bid, level("50000", "2"));
        book.apply_level(BookSide::Ask, level("51000", "1"));
        book.apply_level(BookSide::Ask, level("52000", "3"));

        assert_eq!(book.best_bid(), Some(level("50000", "2")));
        assert_eq!(book.best_ask(), Some(level("51000", "1")));
        assert_eq!(book.spread(), Some(Decimal::from(1000)));
        assert_eq!(book.mid_price(), Some(Decimal::from(50500)));
    }

    #[test]
    fn test_level_keys_ignore_trailing_zeros() {
        let mut book = make_book();
        book.apply_level(BookSide::Bid, level("50000.10", "1"));
        book.apply_level(BookSide::Bid, level("50000.1", "0"));
        assert_eq!(book.bid_depth(), 0);
    }

    #[test]
    fn test_level_ordering() {
        let mut book = make_book();
        for p in ["100", "102", "101"] {
            book.apply_level(BookSide::Bid, level(p, "1"));
            book.apply_level(BookSide::Ask, level(p, "1"));
        }

        let bids: Vec<String> = book.bid_levels(10).iter().map(|l| l.price.to_string()).collect();
        let asks: Vec<String> = book.ask_levels(2).iter().map(|l| l.price.to_string()).collect();
        assert_eq!(bids, vec!["102", "101", "100"]);
        assert_eq!(asks, vec!["100", "101"]);
    }

    #[test]
    fn test_trim_removes_worst_levels() {
        let mut book = make_book();
        for i in 0..5u64 {
            book.apply_level(BookSide::Bid, PriceLevel::new(Price::from_u64(100 - i), Quantity::from_str("1").unwrap()));
            book.apply_level(BookSide::Ask, PriceLevel::new(Price::from_u64(101 + i), Quantity::from_str("1").unwrap()));
        }

        let removed = book.trim(3);
        assert_eq!(removed, 4);
        assert_eq!(book.bid_levels(10).last().unwrap().price, Price::from_u64(98));
        assert_eq!(book.ask_levels(10).last().unwrap().price, Price::from_u64(103));

        assert_eq!(book.trim(0), 0);
    }

    #[test]
    fn test_from_snapshot() {
        let snapshot = Snapshot {
            last_update_id: 100,
            bids: vec![level("50000", "1.0"), level("49999", "0")],
            asks: vec![level("50001", "2.0")],
        };
        let book = LocalOrderBook::from_snapshot(Symbol::try_new("BTCUSDT").unwrap(), &snapshot);

        assert_eq!(book.last_applied_id(), Some(100));
        assert_eq!(book.bid_depth(), 1);
        assert_eq!(book.ask_depth(), 1);
    }

    #[test]
    fn test_summary() {
        let mut book = make_book();
        book.apply_level(BookSide::Bid, level("10", "1"));
        book.apply_level(BookSide::Ask, level("11", "2"));

        let summary = book.summary(5);
        assert_eq!(summary.bid_depth, 1);
        assert_eq!(summary.top_asks, vec![level("11", "2")]);
        assert_eq!(summary.spread, Some(Decimal::from(1)));
    }

    #[test]
    fn test_clear() {
        let mut book = make_book();
        book.apply_level(BookSide::Bid, level("10", "1"));
        book.clear();
        assert!(book.is_empty());
        assert!(book.last_applied_id().is_none());
    }
}

//! Scripted exchange doubles shared by the integration tests.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use market_recorder::delta::DepthDelta;
use market_recorder::error::FeedError;
use market_recorder::events::{NormalizedRecord, TradePrint};
use market_recorder::order_book::PriceLevel;
use market_recorder::sink::{MemorySink, PersistenceSink, SinkError};
use market_recorder::snapshot::{Snapshot, SnapshotSource};
use market_recorder::stream::{MarketStream, StreamConnector, StreamMessage};
use types::ids::Symbol;
use types::market::{Side, StreamKind};
use types::numeric::{Price, Quantity};

pub fn symbol(s: &str) -> Symbol {
    Symbol::try_new(s).unwrap()
}

pub fn level(price: u64, qty: &str) -> PriceLevel {
    PriceLevel::new(Price::from_u64(price), Quantity::from_str(qty).unwrap())
}

pub fn make_delta(first: u64, last: u64) -> DepthDelta {
    DepthDelta {
        first_update_id: first,
        final_update_id: last,
        prev_final_update_id: None,
        event_time: 1708123456789,
        bids: Vec::new(),
        asks: Vec::new(),
    }
}

pub fn make_delta_with(first: u64, last: u64, bids: Vec<PriceLevel>, asks: Vec<PriceLevel>) -> DepthDelta {
    DepthDelta {
        bids,
        asks,
        ..make_delta(first, last)
    }
}

pub fn make_snapshot(id: u64) -> Snapshot {
    Snapshot {
        last_update_id: id,
        bids: vec![level(100, "1"), level(99, "2")],
        asks: vec![level(101, "1"), level(102, "2")],
    }
}

pub fn make_trade(id: u64) -> TradePrint {
    TradePrint {
        aggregate_trade_id: id,
        price: Price::from_u64(100),
        quantity: Quantity::from_str("0.5").unwrap(),
        first_trade_id: id,
        last_trade_id: id,
        aggressor: Side::BUY,
        trade_time: 1708123456789,
        event_time: 1708123456789,
    }
}

/// What a scripted stream does once its messages run out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamEnd {
    /// Stay connected and silent.
    HoldOpen,
    /// Report the connection as closed.
    Close,
}

/// Serves one scripted session per `connect` call. Once the scripts are
/// used up every further connection is silent.
pub struct ScriptedConnector {
    sessions: Mutex<VecDeque<Vec<StreamMessage>>>,
    end: StreamEnd,
    connects: AtomicUsize,
}

impl ScriptedConnector {
    pub fn new(sessions: Vec<Vec<StreamMessage>>, end: StreamEnd) -> Self {
        Self {
            sessions: Mutex::new(sessions.into()),
            end,
            connects: AtomicUsize::new(0),
        }
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StreamConnector for ScriptedConnector {
    async fn connect(
        &self,
        _symbol: &Symbol,
        _streams: &[StreamKind],
    ) -> Result<Box<dyn MarketStream>, FeedError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        let messages = self.sessions.lock().unwrap().pop_front().unwrap_or_default();
        let end = if messages.is_empty() { StreamEnd::HoldOpen } else { self.end };
        Ok(Box::new(ScriptedStream {
            messages: messages.into(),
            end,
        }))
    }
}

struct ScriptedStream {
    messages: VecDeque<StreamMessage>,
    end: StreamEnd,
}

#[async_trait]
impl MarketStream for ScriptedStream {
    async fn next_message(&mut self) -> Option<Result<StreamMessage, FeedError>> {
        // yield so one stream cannot starve the other tasks
        tokio::task::yield_now().await;
        match self.messages.pop_front() {
            Some(message) => Some(Ok(message)),
            None => match self.end {
                StreamEnd::HoldOpen => std::future::pending().await,
                StreamEnd::Close => None,
            },
        }
    }

    async fn close(&mut self) {
        self.messages.clear();
    }
}

/// Panics on every connection attempt for `failing`; other symbols get
/// silent, open streams.
pub struct PanickingConnector {
    failing: Symbol,
    healthy: ScriptedConnector,
    panics: AtomicUsize,
}

impl PanickingConnector {
    pub fn new(failing: Symbol, healthy: ScriptedConnector) -> Self {
        Self {
            failing,
            healthy,
            panics: AtomicUsize::new(0),
        }
    }

    pub fn panics(&self) -> usize {
        self.panics.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StreamConnector for PanickingConnector {
    async fn connect(
        &self,
        symbol: &Symbol,
        streams: &[StreamKind],
    ) -> Result<Box<dyn MarketStream>, FeedError> {
        if *symbol == self.failing {
            self.panics.fetch_add(1, Ordering::SeqCst);
            panic!("scripted connector failure for {symbol}");
        }
        self.healthy.connect(symbol, streams).await
    }
}

/// Returns scripted snapshot results in order, then repeats `fallback`.
pub struct ScriptedSnapshots {
    results: Mutex<VecDeque<Result<Snapshot, FeedError>>>,
    fallback: Snapshot,
    fetches: AtomicUsize,
}

impl ScriptedSnapshots {
    pub fn new(results: Vec<Result<Snapshot, FeedError>>, fallback: Snapshot) -> Self {
        Self {
            results: Mutex::new(results.into()),
            fallback,
            fetches: AtomicUsize::new(0),
        }
    }

    pub fn always(snapshot: Snapshot) -> Self {
        Self::new(Vec::new(), snapshot)
    }

    pub fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SnapshotSource for ScriptedSnapshots {
    async fn fetch(&self, _symbol: &Symbol, _depth_limit: u32) -> Result<Snapshot, FeedError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        let next = self.results.lock().unwrap().pop_front();
        next.unwrap_or_else(|| Ok(self.fallback.clone()))
    }
}

/// Panics on the first `panics` batch writes, then stores batches in
/// `inner`.
pub struct PanickingSink {
    remaining: AtomicUsize,
    inner: Arc<MemorySink>,
}

impl PanickingSink {
    pub fn new(panics: usize, inner: Arc<MemorySink>) -> Self {
        Self {
            remaining: AtomicUsize::new(panics),
            inner,
        }
    }
}

#[async_trait]
impl PersistenceSink for PanickingSink {
    async fn write_batch(
        &self,
        symbol: &Symbol,
        stream: StreamKind,
        records: &[NormalizedRecord],
    ) -> Result<(), SinkError> {
        let panicking = self
            .remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if panicking {
            panic!("scripted sink failure for {symbol}/{stream}");
        }
        self.inner.write_batch(symbol, stream, records).await
    }

    fn name(&self) -> &'static str {
        "panicking"
    }
}

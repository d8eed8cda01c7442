//! Market Recorder
//!
//! Ingests live market data for a configured set of symbols and produces:
//! - A local order book per symbol, kept consistent with the exchange via
//!   snapshot + delta synchronization
//! - Normalized trade, candle, book update and snapshot records
//! - Batched, durable persistence per (symbol, stream)
//!
//! Every symbol runs in its own worker task; a single writer drains the
//! shared transport channel. A supervisor restarts failed units and
//! exposes a read-only status view.
//!
//! # Architecture
//!
//! ```text
//!  Exchange WS ──┐       Exchange REST (snapshots)
//!                │              │
//!        ┌───────▼──────────────▼───────┐
//!        │  Worker (one per symbol)     │  ← engine: Unsynced → Buffering → Synced
//!        │  decode → engine → publisher │
//!        └───────────────┬──────────────┘
//!                        │ bounded mpsc (backpressure, send timeout)
//!                 ┌──────▼──────┐
//!                 │   Writer    │  ← batches per (symbol, stream)
//!                 └──────┬──────┘
//!                        │
//!                 ┌──────▼──────┐
//!                 │    Sink     │  ← JSON lines / log / memory
//!                 └─────────────┘
//!
//!        Supervisor: spawn, liveness, restart policy, status
//! ```

pub mod backpressure;
pub mod binance;
pub mod config;
pub mod delta;
pub mod engine;
pub mod error;
pub mod events;
pub mod metrics;
pub mod order_book;
pub mod sink;
pub mod snapshot;
pub mod status;
pub mod stream;
pub mod supervisor;
pub mod transport;
pub mod worker;
pub mod writer;

// Library version
pub const SERVICE_VERSION: &str = "0.1.0";

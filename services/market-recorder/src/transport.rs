//! Transport channel between ingestion workers and the writer
//!
//! A single bounded tokio mpsc channel: every worker holds a clone of the
//! sender, the writer holds the receiver. A producer's sends are never
//! reordered, so per-symbol order survives the hop.
//!
//! The receiver sits behind an async mutex so that a restarted writer can
//! pick up the same channel where the crashed one left off.

use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};

use crate::events::NormalizedRecord;

pub type RecordSender = mpsc::Sender<NormalizedRecord>;
pub type SharedReceiver = Arc<Mutex<mpsc::Receiver<NormalizedRecord>>>;

/// Create the channel with a fixed capacity.
pub fn channel(capacity: usize) -> (RecordSender, SharedReceiver) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (tx, Arc::new(Mutex::new(rx)))
}

/// Records currently queued in the channel.
pub fn occupancy(sender: &RecordSender) -> usize {
    sender.max_capacity() - sender.capacity()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{RecordPayload, TradePrint};
    use std::str::FromStr;
    use types::ids::Symbol;
    use types::market::Side;
    use types::numeric::{Price, Quantity};

    fn make_record(id: u64) -> NormalizedRecord {
        NormalizedRecord::new(
            Symbol::try_new("BTCUSDT").unwrap(),
            RecordPayload::Trade(TradePrint {
                aggregate_trade_id: id,
                price: Price::from_u64(100),
                quantity: Quantity::from_str("1").unwrap(),
                first_trade_id: id,
                last_trade_id: id,
                aggressor: Side::BUY,
                trade_time: 0,
                event_time: 0,
            }),
        )
    }

    #[tokio::test]
    async fn test_occupancy_tracks_queue() {
        let (tx, rx) = channel(4);
        assert_eq!(occupancy(&tx), 0);

        tx.send(make_record(1)).await.unwrap();
        tx.send(make_record(2)).await.unwrap();
        assert_eq!(occupancy(&tx), 2);

        let first = rx.lock().await.recv().await.unwrap();
        assert_eq!(first.exchange_sequence(), 1);
        assert_eq!(occupancy(&tx), 1);
    }

    #[tokio::test]
    async fn test_zero_capacity_clamped() {
        let (tx, _rx) = channel(0);
        assert_eq!(tx.max_capacity(), 1);
    }
}

//! Order book snapshots and the snapshot fetcher
//!
//! A `Snapshot` is the full book at a known `last_update_id`, fetched
//! out-of-band from the REST endpoint while the delta stream keeps
//! buffering. The fetcher sits behind `SnapshotSource` so the worker can be
//! driven by scripted sources in tests.
//!
//! Snapshots that end up merged are also published as records, tagged with
//! a SHA-256 checksum over their levels so a reader can verify them.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::debug;
use types::ids::Symbol;

use crate::binance;
use crate::error::FeedError;
use crate::events::{now_ms, BookSnapshotEvent};
use crate::order_book::PriceLevel;

/// Full book state at `last_update_id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub last_update_id: u64,
    /// Best first, as returned by the exchange.
    pub bids: Vec<PriceLevel>,
    /// Best first, as returned by the exchange.
    pub asks: Vec<PriceLevel>,
}

impl Snapshot {
    /// Build the publishable record for this snapshot.
    pub fn to_event(&self, fetched_at: i64) -> BookSnapshotEvent {
        BookSnapshotEvent {
            last_update_id: self.last_update_id,
            bids: self.bids.clone(),
            asks: self.asks.clone(),
            checksum: compute_checksum(&self.bids, &self.asks, self.last_update_id),
            fetched_at,
        }
    }
}

/// One-shot source of full book snapshots.
#[async_trait]
pub trait SnapshotSource: Send + Sync {
    async fn fetch(&self, symbol: &Symbol, depth_limit: u32) -> Result<Snapshot, FeedError>;
}

/// REST snapshot fetcher for the futures depth endpoint.
pub struct RestSnapshotFetcher {
    client: reqwest::Client,
    base_url: String,
    timeout: Duration,
}

impl RestSnapshotFetcher {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, FeedError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| FeedError::Connect(e.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            timeout,
        })
    }

    fn depth_url(&self) -> String {
        format!("{}/fapi/v1/depth", self.base_url)
    }
}

#[async_trait]
impl SnapshotSource for RestSnapshotFetcher {
    async fn fetch(&self, symbol: &Symbol, depth_limit: u32) -> Result<Snapshot, FeedError> {
        let started = now_ms();
        let limit = depth_limit.to_string();
        let response = self
            .client
            .get(self.depth_url())
            .query(&[("symbol", symbol.as_str()), ("limit", limit.as_str())])
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    FeedError::Timeout(self.timeout)
                } else {
                    FeedError::from(e)
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(FeedError::Http {
                status: status.as_u16(),
                body,
            });
        }

        let body = response.text().await?;
        let snapshot = binance::parse_snapshot(&body)?;
        debug!(
            symbol = %symbol,
            last_update_id = snapshot.last_update_id,
            bids = snapshot.bids.len(),
            asks = snapshot.asks.len(),
            elapsed_ms = now_ms() - started,
            "Snapshot fetched"
        );
        Ok(snapshot)
    }
}

/// Compute a SHA-256 checksum over the book levels and update id.
pub fn compute_checksum(bids: &[PriceLevel], asks: &[PriceLevel], last_update_id: u64) -> String {
    let mut hasher = Sha256::new();

    for level in bids {
        hasher.update(level.price.to_string().as_bytes());
        hasher.update(b":");
        hasher.update(level.quantity.to_string().as_bytes());
        hasher.update(b"|");
    }
    hasher.update(b"---");

    for level in asks {
        hasher.update(level.price.to_string().as_bytes());
        hasher.update(b":");
        hasher.update(level.quantity.to_string().as_bytes());
        hasher.update(b"|");
    }
    hasher.update(b"---");

    hasher.update(last_update_id.to_le_bytes());

    format!("{:x}", hasher.finalize())
}

/// Verify that a published snapshot's checksum matches its content.
pub fn verify_checksum(event: &BookSnapshotEvent) -> bool {
    compute_checksum(&event.bids, &event.asks, event.last_update_id) == event.checksum
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;
    use types::numeric::{Price, Quantity};

    fn level(price: &str, qty: &str) -> PriceLevel {
        PriceLevel::new(Price::from_str(price).unwrap(), Quantity::from_str(qty).unwrap())
    }

    fn sample_snapshot() -> Snapshot {
        Snapshot {
            last_update_id: 100,
            bids: vec![level("50000", "1.0"), level("49999", "3")],
            asks: vec![level("50001", "2.0")],
        }
    }

    #[test]
    fn test_snapshot_event_integrity() {
        let event = sample_snapshot().to_event(1708123456789);
        assert!(verify_checksum(&event));

        let mut tampered = event.clone();
        tampered.bids[0].quantity = Quantity::from_str("9").unwrap();
        assert!(!verify_checksum(&tampered));
    }

    #[test]
    fn test_checksum_depends_on_update_id() {
        let snap = sample_snapshot();
        let a = compute_checksum(&snap.bids, &snap.asks, 100);
        let b = compute_checksum(&snap.bids, &snap.asks, 101);
        assert_ne!(a, b);
    }

    #[test]
    fn test_checksum_ignores_decimal_formatting() {
        let a = compute_checksum(&[level("1.50", "2.0")], &[], 1);
        let b = compute_checksum(&[level("1.5", "2")], &[], 1);
        assert_eq!(a, b);
    }

    #[test]
    fn test_depth_url() {
        let fetcher = RestSnapshotFetcher::new("https://fapi.binance.com/", Duration::from_secs(5)).unwrap();
        assert_eq!(fetcher.depth_url(), "https://fapi.binance.com/fapi/v1/depth");
    }
}

//! Incremental book deltas
//!
//! A `DepthDelta` is one exchange depth event: a contiguous range of update
//! ids `[first_update_id, final_update_id]` plus the level changes it
//! carries. Futures streams also send `pu`, the final id of the previous
//! event on the same stream, which gives a second continuity check.

use serde::{Deserialize, Serialize};

use crate::order_book::PriceLevel;

/// One depth event, already decoded into typed levels.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DepthDelta {
    /// First update id in this event (`U`).
    pub first_update_id: u64,
    /// Final update id in this event (`u`).
    pub final_update_id: u64,
    /// Final update id of the previous event (`pu`), when the venue sends it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prev_final_update_id: Option<u64>,
    /// Exchange event time, Unix millis.
    pub event_time: i64,
    /// Bid level changes; quantity zero removes the level.
    pub bids: Vec<PriceLevel>,
    /// Ask level changes; quantity zero removes the level.
    pub asks: Vec<PriceLevel>,
}

impl DepthDelta {
    /// Whether `update_id` falls inside this event's id range.
    pub fn covers(&self, update_id: u64) -> bool {
        self.first_update_id <= update_id && update_id <= self.final_update_id
    }

    /// Whether every update in this event is already reflected by a book
    /// whose last applied id is `last_applied`.
    pub fn is_stale(&self, last_applied: u64) -> bool {
        self.final_update_id <= last_applied
    }

    /// Total number of level changes.
    pub fn level_count(&self) -> usize {
        self.bids.len() + self.asks.len()
    }

    /// An id range running backwards cannot come from a healthy stream.
    pub fn is_well_formed(&self) -> bool {
        self.first_update_id <= self.final_update_id
    }
}

//! # Epoch Scheduler
//!
//! Wall-clock epochs of fixed length, anchored to `genesis_unix`. Pure
//! arithmetic — the scheduler holds no state of its own, it just answers
//! "what epoch is `t`" and "when does epoch `e` start/end".

use chrono::{DateTime, Utc};

#[derive(Debug, Clone, Copy)]
pub struct EpochScheduler {
    pub genesis_unix: i64,
    pub epoch_seconds: i64,
}

impl EpochScheduler {
    pub fn new(genesis_unix: i64, epoch_seconds: i64) -> Self {
        EpochScheduler {
            genesis_unix,
            epoch_seconds,
        }
    }

    /// The epoch index containing `t`. Times before genesis belong to epoch 0.
    pub fn epoch_index_for_time(&self, t: DateTime<Utc>) -> i64 {
        let elapsed = t.timestamp() - self.genesis_unix;
        if elapsed < 0 {
            0
        } else {
            elapsed / self.epoch_seconds
        }
    }

    /// The `[start, end)` unix-timestamp window for epoch `e`.
    pub fn epoch_window(&self, epoch: i64) -> (i64, i64) {
        let start = self.genesis_unix + epoch * self.epoch_seconds;
        (start, start + self.epoch_seconds)
    }

    /// Whether `t` falls at or past the end of epoch `e`, i.e. epoch `e` is
    /// closed and eligible for settlement.
    pub fn epoch_has_closed(&self, epoch: i64, t: DateTime<Utc>) -> bool {
        let (_, end) = self.epoch_window(epoch);
        t.timestamp() >= end
    }
}

/// Deterministic round-robin leader for one scheduler tick. Only the
/// returned node is expected to emit that tick's cosmetic economic
/// broadcast — this has no bearing on any ledger invariant, since the
/// miner mines whatever the mempool holds regardless of who is "leader".
pub fn leader_for_tick<'a>(node_ids: &'a [String], tick: u64) -> Option<&'a str> {
    if node_ids.is_empty() {
        return None;
    }
    let idx = (tick as usize) % node_ids.len();
    Some(node_ids[idx].as_str())
}

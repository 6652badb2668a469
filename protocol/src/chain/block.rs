//! # Block Model
//!
//! A block wraps exactly one transaction (by design — see the taxonomy in
//! [`crate::tx`]). The log is therefore a total order on transactions, and
//! there is no separate "block body" Merkle structure to maintain: the
//! block's hash already commits to its single transaction.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::config::{DIFFICULTY_GENESIS, DIFFICULTY_MAX, DIFFICULTY_MIN};

/// One mined entry in the append-only log.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Block {
    pub height: u64,
    pub prev_hash: String,
    pub hash: String,
    pub timestamp: DateTime<Utc>,
    pub tx_type: String,
    pub tx_body: Value,
    pub nonce: u64,
    pub difficulty: u32,
}

impl Block {
    /// Builds the genesis block. `tx_type` is `EMPTY`; genesis always has
    /// `prev_hash = "0" * 64` and difficulty fixed at [`DIFFICULTY_GENESIS`].
    pub fn genesis() -> Block {
        let prev_hash = "0".repeat(64);
        let timestamp = Utc::now();
        let tx_body = Value::Null;
        let (nonce, hash) = mine(0, &prev_hash, "EMPTY", &tx_body, DIFFICULTY_GENESIS);
        Block {
            height: 0,
            prev_hash,
            hash,
            timestamp,
            tx_type: "EMPTY".to_string(),
            tx_body,
            nonce,
            difficulty: DIFFICULTY_GENESIS,
        }
    }

    /// Mines and constructs the next block in sequence given the current
    /// head. Retargets difficulty per the elapsed wall-clock time since
    /// `prev.timestamp`.
    pub fn mine_next(prev: &Block, tx_type: &str, tx_body: Value, now: DateTime<Utc>) -> Block {
        let difficulty = retarget_difficulty(prev.difficulty, now - prev.timestamp);
        let height = prev.height + 1;
        let (nonce, hash) = mine(height, &prev.hash, tx_type, &tx_body, difficulty);
        Block {
            height,
            prev_hash: prev.hash.clone(),
            hash,
            timestamp: now,
            tx_type: tx_type.to_string(),
            tx_body,
            nonce,
            difficulty,
        }
    }

    /// Recomputes this block's hash from its fields and compares it against
    /// the stored `hash`, also checking the leading-zero difficulty
    /// requirement. Used by followers that opt into PoW re-verification.
    pub fn verify(&self) -> bool {
        let recomputed = block_hash(self.height, &self.prev_hash, &self.tx_type, &self.tx_body, self.nonce);
        recomputed == self.hash && has_leading_zeros(&self.hash, self.difficulty)
    }
}

/// Adaptive difficulty retarget: speeds up mining if blocks are coming in
/// faster than `T/2`, slows down if slower than `2T`, holds steady otherwise.
fn retarget_difficulty(prev_difficulty: u32, elapsed: chrono::Duration) -> u32 {
    let target = crate::config::BLOCK_TIME_TARGET;
    let half_target = target / 2;
    let double_target = target * 2;

    let elapsed_std = elapsed.to_std().unwrap_or(std::time::Duration::ZERO);

    if elapsed_std < half_target && prev_difficulty < DIFFICULTY_MAX {
        prev_difficulty + 1
    } else if elapsed_std > double_target && prev_difficulty > DIFFICULTY_MIN {
        prev_difficulty - 1
    } else {
        prev_difficulty
    }
}

/// Canonical JSON: object keys sorted recursively so two semantically equal
/// values always serialize to the same byte string, regardless of
/// construction order.
pub fn canonical_json(value: &Value) -> String {
    fn sorted(value: &Value) -> Value {
        match value {
            Value::Object(map) => {
                let mut entries: Vec<(&String, &Value)> = map.iter().collect();
                entries.sort_by(|a, b| a.0.cmp(b.0));
                let mut out = serde_json::Map::new();
                for (k, v) in entries {
                    out.insert(k.clone(), sorted(v));
                }
                Value::Object(out)
            }
            Value::Array(items) => Value::Array(items.iter().map(sorted).collect()),
            other => other.clone(),
        }
    }
    sorted(value).to_string()
}

fn block_hash(height: u64, prev_hash: &str, tx_type: &str, tx_body: &Value, nonce: u64) -> String {
    let preimage = format!(
        "{height}:{prev_hash}:{tx_type}:{}:{nonce}",
        canonical_json(tx_body)
    );
    let mut hasher = Sha256::new();
    hasher.update(preimage.as_bytes());
    hex::encode(hasher.finalize())
}

fn has_leading_zeros(hash: &str, difficulty: u32) -> bool {
    hash.bytes().take(difficulty as usize).all(|b| b == b'0')
}

/// Scans nonces `0, 1, 2, ...` until the resulting hash has `difficulty`
/// leading hex zeros. Returns `(nonce, hash)`.
fn mine(height: u64, prev_hash: &str, tx_type: &str, tx_body: &Value, difficulty: u32) -> (u64, String) {
    let mut nonce: u64 = 0;
    loop {
        let hash = block_hash(height, prev_hash, tx_type, tx_body, nonce);
        if has_leading_zeros(&hash, difficulty) {
            return (nonce, hash);
        }
        nonce += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn genesis_has_zero_height_and_satisfies_difficulty() {
        let g = Block::genesis();
        assert_eq!(g.height, 0);
        assert_eq!(g.prev_hash, "0".repeat(64));
        assert!(g.verify());
    }

    #[test]
    fn mine_next_links_to_previous_hash() {
        let g = Block::genesis();
        let b1 = Block::mine_next(&g, "EMPTY", Value::Null, Utc::now());
        assert_eq!(b1.prev_hash, g.hash);
        assert_eq!(b1.height, 1);
        assert!(b1.verify());
    }

    #[test]
    fn tampered_block_fails_verification() {
        let g = Block::genesis();
        let mut b1 = Block::mine_next(&g, "TRANSFER", json!({"amount": 10}), Utc::now());
        b1.tx_body = json!({"amount": 999});
        assert!(!b1.verify());
    }

    #[test]
    fn canonical_json_is_order_independent() {
        let a = json!({"b": 1, "a": 2});
        let b = json!({"a": 2, "b": 1});
        assert_eq!(canonical_json(&a), canonical_json(&b));
    }

    #[test]
    fn difficulty_retargets_up_on_fast_blocks() {
        let d = retarget_difficulty(4, chrono::Duration::seconds(1));
        assert_eq!(d, 5);
    }

    #[test]
    fn difficulty_retargets_down_on_slow_blocks() {
        let d = retarget_difficulty(4, chrono::Duration::seconds(25));
        assert_eq!(d, 3);
    }

    #[test]
    fn difficulty_holds_steady_in_middle_band() {
        let d = retarget_difficulty(4, chrono::Duration::seconds(10));
        assert_eq!(d, 4);
    }

    #[test]
    fn difficulty_never_exceeds_bounds() {
        assert_eq!(retarget_difficulty(DIFFICULTY_MAX, chrono::Duration::seconds(0)), DIFFICULTY_MAX);
        assert_eq!(retarget_difficulty(DIFFICULTY_MIN, chrono::Duration::seconds(100)), DIFFICULTY_MIN);
    }

    #[test]
    fn hash_is_lowercase_hex() {
        let g = Block::genesis();
        assert!(g.hash.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
        assert_eq!(g.hash.len(), 64);
    }
}

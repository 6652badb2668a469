//! # Embedded Persistent Log
//!
//! A `sled` database with one named tree per logical table from the
//! persisted-log schema. Heights and epochs are encoded big-endian so
//! lexicographic key order equals numeric order — range scans then fall out
//! of `Tree::range` for free. Writes that must land atomically (a block and
//! its single transaction row) go through one `sled::Batch`.

use serde::{de::DeserializeOwned, Serialize};
use sled::{Batch, Db as SledDb, Tree};
use thiserror::Error;

use crate::chain::block::Block;

#[derive(Debug, Error)]
pub enum DbError {
    #[error("sled error: {0}")]
    Sled(#[from] sled::Error),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("not found: {0}")]
    NotFound(String),
}

type DbResult<T> = Result<T, DbError>;

const TREE_BLOCKS: &str = "blocks";
const TREE_TX: &str = "tx";
const TREE_RSX_VALIDATORS: &str = "rsx_validators";
const TREE_RSX_STAKES: &str = "rsx_stakes";
const TREE_POP_NODES: &str = "pop_nodes";
const TREE_POP_NODE_CAPS: &str = "pop_node_caps";
const TREE_POP_EPOCH_METRICS: &str = "pop_epoch_metrics";
const TREE_POP_METRICS_BY_TXHASH: &str = "pop_epoch_metrics_by_tx_hash";
const TREE_EPOCH_PAYOUTS: &str = "epoch_payouts";
const TREE_EPOCH_PAYOUT_COMMITS: &str = "epoch_payout_commits";
const TREE_SLASHING_EVENTS: &str = "slashing_events";
const TREE_POP_CONSECUTIVE_OVER_CAP: &str = "pop_consecutive_over_cap";
const TREE_METADATA: &str = "metadata";

const META_LATEST_HEIGHT: &[u8] = b"latest_height";
const META_NEXT_SLASHING_ID: &[u8] = b"next_slashing_id";
const META_NEXT_PAYOUT_SEQ: &[u8] = b"next_payout_seq";

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq)]
pub struct TxRow {
    pub block_height: u64,
    pub tx_hash: String,
    pub tx_type: String,
    pub body_json: String,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq)]
pub struct ValidatorRow {
    pub validator_id: String,
    pub operator_wallet: String,
    pub commission_bps: u32,
    pub status: String,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq)]
pub struct StakeRow {
    pub staker: String,
    pub validator: String,
    pub amount_rsx: f64,
    pub lock_until_epoch: i64,
    pub updated_at: String,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq)]
pub struct PopNodeRow {
    pub node_id: String,
    pub operator_wallet: String,
    pub role: String,
    pub tx_hash: Option<String>,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq)]
pub struct PopNodeCapsRow {
    pub node_id: String,
    pub cpu: f64,
    pub ram: f64,
    pub storage: f64,
    pub bandwidth: f64,
    pub tx_hash: Option<String>,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq)]
pub struct PopEpochMetricsRow {
    pub epoch: i64,
    pub node_id: String,
    pub uptime: f64,
    pub requests: f64,
    pub blocks_relayed: f64,
    pub storage_io: f64,
    pub latency: f64,
    pub tx_hash: String,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq)]
pub struct EpochPayoutRow {
    pub epoch: i64,
    pub kind: String,
    pub recipient: String,
    pub asset: String,
    pub amount: f64,
    pub meta_json: String,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq)]
pub struct EpochPayoutCommitRow {
    pub tx_hash: String,
    pub epoch: i64,
    pub author: String,
    pub payout_hash: String,
    pub num_payouts: u64,
    pub operator_budget: f64,
    pub treasury_budget: f64,
    pub stake_budget: f64,
    pub pop_budget: f64,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq)]
pub struct SlashingEventRow {
    pub id: u64,
    pub epoch: i64,
    pub subject_type: String,
    pub subject_id: String,
    pub severity: String,
    pub score: f64,
    pub penalty_factor: f64,
    pub reason_code: String,
    pub reason_detail: String,
    pub evidence_json: String,
    pub status: String,
    pub created_at: String,
    pub applied_at: Option<String>,
}

/// Wraps a `sled::Db` and all named trees used by the engine.
#[derive(Clone)]
pub struct Db {
    inner: SledDb,
    blocks: Tree,
    tx: Tree,
    rsx_validators: Tree,
    rsx_stakes: Tree,
    pop_nodes: Tree,
    pop_node_caps: Tree,
    pop_epoch_metrics: Tree,
    pop_metrics_by_tx_hash: Tree,
    epoch_payouts: Tree,
    epoch_payout_commits: Tree,
    slashing_events: Tree,
    pop_consecutive_over_cap: Tree,
    metadata: Tree,
}

impl Db {
    pub fn open(path: impl AsRef<std::path::Path>) -> DbResult<Self> {
        let inner = sled::open(path)?;
        Self::from_sled(inner)
    }

    pub fn open_temporary() -> DbResult<Self> {
        let inner = sled::Config::new().temporary(true).open()?;
        Self::from_sled(inner)
    }

    fn from_sled(inner: SledDb) -> DbResult<Self> {
        Ok(Db {
            blocks: inner.open_tree(TREE_BLOCKS)?,
            tx: inner.open_tree(TREE_TX)?,
            rsx_validators: inner.open_tree(TREE_RSX_VALIDATORS)?,
            rsx_stakes: inner.open_tree(TREE_RSX_STAKES)?,
            pop_nodes: inner.open_tree(TREE_POP_NODES)?,
            pop_node_caps: inner.open_tree(TREE_POP_NODE_CAPS)?,
            pop_epoch_metrics: inner.open_tree(TREE_POP_EPOCH_METRICS)?,
            pop_metrics_by_tx_hash: inner.open_tree(TREE_POP_METRICS_BY_TXHASH)?,
            epoch_payouts: inner.open_tree(TREE_EPOCH_PAYOUTS)?,
            epoch_payout_commits: inner.open_tree(TREE_EPOCH_PAYOUT_COMMITS)?,
            slashing_events: inner.open_tree(TREE_SLASHING_EVENTS)?,
            pop_consecutive_over_cap: inner.open_tree(TREE_POP_CONSECUTIVE_OVER_CAP)?,
            metadata: inner.open_tree(TREE_METADATA)?,
            inner,
        })
    }

    pub fn flush(&self) -> DbResult<()> {
        self.inner.flush()?;
        Ok(())
    }

    // -- blocks + tx (atomic pair) -----------------------------------------

    /// Persists a block and its single transaction row atomically, and
    /// advances `latest_height`. Uses `INSERT OR REPLACE` semantics on
    /// height, so re-persisting the same height (e.g. after a reorg in a
    /// hypothetical multi-writer deployment) overwrites cleanly.
    pub fn put_block(&self, block: &Block, tx_hash: &str, tx_type: &str, body_json: &str) -> DbResult<()> {
        let key = height_key(block.height);
        let block_bytes = encode(block)?;
        let tx_row = TxRow {
            block_height: block.height,
            tx_hash: tx_hash.to_string(),
            tx_type: tx_type.to_string(),
            body_json: body_json.to_string(),
        };
        let tx_bytes = encode(&tx_row)?;

        let mut block_batch = Batch::default();
        block_batch.insert(key.as_slice(), block_bytes);
        self.blocks.apply_batch(block_batch)?;

        let mut tx_batch = Batch::default();
        tx_batch.insert(key.as_slice(), tx_bytes);
        self.tx.apply_batch(tx_batch)?;

        self.metadata.insert(META_LATEST_HEIGHT, &block.height.to_be_bytes())?;
        Ok(())
    }

    pub fn get_block(&self, height: u64) -> DbResult<Option<Block>> {
        get(&self.blocks, &height_key(height))
    }

    pub fn get_tx_row(&self, height: u64) -> DbResult<Option<TxRow>> {
        get(&self.tx, &height_key(height))
    }

    pub fn get_block_by_hash(&self, hash: &str) -> DbResult<Option<Block>> {
        for item in self.blocks.iter() {
            let (_, v) = item?;
            let block: Block = decode(&v)?;
            if block.hash == hash {
                return Ok(Some(block));
            }
        }
        Ok(None)
    }

    /// Returns blocks in `[from_height, from_height + limit)`, ascending.
    pub fn get_block_range(&self, from_height: u64, limit: u64) -> DbResult<Vec<Block>> {
        let start = height_key(from_height);
        let mut out = Vec::new();
        for item in self.blocks.range(start..) {
            let (_, v) = item?;
            out.push(decode::<Block>(&v)?);
            if out.len() as u64 >= limit {
                break;
            }
        }
        Ok(out)
    }

    pub fn get_latest_height(&self) -> DbResult<Option<u64>> {
        match self.metadata.get(META_LATEST_HEIGHT)? {
            Some(v) => Ok(Some(u64::from_be_bytes(v.as_ref().try_into().map_err(
                |_| DbError::Serialization("corrupt latest_height".to_string()),
            )?))),
            None => Ok(None),
        }
    }

    /// Loads all blocks and their tx rows, ordered by height ascending —
    /// this is the full rebuild path used at startup and by replay.
    pub fn load_all_blocks(&self) -> DbResult<Vec<(Block, TxRow)>> {
        let mut out = Vec::new();
        for item in self.blocks.iter() {
            let (k, v) = item?;
            let block: Block = decode(&v)?;
            let tx_row: TxRow = self
                .tx
                .get(&k)?
                .map(|bytes| decode(&bytes))
                .transpose()?
                .ok_or_else(|| DbError::NotFound(format!("tx row for height {}", block.height)))?;
            out.push((block, tx_row));
        }
        out.sort_by_key(|(b, _)| b.height);
        Ok(out)
    }

    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    // -- validators / stakes -------------------------------------------------

    pub fn upsert_validator(&self, row: &ValidatorRow) -> DbResult<()> {
        put(&self.rsx_validators, row.validator_id.as_bytes(), row)
    }

    pub fn list_validators(&self) -> DbResult<Vec<ValidatorRow>> {
        list_all(&self.rsx_validators)
    }

    pub fn stake_key(staker: &str, validator: &str) -> Vec<u8> {
        format!("{staker}\u{1}{validator}").into_bytes()
    }

    pub fn upsert_stake(&self, row: &StakeRow) -> DbResult<()> {
        put(&self.rsx_stakes, &Self::stake_key(&row.staker, &row.validator), row)
    }

    pub fn get_stake(&self, staker: &str, validator: &str) -> DbResult<Option<StakeRow>> {
        get(&self.rsx_stakes, &Self::stake_key(staker, validator))
    }

    pub fn list_stakes(&self) -> DbResult<Vec<StakeRow>> {
        list_all(&self.rsx_stakes)
    }

    // -- PoP registry ---------------------------------------------------------

    pub fn upsert_pop_node(&self, row: &PopNodeRow) -> DbResult<()> {
        put(&self.pop_nodes, row.node_id.as_bytes(), row)
    }

    pub fn get_pop_node(&self, node_id: &str) -> DbResult<Option<PopNodeRow>> {
        get(&self.pop_nodes, node_id.as_bytes())
    }

    pub fn list_pop_nodes(&self) -> DbResult<Vec<PopNodeRow>> {
        list_all(&self.pop_nodes)
    }

    pub fn upsert_pop_caps(&self, row: &PopNodeCapsRow) -> DbResult<()> {
        put(&self.pop_node_caps, row.node_id.as_bytes(), row)
    }

    pub fn get_pop_caps(&self, node_id: &str) -> DbResult<Option<PopNodeCapsRow>> {
        get(&self.pop_node_caps, node_id.as_bytes())
    }

    /// Idempotent by `tx_hash`: if a metric row already exists for this
    /// hash, the insert is silently ignored (INSERT-OR-IGNORE semantics).
    pub fn insert_pop_metrics(&self, row: &PopEpochMetricsRow) -> DbResult<bool> {
        if self.pop_metrics_by_tx_hash.contains_key(row.tx_hash.as_bytes())? {
            return Ok(false);
        }
        let key = metrics_key(row.epoch, &row.node_id, &row.tx_hash);
        put(&self.pop_epoch_metrics, &key, row)?;
        self.pop_metrics_by_tx_hash.insert(row.tx_hash.as_bytes(), &[])?;
        Ok(true)
    }

    pub fn list_pop_metrics_for_epoch(&self, epoch: i64) -> DbResult<Vec<PopEpochMetricsRow>> {
        let prefix = epoch.to_be_bytes();
        let mut out = Vec::new();
        for item in self.pop_epoch_metrics.scan_prefix(prefix) {
            let (_, v) = item?;
            out.push(decode(&v)?);
        }
        Ok(out)
    }

    // -- epoch payouts / commits ----------------------------------------------

    pub fn insert_epoch_payout(&self, row: &EpochPayoutRow) -> DbResult<()> {
        let seq = self.next_counter(META_NEXT_PAYOUT_SEQ)?;
        let mut key = row.epoch.to_be_bytes().to_vec();
        key.extend_from_slice(&seq.to_be_bytes());
        put(&self.epoch_payouts, &key, row)
    }

    pub fn list_epoch_payouts(&self, epoch: i64) -> DbResult<Vec<EpochPayoutRow>> {
        let prefix = epoch.to_be_bytes();
        let mut out = Vec::new();
        for item in self.epoch_payouts.scan_prefix(prefix) {
            let (_, v) = item?;
            out.push(decode(&v)?);
        }
        Ok(out)
    }

    /// Idempotent by `tx_hash` — the payout-commit's natural primary key.
    pub fn insert_epoch_payout_commit(&self, row: &EpochPayoutCommitRow) -> DbResult<bool> {
        if self.epoch_payout_commits.contains_key(row.tx_hash.as_bytes())? {
            return Ok(false);
        }
        put(&self.epoch_payout_commits, row.tx_hash.as_bytes(), row)?;
        Ok(true)
    }

    pub fn get_epoch_payout_commit_for_epoch(&self, epoch: i64) -> DbResult<Option<EpochPayoutCommitRow>> {
        for item in self.epoch_payout_commits.iter() {
            let (_, v) = item?;
            let row: EpochPayoutCommitRow = decode(&v)?;
            if row.epoch == epoch {
                return Ok(Some(row));
            }
        }
        Ok(None)
    }

    // -- slashing ---------------------------------------------------------------

    pub fn insert_slashing_event(&self, mut row: SlashingEventRow) -> DbResult<SlashingEventRow> {
        row.id = self.next_counter(META_NEXT_SLASHING_ID)?;
        put(&self.slashing_events, &row.id.to_be_bytes(), &row)?;
        Ok(row)
    }

    pub fn list_slashing_events(&self) -> DbResult<Vec<SlashingEventRow>> {
        list_all(&self.slashing_events)
    }

    /// Number of consecutive prior epochs a node's claimed work has exceeded
    /// its capability-derived ceiling — the corroboration counter the
    /// slashing check needs before it escalates a suspect reading.
    pub fn get_consecutive_over_cap(&self, node_id: &str) -> DbResult<u32> {
        match self.pop_consecutive_over_cap.get(node_id.as_bytes())? {
            Some(v) => decode(&v),
            None => Ok(0),
        }
    }

    pub fn set_consecutive_over_cap(&self, node_id: &str, count: u32) -> DbResult<()> {
        put(&self.pop_consecutive_over_cap, node_id.as_bytes(), &count)
    }

    fn next_counter(&self, key: &[u8]) -> DbResult<u64> {
        let current = match self.metadata.get(key)? {
            Some(v) => u64::from_be_bytes(
                v.as_ref()
                    .try_into()
                    .map_err(|_| DbError::Serialization("corrupt counter".to_string()))?,
            ),
            None => 0,
        };
        let next = current + 1;
        self.metadata.insert(key, &next.to_be_bytes())?;
        Ok(next)
    }
}

fn height_key(height: u64) -> [u8; 8] {
    height.to_be_bytes()
}

fn metrics_key(epoch: i64, node_id: &str, tx_hash: &str) -> Vec<u8> {
    let mut key = epoch.to_be_bytes().to_vec();
    key.extend_from_slice(node_id.as_bytes());
    key.push(0);
    key.extend_from_slice(tx_hash.as_bytes());
    key
}

fn encode<T: Serialize>(value: &T) -> DbResult<Vec<u8>> {
    bincode::serialize(value).map_err(|e| DbError::Serialization(e.to_string()))
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> DbResult<T> {
    bincode::deserialize(bytes).map_err(|e| DbError::Serialization(e.to_string()))
}

fn put<T: Serialize>(tree: &Tree, key: &[u8], value: &T) -> DbResult<()> {
    let bytes = encode(value)?;
    tree.insert(key, bytes)?;
    Ok(())
}

fn get<T: DeserializeOwned>(tree: &Tree, key: &[u8]) -> DbResult<Option<T>> {
    match tree.get(key)? {
        Some(bytes) => Ok(Some(decode(&bytes)?)),
        None => Ok(None),
    }
}

fn list_all<T: DeserializeOwned>(tree: &Tree) -> DbResult<Vec<T>> {
    let mut out = Vec::new();
    for item in tree.iter() {
        let (_, v) = item?;
        out.push(decode(&v)?);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::block::Block;

    #[test]
    fn open_temporary_and_put_get_block() {
        let db = Db::open_temporary().unwrap();
        let genesis = Block::genesis();
        db.put_block(&genesis, &genesis.hash, "EMPTY", "null").unwrap();
        let loaded = db.get_block(0).unwrap().unwrap();
        assert_eq!(loaded.hash, genesis.hash);
        assert_eq!(db.get_latest_height().unwrap(), Some(0));
    }

    #[test]
    fn block_range_respects_limit_and_order() {
        let db = Db::open_temporary().unwrap();
        let mut prev = Block::genesis();
        db.put_block(&prev, &prev.hash, "EMPTY", "null").unwrap();
        for _ in 0..5 {
            let next = Block::mine_next(&prev, "EMPTY", serde_json::Value::Null, chrono::Utc::now());
            db.put_block(&next, &next.hash, "EMPTY", "null").unwrap();
            prev = next;
        }
        let range = db.get_block_range(1, 3).unwrap();
        assert_eq!(range.len(), 3);
        assert_eq!(range[0].height, 1);
        assert_eq!(range[2].height, 3);
    }

    #[test]
    fn pop_metrics_insert_is_idempotent_by_tx_hash() {
        let db = Db::open_temporary().unwrap();
        let row = PopEpochMetricsRow {
            epoch: 1,
            node_id: "node-a".to_string(),
            uptime: 1.0,
            requests: 10.0,
            blocks_relayed: 1.0,
            storage_io: 1.0,
            latency: 1.0,
            tx_hash: "abc".to_string(),
        };
        assert!(db.insert_pop_metrics(&row).unwrap());
        assert!(!db.insert_pop_metrics(&row).unwrap());
        assert_eq!(db.list_pop_metrics_for_epoch(1).unwrap().len(), 1);
    }

    #[test]
    fn epoch_payout_commit_is_idempotent_by_tx_hash() {
        let db = Db::open_temporary().unwrap();
        let row = EpochPayoutCommitRow {
            tx_hash: "h1".to_string(),
            epoch: 0,
            author: "econ".to_string(),
            payout_hash: "deadbeef".to_string(),
            num_payouts: 2,
            operator_budget: 800.0,
            treasury_budget: 200.0,
            stake_budget: 440.0,
            pop_budget: 360.0,
        };
        assert!(db.insert_epoch_payout_commit(&row).unwrap());
        assert!(!db.insert_epoch_payout_commit(&row).unwrap());
    }

    #[test]
    fn reopen_persistent_db_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        {
            let db = Db::open(dir.path()).unwrap();
            let genesis = Block::genesis();
            db.put_block(&genesis, &genesis.hash, "EMPTY", "null").unwrap();
            db.flush().unwrap();
        }
        let reopened = Db::open(dir.path()).unwrap();
        assert_eq!(reopened.get_latest_height().unwrap(), Some(0));
    }

    #[test]
    fn stake_upsert_and_lookup_roundtrip() {
        let db = Db::open_temporary().unwrap();
        let row = StakeRow {
            staker: "alice".to_string(),
            validator: "v1".to_string(),
            amount_rsx: 100.0,
            lock_until_epoch: 5,
            updated_at: "2026-01-01T00:00:00Z".to_string(),
        };
        db.upsert_stake(&row).unwrap();
        let loaded = db.get_stake("alice", "v1").unwrap().unwrap();
        assert_eq!(loaded.amount_rsx, 100.0);
    }
}

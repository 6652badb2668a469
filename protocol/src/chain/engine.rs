//! # Transaction Engine
//!
//! The single writer. Every state-changing operation — submitting a
//! transaction, ticking the miner, replaying the log at startup — goes
//! through the one [`Mutex`] guarding the chain head, so the whole
//! validate-mutate-mine-persist sequence for one transaction always
//! completes before the next begins.
//!
//! Live submission (`submit`) and log replay (`replay_from_log`) share the
//! same transaction semantics with a small number of deliberate relaxations
//! on the replay path, called out on each handler below.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::Value;
use tracing::warn;

use crate::account::AccountStore;
use crate::chain::block::Block;
use crate::config::{self, NodeConfig};
use crate::econ::slashing::Severity;
use crate::econ::{issuance, nav, settlement, slashing};
use crate::error::{EngineError, EngineResult};
use crate::storage::db::{Db, PopEpochMetricsRow, PopNodeCapsRow, PopNodeRow, SlashingEventRow, StakeRow};
use crate::tx::{
    EpochPayoutCommitTx, MintTx, PopRegisterNodeTx, PopSetCapsTx, PopWorkClaimTx, RedeemTx,
    StakeLockTx, StakeUnlockTx, TierRenewTx, TransferTx, TxEnvelope, TxTag, VaultCreateTx,
    VaultDepositTx, VaultTransferTx, VaultWithdrawTx,
};

/// Owns the account store, the persistent log, and the chain head. Safe to
/// share across tasks behind an `Arc` — every public method is
/// self-synchronizing.
pub struct Engine {
    accounts: AccountStore,
    db: Db,
    config: NodeConfig,
    head: Mutex<Block>,
    mempool: Mutex<Vec<TxEnvelope>>,
}

impl Engine {
    /// Opens (or creates) the chain: mines genesis if the log is empty,
    /// otherwise replays every transaction row to rebuild account and
    /// auxiliary state before accepting new submissions.
    pub fn open(db: Db, config: NodeConfig) -> EngineResult<Self> {
        let accounts = AccountStore::new();
        let existing = db.load_all_blocks()?;

        let head = if let Some((last, _)) = existing.last() {
            last.clone()
        } else {
            let genesis = Block::genesis();
            db.put_block(&genesis, &genesis.hash, "EMPTY", "null")?;
            genesis
        };

        let engine = Engine {
            accounts,
            db,
            config,
            head: Mutex::new(head),
            mempool: Mutex::new(Vec::new()),
        };

        for (block, tx_row) in existing.iter() {
            if block.height == 0 {
                continue;
            }
            engine.replay_tx(&tx_row.tx_type, &block.tx_body, &tx_row.tx_hash);
        }

        Ok(engine)
    }

    pub fn head(&self) -> Block {
        self.head.lock().clone()
    }

    pub fn db(&self) -> &Db {
        &self.db
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn account(&self, address: &str) -> crate::account::Account {
        self.accounts.snapshot(address)
    }

    pub fn nav(&self) -> f64 {
        self.compute_nav()
    }

    pub fn enqueue(&self, envelope: TxEnvelope) {
        self.mempool.lock().push(envelope);
    }

    pub fn mempool_len(&self) -> usize {
        self.mempool.lock().len()
    }

    // -- follower ingestion ---------------------------------------------------

    /// Accepts one block fetched from an upstream peer. Unlike [`Self::submit`]
    /// this never mines — the block already carries its hash and nonce from
    /// the upstream miner. Rejects anything that doesn't chain onto the
    /// current head; optionally re-verifies proof of work.
    pub fn ingest_follower_block(&self, block: Block, tx_type: &str, body_json: &str, verify_pow: bool) -> EngineResult<()> {
        let mut head = self.head.lock();
        if block.height != head.height + 1 || block.prev_hash != head.hash {
            return Err(EngineError::InvalidArgument(format!(
                "block {} does not chain onto head {} ({})",
                block.height, head.height, head.hash
            )));
        }
        if verify_pow && !block.verify() {
            return Err(EngineError::InvalidArgument(format!(
                "block {} failed proof-of-work verification",
                block.height
            )));
        }

        self.replay_tx(tx_type, &block.tx_body, &block.hash);
        self.db.put_block(&block, &block.hash, tx_type, body_json)?;
        *head = block;
        Ok(())
    }

    // -- mining --------------------------------------------------------------

    /// One miner-loop tick: mines the highest-priority pending transaction,
    /// or an `EMPTY` heartbeat block if the mempool is empty. The miner
    /// never validates on its own — it delegates entirely to [`Self::submit`].
    pub fn mine_tick(&self, now: DateTime<Utc>, current_epoch: Option<i64>) -> EngineResult<(Block, String)> {
        let mut pool = self.mempool.lock();
        if pool.is_empty() {
            drop(pool);
            return self.submit(
                TxEnvelope {
                    tag: TxTag::Empty,
                    tx: Value::Null,
                },
                now,
                current_epoch,
            );
        }
        let idx = pool
            .iter()
            .enumerate()
            .min_by_key(|(i, env)| (std::cmp::Reverse(env.tag.priority()), *i))
            .map(|(i, _)| i)
            .expect("checked non-empty above");
        let envelope = pool.remove(idx);
        drop(pool);
        self.submit(envelope, now, current_epoch)
    }

    /// Submits one transaction immediately: validate, mutate in-memory
    /// state, mine a block committing to the (possibly resolved) body,
    /// persist auxiliary rows, then the block itself. Acquires the chain
    /// head lock for its whole duration, same as [`Self::settle_epoch`].
    pub fn submit(
        &self,
        envelope: TxEnvelope,
        now: DateTime<Utc>,
        current_epoch: Option<i64>,
    ) -> EngineResult<(Block, String)> {
        let mut head = self.head.lock();
        self.submit_locked(&mut head, envelope, now, current_epoch)
    }

    /// The body of [`Self::submit`], factored out so callers that must
    /// already hold the head lock for a larger atomic section — epoch
    /// settlement, notably — can submit the closing commitment transaction
    /// without releasing and re-acquiring it.
    fn submit_locked(
        &self,
        head: &mut Block,
        envelope: TxEnvelope,
        now: DateTime<Utc>,
        current_epoch: Option<i64>,
    ) -> EngineResult<(Block, String)> {
        let (tag_str, body) = self.validate_and_mutate(envelope.tag, envelope.tx, current_epoch)?;

        let next = Block::mine_next(head, tag_str, body.clone(), now);
        let tx_hash = next.hash.clone();

        self.finalize_aux(tag_str, &body, &tx_hash)?;
        self.db.put_block(&next, &tx_hash, tag_str, &crate::chain::block::canonical_json(&next.tx_body))?;

        *head = next.clone();
        Ok((next, tx_hash))
    }

    // -- epoch settlement -----------------------------------------------------

    /// Settles one closed epoch: sizes the issuance budget, splits it across
    /// stake and PoP work rewards, evaluates every reporting node for
    /// slashing, credits every recipient, and commits the result as an
    /// `EPOCH_PAYOUT_COMMIT` transaction. Idempotent — an epoch that already
    /// has a commit row is rejected rather than double-paid.
    ///
    /// Holds the chain head lock for the whole settlement so the credited
    /// balances and the committing transaction land as one atomic step; no
    /// other submission can interleave a read of a half-settled epoch.
    pub fn settle_epoch(&self, epoch: i64, now: DateTime<Utc>) -> EngineResult<(Block, String)> {
        let mut head = self.head.lock();

        if self.db.get_epoch_payout_commit_for_epoch(epoch)?.is_some() {
            return Err(EngineError::InvalidArgument(format!("epoch {epoch} already settled")));
        }

        let total_reward = issuance::epoch_reward(&self.config.issuance, epoch);
        let (operator_budget, treasury_budget) = issuance::split_operator_treasury(total_reward, &self.config.issuance);
        let (stake_budget, pop_budget) = issuance::split_stake_pop(operator_budget, self.config.reward_split_alpha);

        let stakes = self.db.list_stakes()?;
        let validators_by_id: HashMap<String, crate::storage::db::ValidatorRow> =
            self.db.list_validators()?.into_iter().map(|v| (v.validator_id.clone(), v)).collect();
        let stake_rows = settlement::stake_reward_rows(epoch, stake_budget, &stakes, &validators_by_id);

        let metrics = self.db.list_pop_metrics_for_epoch(epoch)?;
        let nodes_by_id: HashMap<String, PopNodeRow> =
            self.db.list_pop_nodes()?.into_iter().map(|n| (n.node_id.clone(), n)).collect();

        let mut caps_by_node: HashMap<String, PopNodeCapsRow> = HashMap::new();
        let mut penalty_by_node: HashMap<String, f64> = HashMap::new();
        for row in &metrics {
            let caps = self.db.get_pop_caps(&row.node_id)?;
            let prior_consecutive = self.db.get_consecutive_over_cap(&row.node_id)?;
            let verdict = slashing::evaluate_node(row, caps.as_ref(), prior_consecutive, &self.config.slashing);

            let exceeded_this_epoch = slashing::exceeds_cap_this_epoch(row, caps.as_ref(), &self.config.slashing);
            let next_consecutive = if exceeded_this_epoch { prior_consecutive + 1 } else { 0 };
            self.db.set_consecutive_over_cap(&row.node_id, next_consecutive)?;

            if verdict.severity != Severity::None {
                penalty_by_node.insert(row.node_id.clone(), verdict.penalty_factor);
                self.db.insert_slashing_event(SlashingEventRow {
                    id: 0,
                    epoch,
                    subject_type: "pop_node".to_string(),
                    subject_id: row.node_id.clone(),
                    severity: severity_label(verdict.severity).to_string(),
                    score: slashing::raw_work_estimate(row),
                    penalty_factor: verdict.penalty_factor,
                    reason_code: verdict.reason_code.clone(),
                    reason_detail: verdict.reason_detail.clone(),
                    evidence_json: serde_json::to_string(row).unwrap_or_default(),
                    status: "applied".to_string(),
                    created_at: now.to_rfc3339(),
                    applied_at: Some(now.to_rfc3339()),
                })?;
            }

            if let Some(caps) = caps {
                caps_by_node.insert(row.node_id.clone(), caps);
            }
        }

        let shares = settlement::pop_reward_shares(&metrics, &caps_by_node);
        let (pop_rows, slashed_total) = settlement::pop_reward_rows(epoch, pop_budget, &shares, &nodes_by_id, &penalty_by_node);

        let mut all_rows = stake_rows;
        all_rows.extend(pop_rows);

        for row in &all_rows {
            self.accounts.credit(&row.recipient, &row.asset, row.amount);
            self.db.insert_epoch_payout(row)?;
        }

        let treasury_amount = treasury_budget + slashed_total;
        let treasury_row = crate::storage::db::EpochPayoutRow {
            epoch,
            kind: "treasury".to_string(),
            recipient: config::ADDR_TREASURY.to_string(),
            asset: config::ASSET_GRC.to_string(),
            amount: treasury_amount,
            meta_json: serde_json::json!({"slashed_total": slashed_total}).to_string(),
        };
        self.accounts.credit(config::ADDR_TREASURY, config::ASSET_GRC, treasury_amount);
        self.db.insert_epoch_payout(&treasury_row)?;
        all_rows.push(treasury_row);

        let payout_hash = settlement::payout_hash(&all_rows);
        let author = "econ".to_string();
        let author_nonce = self.accounts.snapshot(&author).nonce + 1;

        let commit = EpochPayoutCommitTx {
            epoch,
            author,
            payout_hash,
            num_payouts: all_rows.len() as u64,
            operator_budget,
            treasury_budget,
            stake_budget,
            pop_budget,
            nonce: author_nonce,
        };
        let envelope = TxEnvelope {
            tag: TxTag::EpochPayoutCommit,
            tx: serde_json::to_value(commit).expect("serializable"),
        };

        self.submit_locked(&mut head, envelope, now, Some(epoch))
    }

    fn compute_nav(&self) -> f64 {
        let treasury = self.accounts.snapshot(config::ADDR_TREASURY);
        let total_grc = self.accounts.total_supply(config::ASSET_GRC);
        nav::compute_nav(&treasury.balances, total_grc, &self.config.price_map)
    }

    fn corridor_bounds(&self) -> (f64, f64) {
        nav::corridor_bounds(self.config.corridor_target, self.config.corridor_band_bps)
    }

    // -- live dispatch: validate, mutate accounts, return finalized body -----

    fn validate_and_mutate(
        &self,
        tag: TxTag,
        tx: Value,
        current_epoch: Option<i64>,
    ) -> EngineResult<(&'static str, Value)> {
        match tag {
            TxTag::Transfer => self.apply_transfer(tx),
            TxTag::Mint => self.apply_mint(tx),
            TxTag::Redeem => self.apply_redeem(tx),
            TxTag::StakeLock => self.apply_stake_lock(tx),
            TxTag::StakeUnlock => self.apply_stake_unlock(tx, current_epoch),
            TxTag::PopRegisterNode => self.apply_pop_register_node(tx),
            TxTag::PopSetCaps => self.apply_pop_set_caps(tx),
            TxTag::PopWorkClaim => self.apply_pop_work_claim(tx),
            TxTag::TierRenew => self.apply_tier_renew(tx),
            TxTag::VaultCreate => self.apply_vault_create(tx),
            TxTag::VaultDeposit => self.apply_vault_deposit(tx),
            TxTag::VaultWithdraw => self.apply_vault_withdraw(tx),
            TxTag::VaultTransfer => self.apply_vault_transfer(tx, true),
            TxTag::EpochPayoutCommit => self.apply_epoch_payout_commit(tx),
            TxTag::Empty => Ok(("EMPTY", Value::Null)),
        }
    }

    fn apply_transfer(&self, tx: Value) -> EngineResult<(&'static str, Value)> {
        let tx: TransferTx = serde_json::from_value(tx).map_err(|e| EngineError::InvalidArgument(e.to_string()))?;
        if tx.amount <= 0.0 {
            return Err(EngineError::InvalidArgument("transfer amount must be positive".to_string()));
        }
        self.accounts.expect_and_increment_nonce(&tx.from, tx.nonce)?;
        self.accounts.transfer(&tx.from, &tx.to, &tx.asset, tx.amount)?;
        Ok(("TRANSFER", serde_json::to_value(tx).expect("serializable")))
    }

    fn apply_mint(&self, tx: Value) -> EngineResult<(&'static str, Value)> {
        let mut tx: MintTx = serde_json::from_value(tx).map_err(|e| EngineError::InvalidArgument(e.to_string()))?;
        if tx.deposit_amount <= 0.0 {
            return Err(EngineError::InvalidArgument("deposit amount must be positive".to_string()));
        }
        if !config::MINT_BACKING_ASSETS.contains(&tx.backing_asset.as_str()) {
            return Err(EngineError::InvalidArgument(format!(
                "{} is not an accepted mint backing asset",
                tx.backing_asset
            )));
        }
        self.accounts.expect_and_increment_nonce(&tx.address, tx.nonce)?;

        let nav = self.compute_nav();
        let (_, upper) = self.corridor_bounds();
        if nav > upper {
            let (lower, upper) = self.corridor_bounds();
            return Err(EngineError::CorridorViolation { nav, lower, upper });
        }
        let grc = tx.deposit_amount / nav;

        self.accounts.transfer(&tx.address, config::ADDR_TREASURY, &tx.backing_asset, tx.deposit_amount)?;
        self.accounts.credit(&tx.address, config::ASSET_GRC, grc);

        tx.resolved_nav = Some(nav);
        tx.resolved_grc = Some(grc);
        Ok(("MINT", serde_json::to_value(tx).expect("serializable")))
    }

    fn apply_redeem(&self, tx: Value) -> EngineResult<(&'static str, Value)> {
        let mut tx: RedeemTx = serde_json::from_value(tx).map_err(|e| EngineError::InvalidArgument(e.to_string()))?;
        if tx.burn_grc <= 0.0 {
            return Err(EngineError::InvalidArgument("burn amount must be positive".to_string()));
        }
        self.accounts.expect_and_increment_nonce(&tx.address, tx.nonce)?;

        let nav = self.compute_nav();
        let (lower, _) = self.corridor_bounds();
        if nav < lower {
            let (lower, upper) = self.corridor_bounds();
            return Err(EngineError::CorridorViolation { nav, lower, upper });
        }
        let usdc = tx.burn_grc * nav;

        self.accounts.debit(&tx.address, config::ASSET_GRC, tx.burn_grc)?;
        self.accounts.transfer(config::ADDR_TREASURY, &tx.address, config::ASSET_USDC, usdc)?;

        tx.resolved_nav = Some(nav);
        tx.resolved_usdc = Some(usdc);
        Ok(("REDEEM", serde_json::to_value(tx).expect("serializable")))
    }

    fn apply_stake_lock(&self, tx: Value) -> EngineResult<(&'static str, Value)> {
        let tx: StakeLockTx = serde_json::from_value(tx).map_err(|e| EngineError::InvalidArgument(e.to_string()))?;
        if tx.amount_rsx <= 0.0 {
            return Err(EngineError::InvalidArgument("stake amount must be positive".to_string()));
        }
        self.accounts.expect_and_increment_nonce(&tx.staker, tx.nonce)?;
        self.accounts.transfer(&tx.staker, config::ADDR_STAKE_ESCROW, config::ASSET_RSX, tx.amount_rsx)?;
        Ok(("STAKE_LOCK", serde_json::to_value(tx).expect("serializable")))
    }

    fn apply_stake_unlock(&self, tx: Value, current_epoch: Option<i64>) -> EngineResult<(&'static str, Value)> {
        let tx: StakeUnlockTx = serde_json::from_value(tx).map_err(|e| EngineError::InvalidArgument(e.to_string()))?;
        if tx.amount_rsx <= 0.0 {
            return Err(EngineError::InvalidArgument("unlock amount must be positive".to_string()));
        }
        self.accounts.expect_and_increment_nonce(&tx.staker, tx.nonce)?;

        let stake = self
            .db
            .get_stake(&tx.staker, &tx.validator)?
            .ok_or_else(|| EngineError::NoStakePosition {
                staker: tx.staker.clone(),
                validator: tx.validator.clone(),
            })?;
        if tx.amount_rsx > stake.amount_rsx {
            return Err(EngineError::UnlockExceedsStake {
                amount: tx.amount_rsx,
                staked: stake.amount_rsx,
            });
        }
        // Live path only: replay skips this check (see `replay_tx`), since a
        // follower may catch up well past the original lock expiry.
        if let Some(epoch) = current_epoch {
            if epoch < stake.lock_until_epoch {
                return Err(EngineError::InvalidArgument(format!(
                    "stake locked until epoch {} (current {})",
                    stake.lock_until_epoch, epoch
                )));
            }
        }

        self.accounts.transfer(config::ADDR_STAKE_ESCROW, &tx.staker, config::ASSET_RSX, tx.amount_rsx)?;
        Ok(("STAKE_UNLOCK", serde_json::to_value(tx).expect("serializable")))
    }

    fn apply_pop_register_node(&self, tx: Value) -> EngineResult<(&'static str, Value)> {
        let tx: PopRegisterNodeTx = serde_json::from_value(tx).map_err(|e| EngineError::InvalidArgument(e.to_string()))?;
        self.accounts.expect_and_increment_nonce(&tx.operator, tx.nonce)?;
        Ok(("POP_REGISTER_NODE", serde_json::to_value(tx).expect("serializable")))
    }

    fn apply_pop_set_caps(&self, tx: Value) -> EngineResult<(&'static str, Value)> {
        let tx: PopSetCapsTx = serde_json::from_value(tx).map_err(|e| EngineError::InvalidArgument(e.to_string()))?;
        let node = self
            .db
            .get_pop_node(&tx.node_id)?
            .ok_or_else(|| EngineError::UnknownNode(tx.node_id.clone()))?;
        if node.operator_wallet != tx.operator {
            return Err(EngineError::OperatorMismatch {
                node_id: tx.node_id.clone(),
                expected: node.operator_wallet,
                got: tx.operator,
            });
        }
        self.accounts.expect_and_increment_nonce(&tx.operator, tx.nonce)?;
        Ok(("POP_SET_CAPS", serde_json::to_value(tx).expect("serializable")))
    }

    fn apply_pop_work_claim(&self, tx: Value) -> EngineResult<(&'static str, Value)> {
        let tx: PopWorkClaimTx = serde_json::from_value(tx).map_err(|e| EngineError::InvalidArgument(e.to_string()))?;
        let node = self
            .db
            .get_pop_node(&tx.node_id)?
            .ok_or_else(|| EngineError::UnknownNode(tx.node_id.clone()))?;
        if node.operator_wallet != tx.operator {
            return Err(EngineError::OperatorMismatch {
                node_id: tx.node_id.clone(),
                expected: node.operator_wallet,
                got: tx.operator,
            });
        }
        self.accounts.expect_and_increment_nonce(&tx.operator, tx.nonce)?;
        Ok(("POP_WORK_CLAIM", serde_json::to_value(tx).expect("serializable")))
    }

    fn apply_tier_renew(&self, tx: Value) -> EngineResult<(&'static str, Value)> {
        let tx: TierRenewTx = serde_json::from_value(tx).map_err(|e| EngineError::InvalidArgument(e.to_string()))?;
        if tx.amount_grc <= 0.0 {
            return Err(EngineError::InvalidArgument("tier renewal amount must be positive".to_string()));
        }
        self.accounts.expect_and_increment_nonce(&tx.sender, tx.nonce)?;
        self.accounts.transfer(&tx.sender, config::ADDR_TREASURY_TIERS, config::ASSET_GRC, tx.amount_grc)?;
        Ok(("TIER_RENEW", serde_json::to_value(tx).expect("serializable")))
    }

    fn apply_vault_create(&self, tx: Value) -> EngineResult<(&'static str, Value)> {
        let tx: VaultCreateTx = serde_json::from_value(tx).map_err(|e| EngineError::InvalidArgument(e.to_string()))?;
        self.accounts.expect_and_increment_nonce(&tx.owner, tx.nonce)?;
        Ok(("VAULT_CREATE", serde_json::to_value(tx).expect("serializable")))
    }

    fn apply_vault_deposit(&self, tx: Value) -> EngineResult<(&'static str, Value)> {
        let tx: VaultDepositTx = serde_json::from_value(tx).map_err(|e| EngineError::InvalidArgument(e.to_string()))?;
        if tx.amount <= 0.0 {
            return Err(EngineError::InvalidArgument("deposit amount must be positive".to_string()));
        }
        self.accounts.expect_and_increment_nonce(&tx.owner, tx.nonce)?;
        self.accounts.transfer(&tx.owner, &config::vault_address(&tx.vault_id), &tx.asset, tx.amount)?;
        Ok(("VAULT_DEPOSIT", serde_json::to_value(tx).expect("serializable")))
    }

    fn apply_vault_withdraw(&self, tx: Value) -> EngineResult<(&'static str, Value)> {
        let tx: VaultWithdrawTx = serde_json::from_value(tx).map_err(|e| EngineError::InvalidArgument(e.to_string()))?;
        if tx.amount <= 0.0 {
            return Err(EngineError::InvalidArgument("withdraw amount must be positive".to_string()));
        }
        self.accounts.expect_and_increment_nonce(&tx.owner, tx.nonce)?;
        self.accounts.transfer(&config::vault_address(&tx.vault_id), &tx.owner, &tx.asset, tx.amount)?;
        Ok(("VAULT_WITHDRAW", serde_json::to_value(tx).expect("serializable")))
    }

    /// `enforce_nonce = false` is the replay-path relaxation: a nonce
    /// mismatch (e.g. the implicit owner is unknown to this follower) is
    /// tolerated rather than rejected.
    fn apply_vault_transfer(&self, tx: Value, enforce_nonce: bool) -> EngineResult<(&'static str, Value)> {
        let tx: VaultTransferTx = serde_json::from_value(tx).map_err(|e| EngineError::InvalidArgument(e.to_string()))?;
        if tx.amount <= 0.0 {
            return Err(EngineError::InvalidArgument("transfer amount must be positive".to_string()));
        }
        let nonce_result = self.accounts.expect_and_increment_nonce(&tx.owner, tx.nonce);
        if enforce_nonce {
            nonce_result?;
        } else if let Err(e) = nonce_result {
            warn!(owner = %tx.owner, error = %e, "VAULT_TRANSFER nonce check failed during replay, proceeding anyway");
        }
        self.accounts.transfer(&config::vault_address(&tx.vault_id), &tx.to, &tx.asset, tx.amount)?;
        Ok(("VAULT_TRANSFER", serde_json::to_value(tx).expect("serializable")))
    }

    fn apply_epoch_payout_commit(&self, tx: Value) -> EngineResult<(&'static str, Value)> {
        let tx: EpochPayoutCommitTx = serde_json::from_value(tx).map_err(|e| EngineError::InvalidArgument(e.to_string()))?;
        if tx.payout_hash.is_empty() {
            return Err(EngineError::MissingCommitment);
        }
        self.accounts.expect_and_increment_nonce(&tx.author, tx.nonce)?;
        Ok(("EPOCH_PAYOUT_COMMIT", serde_json::to_value(tx).expect("serializable")))
    }

    // -- auxiliary table writes, keyed by the now-known block hash -----------

    fn finalize_aux(&self, tag_str: &str, body: &Value, tx_hash: &str) -> EngineResult<()> {
        match tag_str {
            "STAKE_LOCK" => {
                let tx: StakeLockTx = serde_json::from_value(body.clone()).expect("already validated");
                let mut row = self.db.get_stake(&tx.staker, &tx.validator)?.unwrap_or(StakeRow {
                    staker: tx.staker.clone(),
                    validator: tx.validator.clone(),
                    amount_rsx: 0.0,
                    lock_until_epoch: 0,
                    updated_at: String::new(),
                });
                row.amount_rsx += tx.amount_rsx;
                row.lock_until_epoch = tx.lock_until_epoch;
                row.updated_at = Utc::now().to_rfc3339();
                self.db.upsert_stake(&row)?;
            }
            "STAKE_UNLOCK" => {
                let tx: StakeUnlockTx = serde_json::from_value(body.clone()).expect("already validated");
                if let Some(mut row) = self.db.get_stake(&tx.staker, &tx.validator)? {
                    row.amount_rsx -= tx.amount_rsx;
                    row.updated_at = Utc::now().to_rfc3339();
                    self.db.upsert_stake(&row)?;
                }
            }
            "POP_REGISTER_NODE" => {
                let tx: PopRegisterNodeTx = serde_json::from_value(body.clone()).expect("already validated");
                self.db.upsert_pop_node(&PopNodeRow {
                    node_id: tx.node_id,
                    operator_wallet: tx.operator,
                    role: tx.role,
                    tx_hash: Some(tx_hash.to_string()),
                })?;
            }
            "POP_SET_CAPS" => {
                let tx: PopSetCapsTx = serde_json::from_value(body.clone()).expect("already validated");
                self.db.upsert_pop_caps(&PopNodeCapsRow {
                    node_id: tx.node_id,
                    cpu: tx.caps.cpu,
                    ram: tx.caps.ram,
                    storage: tx.caps.storage,
                    bandwidth: tx.caps.bandwidth,
                    tx_hash: Some(tx_hash.to_string()),
                })?;
            }
            "POP_WORK_CLAIM" => {
                let tx: PopWorkClaimTx = serde_json::from_value(body.clone()).expect("already validated");
                self.db.insert_pop_metrics(&PopEpochMetricsRow {
                    epoch: tx.epoch,
                    node_id: tx.node_id,
                    uptime: tx.metrics.uptime,
                    requests: tx.metrics.requests,
                    blocks_relayed: tx.metrics.blocks_relayed,
                    storage_io: tx.metrics.storage_io,
                    latency: tx.metrics.latency,
                    tx_hash: tx_hash.to_string(),
                })?;
            }
            "EPOCH_PAYOUT_COMMIT" => {
                let tx: EpochPayoutCommitTx = serde_json::from_value(body.clone()).expect("already validated");
                self.db.insert_epoch_payout_commit(&crate::storage::db::EpochPayoutCommitRow {
                    tx_hash: tx_hash.to_string(),
                    epoch: tx.epoch,
                    author: tx.author,
                    payout_hash: tx.payout_hash,
                    num_payouts: tx.num_payouts,
                    operator_budget: tx.operator_budget,
                    treasury_budget: tx.treasury_budget,
                    stake_budget: tx.stake_budget,
                    pop_budget: tx.pop_budget,
                })?;
            }
            _ => {}
        }
        Ok(())
    }

    // -- replay: rebuild in-memory + auxiliary state from a persisted body --

    /// Applies one already-mined transaction's effects without mining or
    /// persisting anything. Tolerant by design: a handler that cannot apply
    /// (malformed body, missing field, zero amount) logs a warning and
    /// leaves state untouched rather than aborting the whole replay.
    fn replay_tx(&self, tx_type: &str, body: &Value, tx_hash: &str) {
        let result = self.replay_dispatch(tx_type, body, tx_hash);
        if let Err(e) = result {
            warn!(tx_type, tx_hash, error = %e, "skipping transaction during replay");
        }
    }

    fn replay_dispatch(&self, tx_type: &str, body: &Value, tx_hash: &str) -> EngineResult<()> {
        match tx_type {
            "TRANSFER" => {
                let tx: TransferTx = parse(body)?;
                if tx.amount <= 0.0 {
                    return Ok(());
                }
                let _ = self.accounts.expect_and_increment_nonce(&tx.from, tx.nonce);
                self.accounts.transfer(&tx.from, &tx.to, &tx.asset, tx.amount)?;
            }
            "MINT" => {
                let tx: MintTx = parse(body)?;
                let nav = tx.resolved_nav.unwrap_or(1.0);
                let grc = tx.resolved_grc.unwrap_or(0.0);
                if tx.deposit_amount <= 0.0 || nav <= 0.0 {
                    return Ok(());
                }
                let _ = self.accounts.expect_and_increment_nonce(&tx.address, tx.nonce);
                self.accounts.transfer(&tx.address, config::ADDR_TREASURY, &tx.backing_asset, tx.deposit_amount)?;
                self.accounts.credit(&tx.address, config::ASSET_GRC, grc);
            }
            "REDEEM" => {
                let tx: RedeemTx = parse(body)?;
                let usdc = tx.resolved_usdc.unwrap_or(0.0);
                if tx.burn_grc <= 0.0 {
                    return Ok(());
                }
                let _ = self.accounts.expect_and_increment_nonce(&tx.address, tx.nonce);
                self.accounts.debit(&tx.address, config::ASSET_GRC, tx.burn_grc)?;
                self.accounts.transfer(config::ADDR_TREASURY, &tx.address, config::ASSET_USDC, usdc)?;
            }
            "STAKE_LOCK" => {
                let tx: StakeLockTx = parse(body)?;
                if tx.amount_rsx <= 0.0 {
                    return Ok(());
                }
                let _ = self.accounts.expect_and_increment_nonce(&tx.staker, tx.nonce);
                self.accounts.transfer(&tx.staker, config::ADDR_STAKE_ESCROW, config::ASSET_RSX, tx.amount_rsx)?;
                self.finalize_aux("STAKE_LOCK", body, tx_hash)?;
            }
            "STAKE_UNLOCK" => {
                // Replay relaxation: the lock-until-epoch check is skipped —
                // a follower catching up is always "later" than the lock.
                let tx: StakeUnlockTx = parse(body)?;
                if tx.amount_rsx <= 0.0 {
                    return Ok(());
                }
                let _ = self.accounts.expect_and_increment_nonce(&tx.staker, tx.nonce);
                self.accounts.transfer(config::ADDR_STAKE_ESCROW, &tx.staker, config::ASSET_RSX, tx.amount_rsx)?;
                self.finalize_aux("STAKE_UNLOCK", body, tx_hash)?;
            }
            "POP_REGISTER_NODE" => {
                let tx: PopRegisterNodeTx = parse(body)?;
                let _ = self.accounts.expect_and_increment_nonce(&tx.operator, tx.nonce);
                self.finalize_aux("POP_REGISTER_NODE", body, tx_hash)?;
            }
            "POP_SET_CAPS" => {
                let tx: PopSetCapsTx = parse(body)?;
                let _ = self.accounts.expect_and_increment_nonce(&tx.operator, tx.nonce);
                self.finalize_aux("POP_SET_CAPS", body, tx_hash)?;
            }
            "POP_WORK_CLAIM" => {
                let tx: PopWorkClaimTx = parse(body)?;
                let _ = self.accounts.expect_and_increment_nonce(&tx.operator, tx.nonce);
                self.finalize_aux("POP_WORK_CLAIM", body, tx_hash)?;
            }
            "TIER_RENEW" => {
                let tx: TierRenewTx = parse(body)?;
                if tx.amount_grc <= 0.0 {
                    return Ok(());
                }
                let _ = self.accounts.expect_and_increment_nonce(&tx.sender, tx.nonce);
                self.accounts.transfer(&tx.sender, config::ADDR_TREASURY_TIERS, config::ASSET_GRC, tx.amount_grc)?;
            }
            "VAULT_CREATE" => {
                let tx: VaultCreateTx = parse(body)?;
                let _ = self.accounts.expect_and_increment_nonce(&tx.owner, tx.nonce);
            }
            "VAULT_DEPOSIT" => {
                let tx: VaultDepositTx = parse(body)?;
                if tx.amount <= 0.0 {
                    return Ok(());
                }
                let _ = self.accounts.expect_and_increment_nonce(&tx.owner, tx.nonce);
                self.accounts.transfer(&tx.owner, &config::vault_address(&tx.vault_id), &tx.asset, tx.amount)?;
            }
            "VAULT_WITHDRAW" => {
                let tx: VaultWithdrawTx = parse(body)?;
                if tx.amount <= 0.0 {
                    return Ok(());
                }
                let _ = self.accounts.expect_and_increment_nonce(&tx.owner, tx.nonce);
                self.accounts.transfer(&config::vault_address(&tx.vault_id), &tx.owner, &tx.asset, tx.amount)?;
            }
            "VAULT_TRANSFER" => {
                let tx: VaultTransferTx = parse(body)?;
                if tx.amount <= 0.0 {
                    return Ok(());
                }
                let _ = self.accounts.expect_and_increment_nonce(&tx.owner, tx.nonce);
                self.accounts.transfer(&config::vault_address(&tx.vault_id), &tx.to, &tx.asset, tx.amount)?;
            }
            "EPOCH_PAYOUT_COMMIT" => {
                let tx: EpochPayoutCommitTx = parse(body)?;
                if tx.payout_hash.is_empty() {
                    return Ok(());
                }
                let _ = self.accounts.expect_and_increment_nonce(&tx.author, tx.nonce);
                self.finalize_aux("EPOCH_PAYOUT_COMMIT", body, tx_hash)?;
            }
            "EMPTY" => {}
            other => {
                warn!(tx_type = other, "unrecognized transaction type in persisted log");
            }
        }
        Ok(())
    }
}

fn parse<T: serde::de::DeserializeOwned>(body: &Value) -> EngineResult<T> {
    serde_json::from_value(body.clone()).map_err(|e| EngineError::InvalidArgument(e.to_string()))
}

fn severity_label(severity: Severity) -> &'static str {
    match severity {
        Severity::None => "none",
        Severity::Suspect => "penalty",
        Severity::Critical => "critical",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::db::{Db, ValidatorRow};
    use serde_json::json;

    fn engine() -> Engine {
        Engine::open(Db::open_temporary().unwrap(), NodeConfig::default()).unwrap()
    }

    fn envelope(tag: TxTag, tx: Value) -> TxEnvelope {
        TxEnvelope { tag, tx }
    }

    #[test]
    fn genesis_is_mined_on_first_open() {
        let eng = engine();
        assert_eq!(eng.head().height, 0);
    }

    #[test]
    fn transfer_requires_funds_and_advances_nonce() {
        let eng = engine();
        eng.enqueue(envelope(
            TxTag::Mint,
            json!({"address": "alice", "backing_asset": "USDC", "deposit_amount": 100.0, "nonce": 1}),
        ));
        let now = Utc::now();
        eng.mine_tick(now, None).unwrap();
        assert_eq!(eng.account("alice").balance_of("GRC"), 100.0);

        let (_, _hash) = eng
            .submit(
                envelope(
                    TxTag::Transfer,
                    json!({"from": "alice", "to": "bob", "amount": 40.0, "nonce": 2}),
                ),
                now,
                None,
            )
            .unwrap();
        assert_eq!(eng.account("alice").balance_of("GRC"), 60.0);
        assert_eq!(eng.account("bob").balance_of("GRC"), 40.0);
    }

    #[test]
    fn mint_above_corridor_upper_bound_is_rejected() {
        let eng = engine();
        // Seed some outstanding GRC supply and a thin treasury so NAV lands
        // above the corridor's upper bound before this mint is attempted.
        eng.accounts.credit("someone", config::ASSET_GRC, 1_000.0);
        eng.accounts.credit(config::ADDR_TREASURY, config::ASSET_ETH, 10.0);
        let now = Utc::now();
        let result = eng.submit(
            envelope(
                TxTag::Mint,
                json!({"address": "alice", "backing_asset": "ETH", "deposit_amount": 1.0, "nonce": 1}),
            ),
            now,
            None,
        );
        assert!(result.is_err());
    }

    #[test]
    fn stake_lock_then_unlock_roundtrips_balance() {
        let eng = engine();
        let now = Utc::now();
        eng.accounts.credit("alice", config::ASSET_RSX, 500.0);
        eng.submit(
            envelope(
                TxTag::StakeLock,
                json!({"staker": "alice", "validator": "v1", "amount_rsx": 200.0, "lock_until_epoch": 0, "nonce": 1}),
            ),
            now,
            None,
        )
        .unwrap();
        assert_eq!(eng.account("alice").balance_of("RSX"), 300.0);
        assert_eq!(eng.account(config::ADDR_STAKE_ESCROW).balance_of("RSX"), 200.0);

        eng.submit(
            envelope(
                TxTag::StakeUnlock,
                json!({"staker": "alice", "validator": "v1", "amount_rsx": 50.0, "nonce": 2}),
            ),
            now,
            Some(0),
        )
        .unwrap();
        assert_eq!(eng.account("alice").balance_of("RSX"), 350.0);
    }

    #[test]
    fn stake_unlock_before_lock_expiry_is_rejected_live() {
        let eng = engine();
        let now = Utc::now();
        eng.accounts.credit("alice", config::ASSET_RSX, 500.0);
        eng.submit(
            envelope(
                TxTag::StakeLock,
                json!({"staker": "alice", "validator": "v1", "amount_rsx": 200.0, "lock_until_epoch": 10, "nonce": 1}),
            ),
            now,
            None,
        )
        .unwrap();
        let result = eng.submit(
            envelope(
                TxTag::StakeUnlock,
                json!({"staker": "alice", "validator": "v1", "amount_rsx": 50.0, "nonce": 2}),
            ),
            now,
            Some(3),
        );
        assert!(result.is_err());
    }

    #[test]
    fn pop_set_caps_requires_matching_operator() {
        let eng = engine();
        let now = Utc::now();
        eng.submit(
            envelope(
                TxTag::PopRegisterNode,
                json!({"operator": "op1", "node_id": "node-a", "role": "worker", "nonce": 1}),
            ),
            now,
            None,
        )
        .unwrap();
        let result = eng.submit(
            envelope(
                TxTag::PopSetCaps,
                json!({"operator": "op2", "node_id": "node-a", "caps": {"cpu":1.0,"ram":1.0,"storage":1.0,"bandwidth":1.0}, "nonce": 1}),
            ),
            now,
            None,
        );
        assert!(matches!(result, Err(EngineError::OperatorMismatch { .. })));
    }

    #[test]
    fn mint_survives_replay_with_identical_resolved_values() {
        let db = Db::open_temporary().unwrap();
        let config = NodeConfig::default();
        let now = Utc::now();
        {
            let eng = Engine::open(db.clone(), config.clone()).unwrap();
            eng.submit(
                envelope(
                    TxTag::Mint,
                    json!({"address": "alice", "backing_asset": "USDC", "deposit_amount": 500.0, "nonce": 1}),
                ),
                now,
                None,
            )
            .unwrap();
        }
        let replayed = Engine::open(db, config).unwrap();
        assert_eq!(replayed.account("alice").balance_of("GRC"), 500.0);
        assert_eq!(replayed.account(config::ADDR_TREASURY).balance_of("USDC"), 500.0);
    }

    #[test]
    fn vault_deposit_and_withdraw_move_value_through_pseudo_address() {
        let eng = engine();
        let now = Utc::now();
        eng.accounts.credit("alice", "USDC", 100.0);
        eng.submit(
            envelope(
                TxTag::VaultDeposit,
                json!({"owner": "alice", "vault_id": "v1", "asset": "USDC", "amount": 40.0, "nonce": 1}),
            ),
            now,
            None,
        )
        .unwrap();
        assert_eq!(eng.account("alice").balance_of("USDC"), 60.0);
        assert_eq!(eng.account(&config::vault_address("v1")).balance_of("USDC"), 40.0);

        eng.submit(
            envelope(
                TxTag::VaultWithdraw,
                json!({"owner": "alice", "vault_id": "v1", "asset": "USDC", "amount": 10.0, "nonce": 2}),
            ),
            now,
            None,
        )
        .unwrap();
        assert_eq!(eng.account("alice").balance_of("USDC"), 70.0);
    }

    #[test]
    fn epoch_payout_commit_requires_nonempty_hash() {
        let eng = engine();
        let now = Utc::now();
        let result = eng.submit(
            envelope(
                TxTag::EpochPayoutCommit,
                json!({"epoch": 0, "payout_hash": "", "num_payouts": 0, "operator_budget": 0.0, "treasury_budget": 0.0, "stake_budget": 0.0, "pop_budget": 0.0, "nonce": 1}),
            ),
            now,
            None,
        );
        assert!(matches!(result, Err(EngineError::MissingCommitment)));
    }

    #[test]
    fn mine_tick_prefers_highest_priority_mempool_entry() {
        let eng = engine();
        let now = Utc::now();
        // queued in low-to-high priority order: POP_REGISTER_NODE (1), then
        // TIER_RENEW (2), then TRANSFER (3) — the miner must pick TRANSFER
        // first despite it being enqueued last.
        eng.accounts.credit("alice", config::ASSET_GRC, 10.0);
        eng.enqueue(envelope(
            TxTag::PopRegisterNode,
            json!({"operator": "op1", "node_id": "node-a", "role": "worker", "nonce": 1}),
        ));
        eng.enqueue(envelope(
            TxTag::TierRenew,
            json!({"sender": "alice", "tier": "pro", "billing_cycle": "monthly", "amount_grc": 1.0, "nonce": 1}),
        ));
        eng.enqueue(envelope(
            TxTag::Transfer,
            json!({"from": "alice", "to": "bob", "amount": 1.0, "nonce": 1}),
        ));
        let (block, _) = eng.mine_tick(now, None).unwrap();
        assert_eq!(block.tx_type, "TRANSFER");
        assert_eq!(eng.mempool_len(), 2);
    }

    #[test]
    fn mine_tick_on_empty_mempool_mines_heartbeat() {
        let eng = engine();
        let (block, _) = eng.mine_tick(Utc::now(), None).unwrap();
        assert_eq!(block.tx_type, "EMPTY");
    }

    #[test]
    fn unknown_pop_node_is_rejected() {
        let eng = engine();
        let now = Utc::now();
        let result = eng.submit(
            envelope(
                TxTag::PopSetCaps,
                json!({"operator": "op1", "node_id": "ghost", "caps": {"cpu":1.0,"ram":1.0,"storage":1.0,"bandwidth":1.0}, "nonce": 1}),
            ),
            now,
            None,
        );
        assert!(matches!(result, Err(EngineError::UnknownNode(_))));
    }

    #[test]
    fn settle_epoch_credits_stake_and_pop_rewards_and_commits_once() {
        let eng = engine();
        let now = Utc::now();

        eng.db()
            .upsert_pop_node(&crate::storage::db::PopNodeRow {
                node_id: "node-a".to_string(),
                operator_wallet: "node-a-operator".to_string(),
                role: "worker".to_string(),
                tx_hash: None,
            })
            .unwrap();
        eng.db()
            .insert_pop_metrics(&crate::storage::db::PopEpochMetricsRow {
                epoch: 0,
                node_id: "node-a".to_string(),
                uptime: 0.9,
                requests: 100.0,
                blocks_relayed: 10.0,
                storage_io: 5.0,
                latency: 0.8,
                tx_hash: "pop-tx-1".to_string(),
            })
            .unwrap();
        eng.db()
            .upsert_validator(&ValidatorRow {
                validator_id: "v1".to_string(),
                operator_wallet: "v1-operator".to_string(),
                commission_bps: 0,
                status: "active".to_string(),
            })
            .unwrap();
        eng.db()
            .upsert_stake(&crate::storage::db::StakeRow {
                staker: "alice".to_string(),
                validator: "v1".to_string(),
                amount_rsx: 100.0,
                lock_until_epoch: 0,
                updated_at: now.to_rfc3339(),
            })
            .unwrap();

        let (block, _) = eng.settle_epoch(0, now).unwrap();
        assert_eq!(block.tx_type, "EPOCH_PAYOUT_COMMIT");
        assert!(eng.account("alice").balance_of(config::ASSET_GRC) > 0.0);
        assert!(eng.account("node-a-operator").balance_of(config::ASSET_GRC) > 0.0);
        assert!(eng.db().get_epoch_payout_commit_for_epoch(0).unwrap().is_some());

        let result = eng.settle_epoch(0, now);
        assert!(matches!(result, Err(EngineError::InvalidArgument(_))));
    }

    #[test]
    fn validator_row_roundtrips_through_db() {
        let eng = engine();
        eng.db()
            .upsert_validator(&ValidatorRow {
                validator_id: "v1".to_string(),
                operator_wallet: "v1-op".to_string(),
                commission_bps: 500,
                status: "active".to_string(),
            })
            .unwrap();
        let rows = eng.db().list_validators().unwrap();
        assert_eq!(rows.len(), 1);
    }
}

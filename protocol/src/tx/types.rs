//! # Transaction Taxonomy
//!
//! One tag, one body shape, one apply method (see [`crate::chain::engine`]).
//! Bodies are plain serde structs; the wire envelope carries the tag
//! separately so the engine can dispatch before it even looks at the body's
//! shape.

use serde::{Deserialize, Serialize};
use std::fmt;

/// The wire envelope: `{type: <tag>, tx: <typed body>}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TxEnvelope {
    #[serde(rename = "type")]
    pub tag: TxTag,
    pub tx: serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TxTag {
    Transfer,
    Mint,
    Redeem,
    StakeLock,
    StakeUnlock,
    PopRegisterNode,
    PopSetCaps,
    PopWorkClaim,
    TierRenew,
    VaultCreate,
    VaultDeposit,
    VaultWithdraw,
    VaultTransfer,
    EpochPayoutCommit,
    Empty,
}

impl fmt::Display for TxTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = serde_json::to_value(self)
            .ok()
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_else(|| "UNKNOWN".to_string());
        write!(f, "{s}")
    }
}

/// Priority used by the miner to pick the next mempool entry; higher numeric
/// value is mined first, ties broken by lowest mempool index.
impl TxTag {
    pub fn priority(&self) -> u8 {
        match self {
            TxTag::Transfer | TxTag::VaultWithdraw => 3,
            TxTag::VaultDeposit | TxTag::TierRenew => 2,
            _ => 1,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferTx {
    pub from: String,
    pub to: String,
    #[serde(default = "default_grc_asset")]
    pub asset: String,
    pub amount: f64,
    pub nonce: u64,
    pub memo: Option<String>,
}

fn default_grc_asset() -> String {
    crate::config::ASSET_GRC.to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MintTx {
    pub address: String,
    pub backing_asset: String,
    pub deposit_amount: f64,
    pub nonce: u64,
    /// Resolved at apply time: the NAV used for this mint and the GRC
    /// credited. Persisted so replay can reconstruct both legs exactly
    /// rather than re-deriving NAV from a possibly different later state.
    #[serde(default)]
    pub resolved_nav: Option<f64>,
    #[serde(default)]
    pub resolved_grc: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedeemTx {
    pub address: String,
    pub burn_grc: f64,
    pub nonce: u64,
    #[serde(default)]
    pub resolved_nav: Option<f64>,
    #[serde(default)]
    pub resolved_usdc: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StakeLockTx {
    pub staker: String,
    pub validator: String,
    pub amount_rsx: f64,
    pub lock_until_epoch: i64,
    pub nonce: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StakeUnlockTx {
    pub staker: String,
    pub validator: String,
    pub amount_rsx: f64,
    pub nonce: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PopRegisterNodeTx {
    pub operator: String,
    pub node_id: String,
    pub role: String,
    pub nonce: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PopCaps {
    pub cpu: f64,
    pub ram: f64,
    pub storage: f64,
    pub bandwidth: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PopSetCapsTx {
    pub operator: String,
    pub node_id: String,
    pub caps: PopCaps,
    pub nonce: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PopMetrics {
    pub uptime: f64,
    pub requests: f64,
    pub blocks_relayed: f64,
    pub storage_io: f64,
    pub latency: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PopWorkClaimTx {
    pub operator: String,
    pub node_id: String,
    pub epoch: i64,
    pub metrics: PopMetrics,
    pub nonce: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TierRenewTx {
    pub sender: String,
    pub tier: String,
    pub billing_cycle: String,
    pub amount_grc: f64,
    #[serde(default)]
    pub earn_applied_grc: f64,
    #[serde(default)]
    pub stake_discount_grc: f64,
    #[serde(default)]
    pub surplus_to_time_grc: f64,
    pub nonce: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VaultCreateTx {
    pub owner: String,
    pub vault_id: String,
    pub nonce: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VaultDepositTx {
    pub owner: String,
    pub vault_id: String,
    pub asset: String,
    pub amount: f64,
    pub nonce: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VaultWithdrawTx {
    pub owner: String,
    pub vault_id: String,
    pub asset: String,
    pub amount: f64,
    pub nonce: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VaultTransferTx {
    pub owner: String,
    pub vault_id: String,
    pub to: String,
    pub asset: String,
    pub amount: f64,
    pub nonce: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EpochPayoutCommitTx {
    pub epoch: i64,
    #[serde(default = "default_author")]
    pub author: String,
    pub payout_hash: String,
    pub num_payouts: u64,
    pub operator_budget: f64,
    pub treasury_budget: f64,
    pub stake_budget: f64,
    pub pop_budget: f64,
    pub nonce: u64,
}

fn default_author() -> String {
    "econ".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tag_serializes_screaming_snake_case() {
        let v = serde_json::to_value(TxTag::PopWorkClaim).unwrap();
        assert_eq!(v.as_str().unwrap(), "POP_WORK_CLAIM");
    }

    #[test]
    fn tag_priority_matches_miner_rule() {
        assert_eq!(TxTag::Transfer.priority(), 3);
        assert_eq!(TxTag::VaultWithdraw.priority(), 3);
        assert_eq!(TxTag::VaultDeposit.priority(), 2);
        assert_eq!(TxTag::TierRenew.priority(), 2);
        assert_eq!(TxTag::Empty.priority(), 1);
    }

    #[test]
    fn transfer_defaults_asset_to_grc() {
        let body = serde_json::json!({
            "from": "alice",
            "to": "bob",
            "amount": 10.0,
            "nonce": 1,
        });
        let tx: TransferTx = serde_json::from_value(body).unwrap();
        assert_eq!(tx.asset, "GRC");
    }

    #[test]
    fn envelope_roundtrips_through_json() {
        let env = TxEnvelope {
            tag: TxTag::Transfer,
            tx: serde_json::json!({"from": "a", "to": "b", "amount": 1.0, "nonce": 1}),
        };
        let s = serde_json::to_string(&env).unwrap();
        let back: TxEnvelope = serde_json::from_str(&s).unwrap();
        assert_eq!(back.tag, TxTag::Transfer);
    }
}

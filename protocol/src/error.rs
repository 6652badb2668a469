//! # Error Types
//!
//! One error enum for everything the transaction engine can reject. All
//! variants are local to the submitting transaction — applying any of them
//! leaves no partial mutation visible (see [`crate::chain::engine`]).

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("invalid nonce: expected {expected}, got {got}")]
    InvalidNonce { expected: u64, got: u64 },

    #[error("insufficient funds: {address} has {available} {asset}, needs {needed}")]
    InsufficientFunds {
        address: String,
        asset: String,
        available: f64,
        needed: f64,
    },

    #[error("corridor violation: nav {nav} outside [{lower}, {upper}]")]
    CorridorViolation { nav: f64, lower: f64, upper: f64 },

    #[error("unknown node: {0}")]
    UnknownNode(String),

    #[error("operator mismatch for node {node_id}: expected {expected}, got {got}")]
    OperatorMismatch {
        node_id: String,
        expected: String,
        got: String,
    },

    #[error("missing payout commitment hash")]
    MissingCommitment,

    #[error("no stake position for ({staker}, {validator})")]
    NoStakePosition { staker: String, validator: String },

    #[error("unlock amount {amount} exceeds staked amount {staked}")]
    UnlockExceedsStake { amount: f64, staked: f64 },

    #[error("storage error: {0}")]
    Storage(#[from] crate::storage::db::DbError),
}

pub type EngineResult<T> = Result<T, EngineError>;

//! # Transaction Module
//!
//! The transaction lifecycle in this engine is intentionally short: a
//! typed body arrives over the wire (§[`TxEnvelope`]), the engine validates
//! it against account/auxiliary state under its single write lock, mutates
//! the store, mines the containing block, and persists both. There is no
//! signing, broadcast, or mempool-gossip stage — those belong to the
//! out-of-scope HTTP/wallet surface this crate does not implement.

pub mod types;

pub use types::*;

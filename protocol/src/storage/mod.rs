//! # Persistent Log
//!
//! The durable, append-only store backing the chain engine. On restart, the
//! in-memory account store, stake table, PoP registry, and payout ledger are
//! all rebuilt purely by replaying this log — it is the source of truth.

pub mod db;

pub use db::{Db, DbError};

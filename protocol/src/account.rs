//! # Account Store
//!
//! In-memory `address -> Account` map, exclusively owned by the chain engine.
//! All mutation goes through one exclusive lock; reads return independent
//! copies so callers can never observe (or corrupt) internal state.
//!
//! Unknown addresses are lazily created with zero balances and nonce 0 —
//! there is no separate "account creation" transaction.

use std::collections::HashMap;

use parking_lot::RwLock;

use crate::error::{EngineError, EngineResult};

/// A single account's balances and nonce.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Account {
    pub balances: HashMap<String, f64>,
    pub nonce: u64,
}

impl Account {
    pub fn balance_of(&self, asset: &str) -> f64 {
        self.balances.get(asset).copied().unwrap_or(0.0)
    }
}

/// Exclusive-lock-guarded map of all accounts.
#[derive(Debug, Default)]
pub struct AccountStore {
    inner: RwLock<HashMap<String, Account>>,
}

impl AccountStore {
    pub fn new() -> Self {
        AccountStore {
            inner: RwLock::new(HashMap::new()),
        }
    }

    /// Returns a deep copy of the named account, or a fresh zeroed one if it
    /// has never been touched.
    pub fn snapshot(&self, address: &str) -> Account {
        self.inner
            .read()
            .get(address)
            .cloned()
            .unwrap_or_default()
    }

    /// Returns a deep copy of the entire account map.
    pub fn snapshot_all(&self) -> HashMap<String, Account> {
        self.inner.read().clone()
    }

    pub fn get_nonce(&self, address: &str) -> u64 {
        self.inner.read().get(address).map(|a| a.nonce).unwrap_or(0)
    }

    /// Accepts `n` iff `n == current_nonce + 1`, then advances the stored
    /// nonce to `n`. Fails with [`EngineError::InvalidNonce`] otherwise.
    pub fn expect_and_increment_nonce(&self, address: &str, n: u64) -> EngineResult<()> {
        let mut guard = self.inner.write();
        let account = guard.entry(address.to_string()).or_default();
        let expected = account.nonce + 1;
        if n != expected {
            return Err(EngineError::InvalidNonce { expected, got: n });
        }
        account.nonce = n;
        Ok(())
    }

    pub fn credit(&self, address: &str, asset: &str, amount: f64) {
        let mut guard = self.inner.write();
        let account = guard.entry(address.to_string()).or_default();
        *account.balances.entry(asset.to_string()).or_insert(0.0) += amount;
    }

    pub fn debit(&self, address: &str, asset: &str, amount: f64) -> EngineResult<()> {
        let mut guard = self.inner.write();
        let account = guard.entry(address.to_string()).or_default();
        let available = account.balances.get(asset).copied().unwrap_or(0.0);
        if available < amount {
            return Err(EngineError::InsufficientFunds {
                address: address.to_string(),
                asset: asset.to_string(),
                available,
                needed: amount,
            });
        }
        *account.balances.entry(asset.to_string()).or_insert(0.0) -= amount;
        Ok(())
    }

    /// Atomic debit-then-credit: both legs happen under one write-lock
    /// acquisition, so no other reader ever observes the intermediate state
    /// where `from` has been debited but `to` has not yet been credited.
    pub fn transfer(&self, from: &str, to: &str, asset: &str, amount: f64) -> EngineResult<()> {
        let mut guard = self.inner.write();

        let available = guard
            .get(from)
            .and_then(|a| a.balances.get(asset))
            .copied()
            .unwrap_or(0.0);
        if available < amount {
            return Err(EngineError::InsufficientFunds {
                address: from.to_string(),
                asset: asset.to_string(),
                available,
                needed: amount,
            });
        }

        *guard
            .entry(from.to_string())
            .or_default()
            .balances
            .entry(asset.to_string())
            .or_insert(0.0) -= amount;
        *guard
            .entry(to.to_string())
            .or_default()
            .balances
            .entry(asset.to_string())
            .or_insert(0.0) += amount;
        Ok(())
    }

    /// Total outstanding supply of `asset` across all known accounts.
    pub fn total_supply(&self, asset: &str) -> f64 {
        self.inner
            .read()
            .values()
            .map(|a| a.balance_of(asset))
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_address_has_zero_balance_and_nonce() {
        let store = AccountStore::new();
        assert_eq!(store.get_nonce("nobody"), 0);
        assert_eq!(store.snapshot("nobody").balance_of("GRC"), 0.0);
    }

    #[test]
    fn credit_then_debit_roundtrip() {
        let store = AccountStore::new();
        store.credit("alice", "GRC", 100.0);
        assert_eq!(store.snapshot("alice").balance_of("GRC"), 100.0);
        store.debit("alice", "GRC", 40.0).unwrap();
        assert_eq!(store.snapshot("alice").balance_of("GRC"), 60.0);
    }

    #[test]
    fn debit_insufficient_funds_fails_and_leaves_balance_untouched() {
        let store = AccountStore::new();
        store.credit("alice", "GRC", 10.0);
        let err = store.debit("alice", "GRC", 50.0).unwrap_err();
        assert!(matches!(err, EngineError::InsufficientFunds { .. }));
        assert_eq!(store.snapshot("alice").balance_of("GRC"), 10.0);
    }

    #[test]
    fn nonce_must_be_exactly_current_plus_one() {
        let store = AccountStore::new();
        assert!(store.expect_and_increment_nonce("alice", 2).is_err());
        store.expect_and_increment_nonce("alice", 1).unwrap();
        assert_eq!(store.get_nonce("alice"), 1);
        assert!(store.expect_and_increment_nonce("alice", 1).is_err());
        store.expect_and_increment_nonce("alice", 2).unwrap();
    }

    #[test]
    fn transfer_moves_value_without_changing_total() {
        let store = AccountStore::new();
        store.credit("alice", "GRC", 100.0);
        store.transfer("alice", "bob", "GRC", 30.0).unwrap();
        assert_eq!(store.snapshot("alice").balance_of("GRC"), 70.0);
        assert_eq!(store.snapshot("bob").balance_of("GRC"), 30.0);
        assert_eq!(store.total_supply("GRC"), 100.0);
    }

    #[test]
    fn transfer_failure_leaves_both_accounts_untouched() {
        let store = AccountStore::new();
        store.credit("alice", "GRC", 5.0);
        let err = store.transfer("alice", "bob", "GRC", 10.0).unwrap_err();
        assert!(matches!(err, EngineError::InsufficientFunds { .. }));
        assert_eq!(store.snapshot("alice").balance_of("GRC"), 5.0);
        assert_eq!(store.snapshot("bob").balance_of("GRC"), 0.0);
    }

    #[test]
    fn snapshot_returns_independent_copy() {
        let store = AccountStore::new();
        store.credit("alice", "GRC", 10.0);
        let mut snap = store.snapshot("alice");
        snap.balances.insert("GRC".to_string(), 999.0);
        assert_eq!(store.snapshot("alice").balance_of("GRC"), 10.0);
    }
}

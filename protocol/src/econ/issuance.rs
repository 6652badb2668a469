//! # Issuance Curve
//!
//! `R(e) = R0 / (1 + K*e)^alpha`, monotonically decreasing in epoch index.
//! The operator/treasury split and the operator budget's stake/PoP split
//! are both fixed fractions applied on top.

use crate::config::IssuanceParams;

/// Total reward minted for epoch `e` (`e >= 0`).
pub fn epoch_reward(params: &IssuanceParams, epoch: i64) -> f64 {
    let e = epoch.max(0) as f64;
    params.r0 / (1.0 + params.k * e).powf(params.alpha)
}

/// Splits a total epoch reward into `(operator_budget, treasury_budget)`.
pub fn split_operator_treasury(total: f64, params: &IssuanceParams) -> (f64, f64) {
    (total * params.s_op, total * params.s_tr)
}

/// Splits the operator budget into `(stake_budget, pop_budget)` via
/// `reward_split_alpha`.
pub fn split_stake_pop(operator_budget: f64, reward_split_alpha: f64) -> (f64, f64) {
    (
        operator_budget * reward_split_alpha,
        operator_budget * (1.0 - reward_split_alpha),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn epoch_zero_reward_equals_r0() {
        let params = IssuanceParams::default();
        assert_eq!(epoch_reward(&params, 0), params.r0);
    }

    #[test]
    fn reward_decreases_monotonically() {
        let params = IssuanceParams::default();
        let r0 = epoch_reward(&params, 0);
        let r100 = epoch_reward(&params, 100);
        let r10000 = epoch_reward(&params, 10_000);
        assert!(r0 > r100);
        assert!(r100 > r10000);
    }

    #[test]
    fn operator_treasury_split_conserves_total() {
        let params = IssuanceParams::default();
        let total = epoch_reward(&params, 5);
        let (op, tr) = split_operator_treasury(total, &params);
        assert!((op + tr - total).abs() < 1e-9);
    }

    #[test]
    fn stake_pop_split_conserves_operator_budget() {
        let (stake, pop) = split_stake_pop(1000.0, 0.55);
        assert!((stake - 550.0).abs() < 1e-9);
        assert!((pop - 450.0).abs() < 1e-9);
        assert!((stake + pop - 1000.0).abs() < 1e-9);
    }
}

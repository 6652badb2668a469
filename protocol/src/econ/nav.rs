//! # NAV & Corridor
//!
//! Pure functions over already-collected state: no locking, no I/O. The
//! engine gathers a treasury snapshot and the outstanding GRC supply, then
//! calls these to decide whether a mint or redeem may proceed.

use std::collections::HashMap;

/// `reserves_in_USD / GRC_supply`. Defaults to `1.0` when supply is zero —
/// an intentional bootstrap asymmetry (the first mint is always at par); see
/// DESIGN.md for the rationale.
pub fn compute_nav(
    treasury_balances: &HashMap<String, f64>,
    total_grc_supply: f64,
    price_map: &HashMap<String, f64>,
) -> f64 {
    if total_grc_supply == 0.0 {
        return 1.0;
    }
    let reserves_usd: f64 = treasury_balances
        .iter()
        .map(|(asset, amount)| price_map.get(asset).copied().unwrap_or(0.0) * amount)
        .sum();
    reserves_usd / total_grc_supply
}

/// Symmetric `±band_bps` corridor around `target`.
pub fn corridor_bounds(target: f64, band_bps: u32) -> (f64, f64) {
    let band = band_bps as f64 / 10_000.0;
    (target * (1.0 - band), target * (1.0 + band))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nav_defaults_to_one_when_supply_is_zero() {
        let treasury = HashMap::new();
        let prices = HashMap::new();
        assert_eq!(compute_nav(&treasury, 0.0, &prices), 1.0);
    }

    #[test]
    fn nav_is_reserves_over_supply() {
        let mut treasury = HashMap::new();
        treasury.insert("USDC".to_string(), 1_001_000.0);
        let mut prices = HashMap::new();
        prices.insert("USDC".to_string(), 1.0);
        let nav = compute_nav(&treasury, 1000.0, &prices);
        assert!((nav - 1001.0).abs() < 1e-9);
    }

    #[test]
    fn corridor_bounds_are_symmetric_around_target() {
        let (lower, upper) = corridor_bounds(1.0, 10);
        assert!((lower - 0.999).abs() < 1e-9);
        assert!((upper - 1.001).abs() < 1e-9);
    }
}

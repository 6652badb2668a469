//! # Epoch Settlement
//!
//! Turns one epoch's PoP metrics, stake table, and issuance budget into a
//! concrete list of payout rows, plus the commitment hash the settling
//! author signs over in an `EPOCH_PAYOUT_COMMIT` transaction.

use std::collections::HashMap;

use serde_json::json;
use sha2::{Digest, Sha256};

use crate::chain::block::canonical_json;
use crate::config::POP_WORK_WEIGHTS;
use crate::storage::db::{EpochPayoutRow, PopEpochMetricsRow, PopNodeCapsRow, PopNodeRow, StakeRow, ValidatorRow};

pub const PAYOUT_KIND_STAKE: &str = "stake";
pub const PAYOUT_KIND_POP: &str = "pop";

fn normalize(value: f64, max: f64) -> f64 {
    if max <= 0.0 {
        if value > 0.0 {
            1.0
        } else {
            0.0
        }
    } else {
        (value / max).min(1.0)
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct EpochMaxes {
    blocks_relayed: f64,
    storage_io: f64,
    requests: f64,
}

fn epoch_maxes(rows: &[PopEpochMetricsRow]) -> EpochMaxes {
    let mut maxes = EpochMaxes::default();
    for row in rows {
        maxes.blocks_relayed = maxes.blocks_relayed.max(row.blocks_relayed);
        maxes.storage_io = maxes.storage_io.max(row.storage_io);
        maxes.requests = maxes.requests.max(row.requests);
    }
    maxes
}

/// `(consensus, network, storage, service)` component scores, each in `[0, 1]`.
///
/// `uptime` and `latency` are simply clamped — they already arrive as
/// fractions in `[0, 1]`. `blocks_relayed`, `storage_io`, and `requests` are
/// cumulative counters with no natural ceiling, so they're normalized by the
/// per-epoch max across all reporting nodes instead.
fn component_scores(row: &PopEpochMetricsRow, maxes: &EpochMaxes) -> (f64, f64, f64, f64) {
    let consensus = row.uptime.clamp(0.0, 1.0);
    let relayed_norm = normalize(row.blocks_relayed, maxes.blocks_relayed);
    let latency = row.latency.clamp(0.0, 1.0);
    let network = (0.5 * relayed_norm + 0.5 * latency).clamp(0.0, 1.0);
    let storage = normalize(row.storage_io, maxes.storage_io);
    let service = normalize(row.requests, maxes.requests);
    (consensus, network, storage, service)
}

/// The weighted, pre-cap work score for one node's epoch submission.
pub fn raw_work_score(row: &PopEpochMetricsRow, maxes_src: &[PopEpochMetricsRow]) -> f64 {
    let maxes = epoch_maxes(maxes_src);
    let (consensus, network, storage, service) = component_scores(row, &maxes);
    let (w_c, w_n, w_s, w_sv) = POP_WORK_WEIGHTS;
    w_c * consensus + w_n * network + w_s * storage + w_sv * service
}

/// A node's hardware capability ceiling, averaged across its four
/// registered dimensions. Unregistered nodes fall back to the configured
/// default cap.
pub fn hardware_cap(caps: Option<&PopNodeCapsRow>) -> f64 {
    caps.map(|c| ((c.cpu + c.ram + c.storage + c.bandwidth) / 4.0).clamp(0.0, 1.0))
        .unwrap_or(crate::config::POP_DEFAULT_HARDWARE_CAP)
}

/// Distributes `pop_budget` across nodes proportional to their cap-clamped
/// work score — `W_final / Σ W_final`. Slashing is deliberately NOT folded
/// in here: it must only reduce the slashed node's own payout, never
/// redistribute to other nodes, so it's applied afterward in
/// [`pop_reward_rows`].
pub fn pop_reward_shares(metrics: &[PopEpochMetricsRow], caps_by_node: &HashMap<String, PopNodeCapsRow>) -> Vec<(String, f64)> {
    let capped: Vec<(String, f64)> = metrics
        .iter()
        .map(|row| {
            let raw = raw_work_score(row, metrics);
            let cap = hardware_cap(caps_by_node.get(&row.node_id));
            (row.node_id.clone(), raw.min(cap))
        })
        .collect();

    let total: f64 = capped.iter().map(|(_, s)| s).sum();
    if total <= 0.0 {
        return capped.into_iter().map(|(id, _)| (id, 0.0)).collect();
    }
    capped.into_iter().map(|(id, s)| (id, s / total)).collect()
}

/// Distributes `stake_budget` proportional to locked stake, net of each
/// validator's commission which is paid separately to its operator wallet.
pub fn stake_reward_rows(
    epoch: i64,
    stake_budget: f64,
    stakes: &[StakeRow],
    validators: &HashMap<String, ValidatorRow>,
) -> Vec<EpochPayoutRow> {
    let total_staked: f64 = stakes.iter().map(|s| s.amount_rsx).sum();
    if total_staked <= 0.0 {
        return Vec::new();
    }
    let mut rows = Vec::new();
    for stake in stakes {
        let share = stake.amount_rsx / total_staked;
        let gross = stake_budget * share;
        if gross < crate::config::PAYOUT_DUST_THRESHOLD {
            continue;
        }
        let commission_bps = validators
            .get(&stake.validator)
            .map(|v| v.commission_bps)
            .unwrap_or(0)
            .min(crate::config::MAX_COMMISSION_BPS);
        let commission = gross * (commission_bps as f64 / 10_000.0);
        let net = gross - commission;
        if net >= crate::config::PAYOUT_DUST_THRESHOLD {
            rows.push(EpochPayoutRow {
                epoch,
                kind: PAYOUT_KIND_STAKE.to_string(),
                recipient: stake.staker.clone(),
                asset: crate::config::ASSET_GRC.to_string(),
                amount: net,
                meta_json: json!({"validator": stake.validator, "role": "delegator"}).to_string(),
            });
        }
        if commission >= crate::config::PAYOUT_DUST_THRESHOLD {
            if let Some(validator) = validators.get(&stake.validator) {
                rows.push(EpochPayoutRow {
                    epoch,
                    kind: PAYOUT_KIND_STAKE.to_string(),
                    recipient: validator.operator_wallet.clone(),
                    asset: crate::config::ASSET_GRC.to_string(),
                    amount: commission,
                    meta_json: json!({"validator": stake.validator, "role": "commission"}).to_string(),
                });
            }
        }
    }
    rows
}

/// Turns PoP reward shares into payout rows, crediting each node's
/// registered operator wallet rather than the node id itself.
///
/// `penalty_by_node` is applied per-node, after the share split: a slashed
/// node is credited `gross * (1 - penalty)`, and the withheld remainder is
/// summed into the returned total rather than silently redistributed to
/// other nodes' shares.
pub fn pop_reward_rows(
    epoch: i64,
    pop_budget: f64,
    shares: &[(String, f64)],
    nodes_by_id: &HashMap<String, PopNodeRow>,
    penalty_by_node: &HashMap<String, f64>,
) -> (Vec<EpochPayoutRow>, f64) {
    let mut slashed_total = 0.0;
    let rows = shares
        .iter()
        .filter_map(|(node_id, share)| {
            let gross = pop_budget * share;
            if gross < crate::config::PAYOUT_DUST_THRESHOLD {
                return None;
            }
            let penalty = penalty_by_node.get(node_id).copied().unwrap_or(0.0).clamp(0.0, 1.0);
            let net = gross * (1.0 - penalty);
            slashed_total += gross * penalty;
            if net < crate::config::PAYOUT_DUST_THRESHOLD {
                return None;
            }
            let recipient = nodes_by_id
                .get(node_id)
                .map(|n| n.operator_wallet.clone())
                .unwrap_or_else(|| node_id.clone());
            Some(EpochPayoutRow {
                epoch,
                kind: PAYOUT_KIND_POP.to_string(),
                recipient,
                asset: crate::config::ASSET_GRC.to_string(),
                amount: net,
                meta_json: json!({"node_id": node_id}).to_string(),
            })
        })
        .collect();
    (rows, slashed_total)
}

/// Deterministic commitment over a settled epoch's payout rows: sort by
/// `(kind, recipient, asset)`, canonicalize, and hash. Two settlers who
/// agree on the payout set always agree on this hash.
pub fn payout_hash(rows: &[EpochPayoutRow]) -> String {
    let mut sorted: Vec<&EpochPayoutRow> = rows.iter().collect();
    sorted.sort_by(|a, b| {
        (a.kind.as_str(), a.recipient.as_str(), a.asset.as_str())
            .cmp(&(b.kind.as_str(), b.recipient.as_str(), b.asset.as_str()))
    });
    let value = json!(sorted
        .iter()
        .map(|r| json!({
            "kind": r.kind,
            "recipient": r.recipient,
            "asset": r.asset,
            "amount": r.amount,
        }))
        .collect::<Vec<_>>());
    let mut hasher = Sha256::new();
    hasher.update(canonical_json(&value).as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(node_id: &str, uptime: f64, requests: f64) -> PopEpochMetricsRow {
        PopEpochMetricsRow {
            epoch: 1,
            node_id: node_id.to_string(),
            uptime,
            requests,
            blocks_relayed: 10.0,
            storage_io: 5.0,
            latency: 0.5,
            tx_hash: format!("tx-{node_id}"),
        }
    }

    #[test]
    fn pop_shares_sum_to_one_when_any_node_scores() {
        let metrics = vec![row("a", 0.9, 100.0), row("b", 0.5, 10.0)];
        let shares = pop_reward_shares(&metrics, &HashMap::new());
        let total: f64 = shares.iter().map(|(_, s)| s).sum();
        assert!((total - 1.0).abs() < 1e-9);
    }

    #[test]
    fn pop_shares_are_all_zero_when_every_node_scores_zero() {
        let metrics = vec![row("a", 0.0, 0.0)];
        let mut caps = HashMap::new();
        caps.insert(
            "a".to_string(),
            PopNodeCapsRow {
                node_id: "a".to_string(),
                cpu: 0.0,
                ram: 0.0,
                storage: 0.0,
                bandwidth: 0.0,
                tx_hash: None,
            },
        );
        let mut metrics_zeroed = metrics.clone();
        metrics_zeroed[0].blocks_relayed = 0.0;
        metrics_zeroed[0].storage_io = 0.0;
        let shares = pop_reward_shares(&metrics_zeroed, &caps);
        assert_eq!(shares[0].1, 0.0);
    }

    #[test]
    fn pop_penalty_reduces_only_slashed_node_and_is_returned_for_treasury() {
        let metrics = vec![row("a", 0.9, 100.0), row("b", 0.9, 100.0)];
        let shares = pop_reward_shares(&metrics, &HashMap::new());
        let mut penalties = HashMap::new();
        penalties.insert("a".to_string(), 0.5);
        let (rows, slashed_total) = pop_reward_rows(1, 1000.0, &shares, &HashMap::new(), &penalties);

        let unslashed_gross = 1000.0 * shares.iter().find(|(id, _)| id == "b").unwrap().1;
        let b_row = rows.iter().find(|r| r.recipient == "b").unwrap();
        assert!((b_row.amount - unslashed_gross).abs() < 1e-9);

        let slashed_gross = 1000.0 * shares.iter().find(|(id, _)| id == "a").unwrap().1;
        let a_row = rows.iter().find(|r| r.recipient == "a").unwrap();
        assert!((a_row.amount - slashed_gross * 0.5).abs() < 1e-9);
        assert!((slashed_total - slashed_gross * 0.5).abs() < 1e-9);

        let paid_out: f64 = rows.iter().map(|r| r.amount).sum();
        assert!((paid_out + slashed_total - 1000.0).abs() < 1e-6);
    }

    #[test]
    fn stake_rewards_net_of_commission_conserve_gross() {
        let stakes = vec![StakeRow {
            staker: "alice".to_string(),
            validator: "v1".to_string(),
            amount_rsx: 100.0,
            lock_until_epoch: 0,
            updated_at: "2026-01-01T00:00:00Z".to_string(),
        }];
        let mut validators = HashMap::new();
        validators.insert(
            "v1".to_string(),
            ValidatorRow {
                validator_id: "v1".to_string(),
                operator_wallet: "v1-operator".to_string(),
                commission_bps: 1000,
                status: "active".to_string(),
            },
        );
        let rows = stake_reward_rows(1, 1000.0, &stakes, &validators);
        let total: f64 = rows.iter().map(|r| r.amount).sum();
        assert!((total - 1000.0).abs() < 1e-6);
        assert_eq!(rows.len(), 2);
    }

    #[test]
    fn payout_hash_is_order_independent() {
        let a = EpochPayoutRow {
            epoch: 1,
            kind: "stake".to_string(),
            recipient: "alice".to_string(),
            asset: "GRC".to_string(),
            amount: 1.0,
            meta_json: "{}".to_string(),
        };
        let b = EpochPayoutRow {
            epoch: 1,
            kind: "pop".to_string(),
            recipient: "bob".to_string(),
            asset: "GRC".to_string(),
            amount: 2.0,
            meta_json: "{}".to_string(),
        };
        let h1 = payout_hash(&[a.clone(), b.clone()]);
        let h2 = payout_hash(&[b, a]);
        assert_eq!(h1, h2);
    }
}

//! # Slashing
//!
//! Deliberately conservative: a node is only ever docked reward, never
//! burned stake, and only on evidence gathered from its own submitted
//! metrics. Ambiguous signals fall through to [`Severity::None`] rather
//! than escalate.

use crate::config::SlashingConfig;
use crate::storage::db::{PopEpochMetricsRow, PopNodeCapsRow};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    None,
    Suspect,
    Critical,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SlashingVerdict {
    pub severity: Severity,
    pub penalty_factor: f64,
    pub reason_code: String,
    pub reason_detail: String,
}

impl SlashingVerdict {
    fn clean() -> Self {
        SlashingVerdict {
            severity: Severity::None,
            penalty_factor: 0.0,
            reason_code: "none".to_string(),
            reason_detail: String::new(),
        }
    }
}

/// The raw (un-normalized) work estimate used only for the slashing
/// cap-exceeded check — distinct from [`super::settlement::raw_work_score`],
/// which is the normalized `[0,1]` score used to size payouts.
pub fn raw_work_estimate(metrics: &PopEpochMetricsRow) -> f64 {
    metrics.requests + 50.0 * metrics.blocks_relayed + 5.0 * metrics.storage_io
}

fn caps_sum(caps: Option<&PopNodeCapsRow>) -> f64 {
    caps.map(|c| c.cpu + c.ram + c.storage + c.bandwidth).unwrap_or(0.0)
}

/// Whether this epoch's raw work estimate alone exceeds the capability
/// ceiling — the signal the caller accumulates across epochs into the
/// corroboration counter passed back into [`evaluate_node`].
pub fn exceeds_cap_this_epoch(metrics: &PopEpochMetricsRow, caps: Option<&PopNodeCapsRow>, cfg: &SlashingConfig) -> bool {
    raw_work_estimate(metrics) > cfg.cap_multiplier * caps_sum(caps).max(1.0) * 1e6
}

/// Evaluates one node's epoch submission. `consecutive_over_cap_epochs` is
/// the number of *prior* consecutive epochs (not counting this one) the
/// node's work estimate has exceeded its capability-derived ceiling,
/// tracked by the caller across epochs.
pub fn evaluate_node(
    metrics: &PopEpochMetricsRow,
    caps: Option<&PopNodeCapsRow>,
    consecutive_over_cap_epochs: u32,
    cfg: &SlashingConfig,
) -> SlashingVerdict {
    if metrics.uptime < 0.0
        || metrics.requests < 0.0
        || metrics.blocks_relayed < 0.0
        || metrics.storage_io < 0.0
        || metrics.latency < 0.0
    {
        return SlashingVerdict {
            severity: Severity::Critical,
            penalty_factor: cfg.penalty_severe,
            reason_code: "POP_INVALID_VALUES".to_string(),
            reason_detail: format!(
                "node {} reported a negative metric value",
                metrics.node_id
            ),
        };
    }

    let work_estimate = raw_work_estimate(metrics);
    let ceiling = cfg.cap_multiplier * caps_sum(caps).max(1.0) * 1e6;
    if work_estimate > ceiling && consecutive_over_cap_epochs >= cfg.corroboration_epochs {
        return SlashingVerdict {
            severity: Severity::Suspect,
            penalty_factor: cfg.penalty_suspect,
            reason_code: "POP_WORK_EXCEEDS_CAP".to_string(),
            reason_detail: format!(
                "node {} claimed work estimate {:.1} against ceiling {:.1} for {} consecutive prior epochs",
                metrics.node_id, work_estimate, ceiling, consecutive_over_cap_epochs
            ),
        };
    }

    if metrics.uptime < 0.20 && metrics.requests > 2_000_000.0 {
        return SlashingVerdict {
            severity: Severity::Suspect,
            penalty_factor: cfg.penalty_suspect,
            reason_code: "POP_UPTIME_WORK_CONTRADICTION".to_string(),
            reason_detail: format!(
                "node {} reported uptime {:.4} but {} requests served",
                metrics.node_id, metrics.uptime, metrics.requests
            ),
        };
    }

    SlashingVerdict::clean()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metrics(node_id: &str) -> PopEpochMetricsRow {
        PopEpochMetricsRow {
            epoch: 1,
            node_id: node_id.to_string(),
            uptime: 0.9,
            requests: 100.0,
            blocks_relayed: 10.0,
            storage_io: 5.0,
            latency: 0.8,
            tx_hash: "h".to_string(),
        }
    }

    #[test]
    fn clean_submission_has_no_penalty() {
        let cfg = SlashingConfig::default();
        let v = evaluate_node(&metrics("n1"), None, 0, &cfg);
        assert_eq!(v.severity, Severity::None);
        assert_eq!(v.penalty_factor, 0.0);
    }

    #[test]
    fn negative_metric_is_critical() {
        let cfg = SlashingConfig::default();
        let mut m = metrics("n1");
        m.requests = -1.0;
        let v = evaluate_node(&m, None, 0, &cfg);
        assert_eq!(v.severity, Severity::Critical);
        assert_eq!(v.penalty_factor, cfg.penalty_severe);
    }

    #[test]
    fn work_estimate_far_above_cap_with_corroboration_is_suspect() {
        let cfg = SlashingConfig::default();
        let mut m = metrics("n1");
        m.requests = 10.0 * cfg.cap_multiplier * 1e6;
        let v = evaluate_node(&m, None, cfg.corroboration_epochs, &cfg);
        assert_eq!(v.severity, Severity::Suspect);
        assert_eq!(v.penalty_factor, cfg.penalty_suspect);
    }

    #[test]
    fn work_estimate_above_cap_without_corroboration_is_clean() {
        let cfg = SlashingConfig::default();
        let mut m = metrics("n1");
        m.requests = 10.0 * cfg.cap_multiplier * 1e6;
        let v = evaluate_node(&m, None, 0, &cfg);
        assert_eq!(v.severity, Severity::None);
    }

    #[test]
    fn low_uptime_with_heavy_request_volume_is_suspect() {
        // S6: a node claims 5,000,000 requests at 10% uptime.
        let cfg = SlashingConfig::default();
        let mut m = metrics("n1");
        m.uptime = 0.1;
        m.requests = 5_000_000.0;
        let v = evaluate_node(&m, None, 0, &cfg);
        assert_eq!(v.severity, Severity::Suspect);
        assert_eq!(v.penalty_factor, 0.15);
        assert_eq!(v.reason_code, "POP_UPTIME_WORK_CONTRADICTION");
    }

    #[test]
    fn low_uptime_with_modest_requests_is_clean() {
        let cfg = SlashingConfig::default();
        let mut m = metrics("n1");
        m.uptime = 0.01;
        let v = evaluate_node(&m, None, 0, &cfg);
        assert_eq!(v.severity, Severity::None);
    }
}

//! # Prometheus Metrics
//!
//! Exposes operational metrics for the ledger node. Scraped at the
//! `/metrics` HTTP endpoint.
//!
//! All metrics are registered in a dedicated [`prometheus::Registry`] so they
//! do not collide with any default global registry consumers.

use prometheus::{Encoder, Gauge, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};
use std::sync::Arc;

/// Holds all Prometheus metric handles for the node.
#[derive(Clone)]
pub struct NodeMetrics {
    registry: Registry,
    /// Total number of blocks mined or ingested from an upstream peer.
    pub blocks_total: IntCounter,
    /// Transactions applied, labeled by tag (`TRANSFER`, `MINT`, ...).
    pub transactions_total: IntCounterVec,
    /// Transactions skipped during log replay (malformed or relaxed checks).
    pub replay_skipped_total: IntCounter,
    /// Current number of transactions waiting in the mempool.
    pub mempool_size: IntGauge,
    /// Height of the chain head.
    pub chain_height: IntGauge,
    /// Current proof-of-work difficulty (leading hex zeros).
    pub chain_difficulty: IntGauge,
    /// Most recently computed NAV.
    pub nav: Gauge,
    /// Follower sync cycles completed, labeled by upstream peer.
    pub sync_cycles_total: IntCounterVec,
    /// Number of blocks this node trails its furthest-ahead upstream peer by.
    pub sync_lag_blocks: IntGauge,
    /// Epochs settled (an `EPOCH_PAYOUT_COMMIT` transaction was applied).
    pub epochs_settled_total: IntCounter,
    /// Slashing events recorded, labeled by severity.
    pub slashing_events_total: IntCounterVec,
}

impl NodeMetrics {
    /// Creates and registers all metrics. Call once at startup.
    pub fn new() -> Self {
        let registry = Registry::new_custom(Some("reservechain".into()), None)
            .expect("failed to create prometheus registry");

        let blocks_total = IntCounter::new("blocks_total", "Total number of blocks mined or ingested")
            .expect("metric creation");
        registry.register(Box::new(blocks_total.clone())).expect("metric registration");

        let transactions_total = IntCounterVec::new(
            Opts::new("transactions_total", "Transactions applied, by tag"),
            &["tag"],
        )
        .expect("metric creation");
        registry.register(Box::new(transactions_total.clone())).expect("metric registration");

        let replay_skipped_total = IntCounter::new(
            "replay_skipped_total",
            "Transactions skipped during log replay",
        )
        .expect("metric creation");
        registry.register(Box::new(replay_skipped_total.clone())).expect("metric registration");

        let mempool_size = IntGauge::new("mempool_size", "Current number of pending transactions")
            .expect("metric creation");
        registry.register(Box::new(mempool_size.clone())).expect("metric registration");

        let chain_height = IntGauge::new("chain_height", "Height of the chain head").expect("metric creation");
        registry.register(Box::new(chain_height.clone())).expect("metric registration");

        let chain_difficulty =
            IntGauge::new("chain_difficulty", "Current proof-of-work difficulty").expect("metric creation");
        registry.register(Box::new(chain_difficulty.clone())).expect("metric registration");

        let nav = Gauge::new("nav", "Most recently computed net asset value").expect("metric creation");
        registry.register(Box::new(nav.clone())).expect("metric registration");

        let sync_cycles_total = IntCounterVec::new(
            Opts::new("sync_cycles_total", "Follower sync cycles completed, by peer"),
            &["peer"],
        )
        .expect("metric creation");
        registry.register(Box::new(sync_cycles_total.clone())).expect("metric registration");

        let sync_lag_blocks =
            IntGauge::new("sync_lag_blocks", "Blocks behind the furthest-ahead upstream peer").expect("metric creation");
        registry.register(Box::new(sync_lag_blocks.clone())).expect("metric registration");

        let epochs_settled_total =
            IntCounter::new("epochs_settled_total", "Epochs with a committed payout").expect("metric creation");
        registry.register(Box::new(epochs_settled_total.clone())).expect("metric registration");

        let slashing_events_total = IntCounterVec::new(
            Opts::new("slashing_events_total", "Slashing events recorded, by severity"),
            &["severity"],
        )
        .expect("metric creation");
        registry.register(Box::new(slashing_events_total.clone())).expect("metric registration");

        Self {
            registry,
            blocks_total,
            transactions_total,
            replay_skipped_total,
            mempool_size,
            chain_height,
            chain_difficulty,
            nav,
            sync_cycles_total,
            sync_lag_blocks,
            epochs_settled_total,
            slashing_events_total,
        }
    }

    /// Encodes all registered metrics into the Prometheus text exposition format.
    pub fn encode(&self) -> Result<String, prometheus::Error> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer)?;
        Ok(String::from_utf8(buffer).expect("prometheus output is valid utf-8"))
    }
}

impl Default for NodeMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Shared metrics state passed to axum handlers via extension.
pub type SharedMetrics = Arc<NodeMetrics>;

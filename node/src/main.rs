// Copyright (c) 2026 ALAS Technology. MIT License.
// See LICENSE for details.

//! # reservechain Node
//!
//! Entry point for the `reservechain-node` binary. Parses CLI arguments,
//! assembles the layered configuration, opens the chain, then either mines
//! (no upstream peers configured) or follows (peers configured) while
//! serving the node's minimal HTTP surface.

mod api;
mod cli;
mod logging;
mod metrics;

use std::fs;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::Parser;

use reservechain_protocol::chain::engine::Engine;
use reservechain_protocol::config::{ConfigFile, NodeConfig};
use reservechain_protocol::epoch::EpochScheduler;
use reservechain_protocol::storage::db::Db;

use api::AppState;
use cli::{Commands, ReservechainNodeCli, RunArgs};
use logging::LogFormat;
use metrics::NodeMetrics;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = ReservechainNodeCli::parse();

    match cli.command {
        Commands::Run(args) => run(args).await,
        Commands::Version => {
            println!("reservechain-node {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

fn assemble_config(args: &RunArgs) -> Result<NodeConfig> {
    let mut config = NodeConfig::default();

    if let Some(path) = &args.config {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        let file: ConfigFile = toml::from_str(&raw)
            .with_context(|| format!("parsing config file {}", path.display()))?;
        config.apply_file(file);
    }

    config.apply_env();

    if let Some(path) = &args.storage_path {
        config.storage_path = path.display().to_string();
    }
    if let Some(addr) = &args.listen_addr {
        config.listen_addr = addr.clone();
    }
    if !args.upstream_peers.is_empty() {
        config.upstream_peers = args.upstream_peers.clone();
    }
    if args.verify_upstream_pow {
        config.verify_upstream_pow = true;
    }
    if let Some(level) = &args.log_level {
        config.log_level = level.clone();
    }
    if args.log_json {
        config.log_json = true;
    }

    Ok(config)
}

async fn run(args: RunArgs) -> Result<()> {
    let config = assemble_config(&args)?;

    let format = if config.log_json { LogFormat::Json } else { LogFormat::Pretty };
    logging::init_logging(&config.log_level, format);

    tracing::info!(
        storage_path = %config.storage_path,
        listen_addr = %config.listen_addr,
        upstream_peers = ?config.upstream_peers,
        "starting reservechain-node"
    );

    let db = Db::open(&config.storage_path).context("opening chain database")?;
    let scheduler = EpochScheduler::new(config.genesis_unix, config.epoch_seconds.max(1));
    let miner_interval = config.miner_interval;
    let sync_interval = config.sync_interval;
    let upstream_peers = config.upstream_peers.clone();
    let verify_upstream_pow = config.verify_upstream_pow;

    let engine = Arc::new(Engine::open(db, config.clone()).context("opening chain engine")?);
    let metrics = Arc::new(NodeMetrics::new());

    if upstream_peers.is_empty() {
        spawn_miner_loop(engine.clone(), metrics.clone(), scheduler, miner_interval);
        spawn_epoch_driver(engine.clone(), metrics.clone(), scheduler, EPOCH_DRIVER_CHECK_INTERVAL);
    } else {
        // A follower replicates whatever its upstream already settled —
        // running its own epoch driver here would double-pay every epoch.
        reservechain_protocol::sync::spawn(engine.clone(), upstream_peers, sync_interval, verify_upstream_pow);
    }

    let state = AppState {
        engine: engine.clone(),
        metrics,
    };
    let app = api::router(state);

    let addr: SocketAddr = config
        .listen_addr
        .parse()
        .with_context(|| format!("invalid listen address {}", config.listen_addr))?;
    let listener = tokio::net::TcpListener::bind(addr).await.context("binding HTTP listener")?;
    tracing::info!(%addr, "HTTP surface listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server error")?;

    Ok(())
}

/// Periodically ticks the miner: mines the highest-priority pending
/// transaction, or an `EMPTY` heartbeat block when the mempool is empty.
/// Only runs when this node has no upstream peers to follow instead.
fn spawn_miner_loop(engine: Arc<Engine>, metrics: Arc<NodeMetrics>, scheduler: EpochScheduler, interval: Duration) {
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(interval).await;
            let now = Utc::now();
            let current_epoch = Some(scheduler.epoch_index_for_time(now));
            match engine.mine_tick(now, current_epoch) {
                Ok((block, _tx_hash)) => {
                    metrics.blocks_total.inc();
                    metrics.transactions_total.with_label_values(&[block.tx_type.as_str()]).inc();
                    metrics.chain_height.set(block.height as i64);
                    metrics.chain_difficulty.set(block.difficulty as i64);
                    metrics.nav.set(engine.nav());
                    metrics.mempool_size.set(engine.mempool_len() as i64);
                }
                Err(e) => {
                    tracing::warn!(error = %e, "miner tick failed");
                }
            }
        }
    });
}

/// How often the epoch driver wakes to check whether the currently tracked
/// epoch has closed. Independent of the miner tick — settlement only
/// happens once per epoch, not once per block.
const EPOCH_DRIVER_CHECK_INTERVAL: Duration = Duration::from_secs(30);

/// Periodically settles closed epochs: sizes the issuance budget, pays out
/// stake and PoP rewards, and commits the result via
/// [`Engine::settle_epoch`]. Catches up on any epochs closed while the node
/// was offline before resuming its normal cadence.
fn spawn_epoch_driver(engine: Arc<Engine>, metrics: Arc<NodeMetrics>, scheduler: EpochScheduler, interval: Duration) {
    tokio::spawn(async move {
        let mut next_epoch: i64 = 0;
        loop {
            tokio::time::sleep(interval).await;
            let now = Utc::now();
            while scheduler.epoch_has_closed(next_epoch, now) {
                if matches!(engine.db().get_epoch_payout_commit_for_epoch(next_epoch), Ok(Some(_))) {
                    next_epoch += 1;
                    continue;
                }
                match engine.settle_epoch(next_epoch, now) {
                    Ok((block, _tx_hash)) => {
                        metrics.epochs_settled_total.inc();
                        metrics.blocks_total.inc();
                        metrics.transactions_total.with_label_values(&[block.tx_type.as_str()]).inc();
                        metrics.chain_height.set(block.height as i64);
                        metrics.chain_difficulty.set(block.difficulty as i64);
                        if let Ok(events) = engine.db().list_slashing_events() {
                            for event in events.iter().filter(|e| e.epoch == next_epoch) {
                                metrics.slashing_events_total.with_label_values(&[event.severity.as_str()]).inc();
                            }
                        }
                        tracing::info!(epoch = next_epoch, height = block.height, "settled epoch");
                        next_epoch += 1;
                    }
                    Err(e) => {
                        tracing::warn!(epoch = next_epoch, error = %e, "epoch settlement failed, retrying next tick");
                        break;
                    }
                }
            }
        }
    });
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    tracing::info!("shutdown signal received, draining in-flight requests");
}

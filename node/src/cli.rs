//! # CLI Interface
//!
//! Command-line argument structure for `reservechain-node` using `clap`
//! derive. A single `run` subcommand plus `version`; almost everything is
//! also settable via `RESERVECHAIN_*` environment variables or a TOML
//! config file, per [`reservechain_protocol::config::NodeConfig`]'s
//! layering order.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// reservechain ledger node.
///
/// Mines or follows a single reserve-currency chain, serves its minimal
/// HTTP surface, and exposes Prometheus metrics.
#[derive(Parser, Debug)]
#[command(
    name = "reservechain-node",
    about = "reservechain ledger node",
    version,
    propagate_version = true
)]
pub struct ReservechainNodeCli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start the node: open (or create) the chain, then mine or follow.
    Run(RunArgs),
    /// Print version information and exit.
    Version,
}

/// Arguments for the `run` subcommand. Any flag omitted here falls back to
/// the config file, then the environment, then the compiled default.
#[derive(Parser, Debug)]
pub struct RunArgs {
    /// Path to an optional TOML configuration file overlay.
    #[arg(long, short = 'c', env = "RESERVECHAIN_CONFIG")]
    pub config: Option<PathBuf>,

    /// Directory holding the embedded `sled` database.
    #[arg(long, short = 'd', env = "RESERVECHAIN_STORAGE_PATH")]
    pub storage_path: Option<PathBuf>,

    /// Address the HTTP surface listens on.
    #[arg(long, env = "RESERVECHAIN_LISTEN_ADDR")]
    pub listen_addr: Option<String>,

    /// Upstream peer base URLs to follow (comma-separated). When empty,
    /// this node mines instead of following.
    #[arg(long, env = "RESERVECHAIN_UPSTREAM_PEERS", value_delimiter = ',')]
    pub upstream_peers: Vec<String>,

    /// Re-verify proof-of-work on every block fetched from an upstream peer.
    #[arg(long)]
    pub verify_upstream_pow: bool,

    /// Log level filter used when `RUST_LOG` is unset.
    #[arg(long, env = "RESERVECHAIN_LOG_LEVEL")]
    pub log_level: Option<String>,

    /// Emit JSON log lines instead of pretty-printed ones.
    #[arg(long)]
    pub log_json: bool,
}

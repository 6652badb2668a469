//! # Protocol Configuration & Constants
//!
//! Every tunable that governs consensus-sensitive behavior lives here:
//! difficulty bounds, issuance curve parameters, reward splits, slashing
//! thresholds, the NAV corridor, and the price map. If you're hardcoding
//! one of these elsewhere, move it here instead.
//!
//! [`NodeConfig`] is the runtime-assembled view of these values: defaults
//! defined in this file, overridden by an optional TOML file, then by
//! environment variables, then by CLI flags (highest precedence last).

use std::collections::HashMap;
use std::time::Duration;

// ---------------------------------------------------------------------------
// Protocol identity
// ---------------------------------------------------------------------------

/// Wire/storage schema version. Bump on any change to block hash, the
/// persisted log schema, or the transaction taxonomy.
pub const PROTOCOL_VERSION: &str = "0.1.0";

// ---------------------------------------------------------------------------
// Proof-of-work / block timing
// ---------------------------------------------------------------------------

/// Target inter-block time. Difficulty retargets around this.
pub const BLOCK_TIME_TARGET: Duration = Duration::from_secs(10);

/// Lower bound on difficulty (leading hex zeros required in a block hash).
pub const DIFFICULTY_MIN: u32 = 2;

/// Upper bound on difficulty.
pub const DIFFICULTY_MAX: u32 = 8;

/// Genesis block difficulty.
pub const DIFFICULTY_GENESIS: u32 = 4;

/// Default miner tick interval — how often the miner loop wakes to check
/// the mempool and, if empty, mine a heartbeat block.
pub const DEFAULT_MINER_INTERVAL: Duration = Duration::from_secs(5);

// ---------------------------------------------------------------------------
// NAV corridor
// ---------------------------------------------------------------------------

/// NAV target (1 GRC should be worth 1 USD of reserves at par).
pub const CORRIDOR_TARGET: f64 = 1.0;

/// Symmetric corridor half-width, in basis points.
pub const CORRIDOR_BAND_BPS: u32 = 10;

/// Tolerance used when comparing budgets/balances that should conserve
/// exactly under real arithmetic but drift under IEEE-754 doubles.
pub const CONSERVATION_EPSILON: f64 = 1e-6;

/// Dust threshold below which a computed payout is skipped rather than
/// written as a ledger row with an amount indistinguishable from zero.
pub const PAYOUT_DUST_THRESHOLD: f64 = 1e-12;

// ---------------------------------------------------------------------------
// Issuance curve
// ---------------------------------------------------------------------------

/// Epoch issuance curve and operator/treasury split, `R(e) = R0 / (1 + K·e)^α`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IssuanceParams {
    pub r0: f64,
    pub k: f64,
    pub alpha: f64,
    pub s_op: f64,
    pub s_tr: f64,
}

impl Default for IssuanceParams {
    fn default() -> Self {
        IssuanceParams {
            r0: 1000.0,
            k: 0.001,
            alpha: 1.5,
            s_op: 0.80,
            s_tr: 0.20,
        }
    }
}

/// Split of the operator budget between PoS stake rewards and PoP work rewards.
pub const REWARD_SPLIT_ALPHA: f64 = 0.55;

/// Reference weights for the four PoP work-score components:
/// (consensus/uptime, network, storage, service).
pub const POP_WORK_WEIGHTS: (f64, f64, f64, f64) = (0.45, 0.25, 0.15, 0.15);

/// Hardware cap applied to a node's work score when it has registered no
/// capability row.
pub const POP_DEFAULT_HARDWARE_CAP: f64 = 0.25;

/// Hard ceiling on validator commission, in basis points (50%).
pub const MAX_COMMISSION_BPS: u32 = 5000;

// ---------------------------------------------------------------------------
// Slashing
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SlashingConfig {
    /// Work-estimate-to-capability multiplier above which a node is "suspect".
    pub cap_multiplier: f64,
    /// Number of consecutive epochs the cap-exceeded condition must
    /// corroborate before it is treated as an anomaly.
    pub corroboration_epochs: u32,
    /// Penalty factor applied to a suspect node's current-epoch reward.
    pub penalty_suspect: f64,
    /// Penalty factor applied to a critically anomalous node (zeroes the
    /// current-epoch reward).
    pub penalty_severe: f64,
}

impl Default for SlashingConfig {
    fn default() -> Self {
        SlashingConfig {
            cap_multiplier: 5.0,
            corroboration_epochs: 2,
            penalty_suspect: 0.15,
            penalty_severe: 1.0,
        }
    }
}

// ---------------------------------------------------------------------------
// Epoch scheduling
// ---------------------------------------------------------------------------

/// Default epoch length, in seconds.
pub const DEFAULT_EPOCH_SECONDS: i64 = 3600;

// ---------------------------------------------------------------------------
// Special addresses & asset symbols
// ---------------------------------------------------------------------------

pub const ADDR_TREASURY: &str = "treasury";
pub const ADDR_TREASURY_TIERS: &str = "treasury-tiers";
pub const ADDR_STAKE_ESCROW: &str = "stake-escrow";

/// Pseudo-address for a vault with the given id.
pub fn vault_address(vault_id: &str) -> String {
    format!("vault:{vault_id}")
}

pub const ASSET_GRC: &str = "GRC";
pub const ASSET_USDR: &str = "USDR";
pub const ASSET_USDC: &str = "USDC";
pub const ASSET_USDT: &str = "USDT";
pub const ASSET_DAI: &str = "DAI";
pub const ASSET_ETH: &str = "ETH";
pub const ASSET_WBTC: &str = "WBTC";
pub const ASSET_RSX: &str = "RSX";

/// Backing assets MINT will accept.
pub const MINT_BACKING_ASSETS: &[&str] = &[ASSET_USDC, ASSET_USDT, ASSET_DAI];

/// Default USD price map used to compute NAV, keyed by asset symbol.
/// Stablecoins are pegged at 1.0; ETH/WBTC use a configured reference rate.
pub fn default_price_map() -> HashMap<String, f64> {
    let mut m = HashMap::new();
    m.insert(ASSET_USDC.to_string(), 1.0);
    m.insert(ASSET_USDT.to_string(), 1.0);
    m.insert(ASSET_DAI.to_string(), 1.0);
    m.insert(ASSET_ETH.to_string(), 2000.0);
    m.insert(ASSET_WBTC.to_string(), 40_000.0);
    m
}

// ---------------------------------------------------------------------------
// Follower sync
// ---------------------------------------------------------------------------

/// Default follower poll interval.
pub const DEFAULT_SYNC_INTERVAL: Duration = Duration::from_secs(4);

/// Maximum number of blocks fetched per `/blocks` page.
pub const SYNC_PAGE_LIMIT: u64 = 50;

/// Per-request timeout for follower HTTP calls.
pub const SYNC_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

// ---------------------------------------------------------------------------
// Runtime configuration
// ---------------------------------------------------------------------------

/// Fully assembled node configuration: compiled-in defaults, layered with an
/// optional TOML file, environment variables, then CLI flags. Parsed once at
/// startup; components never read the environment directly.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub genesis_unix: i64,
    pub epoch_seconds: i64,
    pub issuance: IssuanceParams,
    pub reward_split_alpha: f64,
    pub slashing: SlashingConfig,
    pub corridor_target: f64,
    pub corridor_band_bps: u32,
    pub price_map: HashMap<String, f64>,
    pub miner_interval: Duration,
    pub sync_interval: Duration,
    pub storage_path: String,
    pub listen_addr: String,
    pub upstream_peers: Vec<String>,
    pub verify_upstream_pow: bool,
    pub log_level: String,
    pub log_json: bool,
}

impl Default for NodeConfig {
    fn default() -> Self {
        NodeConfig {
            genesis_unix: 0,
            epoch_seconds: DEFAULT_EPOCH_SECONDS,
            issuance: IssuanceParams::default(),
            reward_split_alpha: REWARD_SPLIT_ALPHA,
            slashing: SlashingConfig::default(),
            corridor_target: CORRIDOR_TARGET,
            corridor_band_bps: CORRIDOR_BAND_BPS,
            price_map: default_price_map(),
            miner_interval: DEFAULT_MINER_INTERVAL,
            sync_interval: DEFAULT_SYNC_INTERVAL,
            storage_path: "./data/db".to_string(),
            listen_addr: "0.0.0.0:8080".to_string(),
            upstream_peers: Vec::new(),
            verify_upstream_pow: false,
            log_level: "info".to_string(),
            log_json: false,
        }
    }
}

/// A partial overlay parsed from a TOML config file. Every field optional so
/// a file only needs to mention what it overrides.
#[derive(Debug, Clone, Default, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct ConfigFile {
    pub genesis_unix: Option<i64>,
    pub epoch_seconds: Option<i64>,
    pub corridor_target: Option<f64>,
    pub corridor_band_bps: Option<u32>,
    pub miner_interval_secs: Option<u64>,
    pub sync_interval_secs: Option<u64>,
    pub storage_path: Option<String>,
    pub listen_addr: Option<String>,
    pub upstream_peers: Option<Vec<String>>,
    pub verify_upstream_pow: Option<bool>,
    pub log_level: Option<String>,
    pub log_json: Option<bool>,
}

impl NodeConfig {
    /// Applies a parsed TOML overlay on top of the current configuration.
    pub fn apply_file(&mut self, file: ConfigFile) {
        if let Some(v) = file.genesis_unix {
            self.genesis_unix = v;
        }
        if let Some(v) = file.epoch_seconds {
            self.epoch_seconds = v;
        }
        if let Some(v) = file.corridor_target {
            self.corridor_target = v;
        }
        if let Some(v) = file.corridor_band_bps {
            self.corridor_band_bps = v;
        }
        if let Some(v) = file.miner_interval_secs {
            self.miner_interval = Duration::from_secs(v);
        }
        if let Some(v) = file.sync_interval_secs {
            self.sync_interval = Duration::from_secs(v);
        }
        if let Some(v) = file.storage_path {
            self.storage_path = v;
        }
        if let Some(v) = file.listen_addr {
            self.listen_addr = v;
        }
        if let Some(v) = file.upstream_peers {
            self.upstream_peers = v;
        }
        if let Some(v) = file.verify_upstream_pow {
            self.verify_upstream_pow = v;
        }
        if let Some(v) = file.log_level {
            self.log_level = v;
        }
        if let Some(v) = file.log_json {
            self.log_json = v;
        }
    }

    /// Applies environment variable overrides, prefixed `RESERVECHAIN_`.
    pub fn apply_env(&mut self) {
        if let Ok(v) = std::env::var("RESERVECHAIN_STORAGE_PATH") {
            self.storage_path = v;
        }
        if let Ok(v) = std::env::var("RESERVECHAIN_LISTEN_ADDR") {
            self.listen_addr = v;
        }
        if let Ok(v) = std::env::var("RESERVECHAIN_LOG_LEVEL") {
            self.log_level = v;
        }
        if let Ok(v) = std::env::var("RESERVECHAIN_UPSTREAM_PEERS") {
            self.upstream_peers = v.split(',').map(|s| s.trim().to_string()).collect();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn difficulty_bounds_contain_genesis() {
        assert!(DIFFICULTY_GENESIS >= DIFFICULTY_MIN);
        assert!(DIFFICULTY_GENESIS <= DIFFICULTY_MAX);
    }

    #[test]
    fn issuance_defaults_match_reference() {
        let p = IssuanceParams::default();
        assert_eq!(p.r0, 1000.0);
        assert_eq!(p.k, 0.001);
        assert_eq!(p.alpha, 1.5);
        assert!((p.s_op + p.s_tr - 1.0).abs() < CONSERVATION_EPSILON);
    }

    #[test]
    fn mint_backing_assets_exclude_grc() {
        assert!(!MINT_BACKING_ASSETS.contains(&ASSET_GRC));
        assert!(MINT_BACKING_ASSETS.contains(&ASSET_USDC));
    }

    #[test]
    fn default_price_map_covers_all_backing_assets() {
        let prices = default_price_map();
        for asset in MINT_BACKING_ASSETS {
            assert!(prices.contains_key(*asset), "missing price for {asset}");
        }
    }

    #[test]
    fn vault_address_format() {
        assert_eq!(vault_address("abc123"), "vault:abc123");
    }

    #[test]
    fn slashing_defaults_match_reference() {
        let s = SlashingConfig::default();
        assert_eq!(s.cap_multiplier, 5.0);
        assert_eq!(s.corroboration_epochs, 2);
        assert_eq!(s.penalty_suspect, 0.15);
        assert_eq!(s.penalty_severe, 1.0);
    }

    #[test]
    fn config_file_overlay_only_touches_present_fields() {
        let mut cfg = NodeConfig::default();
        let original_epoch_seconds = cfg.epoch_seconds;
        cfg.apply_file(ConfigFile {
            corridor_band_bps: Some(25),
            ..Default::default()
        });
        assert_eq!(cfg.corridor_band_bps, 25);
        assert_eq!(cfg.epoch_seconds, original_epoch_seconds);
    }
}

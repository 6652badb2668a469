//! # Follower Sync
//!
//! Polls an upstream node's minimal HTTP surface (`/head`, `/blocks`) and
//! replays whatever it's missing. Best-effort: a failed poll or a rejected
//! page just waits for the next tick rather than tearing down the task.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::chain::block::Block;
use crate::chain::engine::Engine;
use crate::config::{SYNC_PAGE_LIMIT, SYNC_REQUEST_TIMEOUT};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeadResponse {
    pub height: u64,
    pub hash: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncBlockEntry {
    pub block: Block,
    pub tx_type: String,
    pub body_json: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlocksPageResponse {
    pub blocks: Vec<SyncBlockEntry>,
}

pub struct FollowerSync {
    client: reqwest::Client,
    peers: Vec<String>,
    engine: Arc<Engine>,
    interval: Duration,
    verify_upstream_pow: bool,
}

impl FollowerSync {
    pub fn new(engine: Arc<Engine>, peers: Vec<String>, interval: Duration, verify_upstream_pow: bool) -> Self {
        let client = reqwest::Client::builder()
            .timeout(SYNC_REQUEST_TIMEOUT)
            .build()
            .expect("reqwest client builds with static config");
        FollowerSync {
            client,
            peers,
            engine,
            interval,
            verify_upstream_pow,
        }
    }

    /// Runs the poll loop until the process is torn down. Never returns
    /// `Err` — all failures are logged and retried on the next tick.
    pub async fn run_forever(&self) {
        if self.peers.is_empty() {
            info!("no upstream peers configured, follower sync is idle");
            return;
        }
        loop {
            for peer in &self.peers {
                if let Err(e) = self.sync_once_from(peer).await {
                    warn!(peer, error = %e, "sync cycle failed, will retry");
                }
            }
            tokio::time::sleep(self.interval).await;
        }
    }

    /// One fetch-and-replay cycle against a single peer: gets its head,
    /// then pages forward from our own head until caught up.
    async fn sync_once_from(&self, peer: &str) -> anyhow::Result<()> {
        let upstream_head: HeadResponse = self
            .client
            .get(format!("{peer}/head"))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        loop {
            let local_height = self.engine.head().height;
            if local_height >= upstream_head.height {
                debug!(peer, local_height, upstream_height = upstream_head.height, "sync caught up");
                return Ok(());
            }

            let from = local_height + 1;
            let page: BlocksPageResponse = self
                .client
                .get(format!("{peer}/blocks"))
                .query(&[("from_height", from), ("limit", SYNC_PAGE_LIMIT)])
                .send()
                .await?
                .error_for_status()?
                .json()
                .await?;

            if page.blocks.is_empty() {
                warn!(peer, from, "upstream returned no blocks for a non-empty range, stopping this cycle");
                return Ok(());
            }

            for entry in page.blocks {
                if let Err(e) = self.engine.ingest_follower_block(
                    entry.block,
                    &entry.tx_type,
                    &entry.body_json,
                    self.verify_upstream_pow,
                ) {
                    error!(peer, error = %e, "rejected block from upstream, stopping this cycle");
                    return Ok(());
                }
            }
        }
    }
}

/// Spawns the follower loop as a background task. A no-op if there are no
/// configured peers.
pub fn spawn(engine: Arc<Engine>, peers: Vec<String>, interval: Duration, verify_upstream_pow: bool) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let sync = FollowerSync::new(engine, peers, interval, verify_upstream_pow);
        sync.run_forever().await;
    })
}

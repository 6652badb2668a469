//! # HTTP Surface
//!
//! The node's entire external API: five routes, no more. Followers need
//! `/head` and `/blocks` to sync; clients need `/tx` to submit and
//! `/healthz`/`/metrics` to be operated. Wallet signature verification, a
//! websocket feed, and anything resembling a full RPC surface are
//! deliberately out of scope here.

use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::{Method, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use reservechain_protocol::chain::engine::Engine;
use reservechain_protocol::epoch::EpochScheduler;
use reservechain_protocol::sync::{BlocksPageResponse, HeadResponse, SyncBlockEntry};
use reservechain_protocol::tx::TxEnvelope;
use serde::Deserialize;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::metrics::SharedMetrics;

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<Engine>,
    pub metrics: SharedMetrics,
}

pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers(Any);

    Router::new()
        .route("/head", get(head))
        .route("/blocks", get(blocks))
        .route("/tx", post(submit_tx))
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn head(State(state): State<AppState>) -> impl IntoResponse {
    let block = state.engine.head();
    Json(HeadResponse {
        height: block.height,
        hash: block.hash,
    })
}

#[derive(Debug, Deserialize)]
struct BlocksQuery {
    from_height: u64,
    limit: Option<u64>,
}

async fn blocks(State(state): State<AppState>, Query(q): Query<BlocksQuery>) -> impl IntoResponse {
    let limit = q
        .limit
        .unwrap_or(reservechain_protocol::config::SYNC_PAGE_LIMIT)
        .min(500);
    let db = state.engine.db();
    let range = match db.get_block_range(q.from_height, limit) {
        Ok(r) => r,
        Err(e) => {
            tracing::error!(error = %e, "failed to read block range");
            return (StatusCode::INTERNAL_SERVER_ERROR, "storage error").into_response();
        }
    };

    let mut entries = Vec::with_capacity(range.len());
    for block in range {
        let tx_row = match db.get_tx_row(block.height) {
            Ok(Some(row)) => row,
            Ok(None) => {
                tracing::error!(height = block.height, "block has no matching tx row");
                continue;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to read tx row");
                continue;
            }
        };
        entries.push(SyncBlockEntry {
            block,
            tx_type: tx_row.tx_type,
            body_json: tx_row.body_json,
        });
    }

    Json(BlocksPageResponse { blocks: entries }).into_response()
}

async fn submit_tx(State(state): State<AppState>, Json(envelope): Json<TxEnvelope>) -> impl IntoResponse {
    let now = Utc::now();
    let scheduler = EpochScheduler::new(
        state.engine.config().genesis_unix,
        state.engine.config().epoch_seconds.max(1),
    );
    let current_epoch = Some(scheduler.epoch_index_for_time(now));

    match state.engine.submit(envelope, now, current_epoch) {
        Ok((block, tx_hash)) => {
            state.metrics.blocks_total.inc();
            state
                .metrics
                .transactions_total
                .with_label_values(&[block.tx_type.as_str()])
                .inc();
            state.metrics.chain_height.set(block.height as i64);
            state.metrics.chain_difficulty.set(block.difficulty as i64);
            (
                StatusCode::OK,
                Json(serde_json::json!({"height": block.height, "hash": tx_hash})),
            )
                .into_response()
        }
        Err(e) => (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({"error": e.to_string()})),
        )
            .into_response(),
    }
}

async fn healthz(State(state): State<AppState>) -> impl IntoResponse {
    let block = state.engine.head();
    Json(serde_json::json!({
        "status": "ok",
        "height": block.height,
        "hash": block.hash,
    }))
}

async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    match state.metrics.encode() {
        Ok(body) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
            body,
        )
            .into_response(),
        Err(e) => {
            tracing::error!(error = %e, "failed to encode metrics");
            (StatusCode::INTERNAL_SERVER_ERROR, "metrics encoding failed").into_response()
        }
    }
}

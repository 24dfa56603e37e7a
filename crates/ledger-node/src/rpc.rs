//! Read-only HTTP status surface.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use ledger_core::{format_hash, parse_hash};
use serde::Serialize;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::node::{Node, NodeState};

#[derive(Serialize)]
struct Health {
    status: &'static str,
}

#[derive(Serialize)]
pub struct Status {
    pub state: NodeState,
    pub running: bool,
    pub height: u64,
    pub top_hash: Option<String>,
    pub peers: usize,
    pub mempool: usize,
}

#[derive(Serialize)]
pub struct BlockInfo {
    pub hash: String,
    pub known: bool,
    pub height: Option<u64>,
    pub active: Option<bool>,
    pub txs: Option<usize>,
    pub next: Option<String>,
}

pub fn router(node: Arc<Node>) -> Router {
    Router::new()
        .route("/health", get(|| async { Json(Health { status: "ok" }) }))
        .route("/status", get(status))
        .route("/block/{hash}", get(block))
        .with_state(node)
        .layer(TraceLayer::new_for_http())
}

pub async fn serve(node: Arc<Node>, addr: SocketAddr) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("status server listening on http://{addr}");
    axum::serve(listener, router(node)).await?;
    Ok(())
}

fn internal(err: impl std::fmt::Display) -> Response {
    (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response()
}

async fn status(State(node): State<Arc<Node>>) -> Response {
    let top = match node.store().get_top_block().await {
        Ok(top) => top,
        Err(err) => return internal(err),
    };
    Json(Status {
        state: node.state(),
        running: node.is_running(),
        height: top.as_ref().map_or(0, |b| b.height),
        top_hash: top.map(|b| format_hash(&b.hash())),
        peers: node.peers().active_connections().await.len(),
        mempool: node.mempool().len().await,
    })
    .into_response()
}

async fn block(State(node): State<Arc<Node>>, Path(hash): Path<String>) -> Response {
    let Some(parsed) = parse_hash(&hash) else {
        return (StatusCode::BAD_REQUEST, "expected a 64 character hex hash").into_response();
    };
    let store = node.store();
    let block = match store.get_block_by_hash(&parsed).await {
        Ok(block) => block,
        Err(err) => return internal(err),
    };
    let next = match store.get_block_by_prev(&parsed).await {
        Ok(next) => next.map(|b| format_hash(&b.hash())),
        Err(err) => return internal(err),
    };
    Json(BlockInfo {
        hash: format_hash(&parsed),
        known: block.is_some(),
        height: block.as_ref().map(|b| b.height),
        active: block.as_ref().map(|b| b.active),
        txs: block.as_ref().map(|b| b.txs.len()),
        next,
    })
    .into_response()
}

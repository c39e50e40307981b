//! HTTP server for a node.
//!
//! Mutating requests are funneled through the envelope pipeline: assign a
//! request id, execute locally, broadcast the (request, response) pair, and
//! answer with the response plus its block reference. Read-only endpoints
//! (`/status`, `/block`, `/debug`, probes) query the engine directly.

use crate::metrics;
use crate::response::{BlockTxsDetail, ClientResponse, ResponseInfo, TransactionStatus};
use crate::TandemNode;
use axum::extract::{ConnectInfo, Path, Request as HttpRequest, State};
use axum::http::{header, Method, StatusCode};
use axum::response::{Html, IntoResponse, Response as HttpResponse};
use axum::routing::{any, get};
use axum::{Json, Router};
use chrono::Utc;
use prometheus::{Encoder, TextEncoder};
use rand::RngCore;
use serde_json::json;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tandem_cluster::{ConsensusEngine, EngineError, TxQuery, CODE_MEMPOOL_FULL, CODE_OK};
use tandem_types::{compact_json_body, Request, Transaction};
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info};

/// Request bodies above this size are refused before entering the pipeline.
const BODY_LIMIT: usize = 10 * 1024 * 1024;

/// Shared state for the HTTP handlers.
#[derive(Clone)]
pub struct AppState {
    pub node: Arc<TandemNode>,
}

/// Build the node's router.
pub fn router(node: Arc<TandemNode>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE, header::ACCEPT]);

    Router::new()
        .route("/", get(root_handler))
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .route("/debug", get(debug_handler))
        .route("/status/{tx_hash}", get(transaction_status_handler))
        .route("/block/{height}", get(block_handler))
        .route("/session/{*rest}", any(service_handler))
        .route("/commit/{*rest}", any(service_handler))
        .layer(cors)
        .with_state(AppState { node })
}

/// Serve until the task is aborted or the listener fails.
pub async fn serve(node: Arc<TandemNode>, listener: tokio::net::TcpListener) {
    let addr = listener.local_addr().ok();
    info!(?addr, node_id = node.node_id(), "web server listening");
    if let Err(err) = axum::serve(
        listener,
        router(node).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
    {
        error!(error = ?err, "web server error");
    }
}

fn generate_request_id() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

fn json_response(status: u16, body: String) -> HttpResponse {
    (
        StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
        [(header::CONTENT_TYPE, "application/json")],
        body,
    )
        .into_response()
}

fn json_error(status: u16, message: &str) -> HttpResponse {
    json_response(status, json!({ "error": message }).to_string())
}

// ═══════════════════════════════════════════════════════════════════════════
// Envelope pipeline
// ═══════════════════════════════════════════════════════════════════════════

async fn service_handler(State(state): State<AppState>, request: HttpRequest) -> HttpResponse {
    let method = request.method().as_str().to_string();
    let path = request.uri().path().to_string();
    let remote_addr = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0.to_string())
        .unwrap_or_else(|| "unknown".to_string());

    let mut headers = BTreeMap::new();
    for (name, value) in request.headers() {
        if let Ok(value) = value.to_str() {
            headers
                .entry(name.as_str().to_string())
                .or_insert_with(|| value.to_string());
        }
    }

    let body = match axum::body::to_bytes(request.into_body(), BODY_LIMIT).await {
        Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
        Err(_) => return json_error(413, "request body too large"),
    };

    metrics::record_pipeline_request(&method);

    // Handlers and the engine are synchronous; keep them off the runtime.
    let task = tokio::task::spawn_blocking(move || {
        run_pipeline(state, method, path, headers, body, remote_addr)
    });
    match task.await {
        Ok(response) => response,
        Err(err) => {
            error!(error = ?err, "envelope pipeline task failed");
            json_error(500, "internal server error")
        }
    }
}

fn run_pipeline(
    state: AppState,
    method: String,
    path: String,
    headers: BTreeMap<String, String>,
    raw_body: String,
    remote_addr: String,
) -> HttpResponse {
    let node = &state.node;
    let request_id = generate_request_id();
    let request = Request {
        method: method.clone(),
        path: path.clone(),
        headers,
        body: compact_json_body(&raw_body),
        remote_addr,
        request_id: request_id.clone(),
        timestamp: Utc::now(),
    };

    // No handler means no replica could replay this request either; answer
    // directly instead of broadcasting an envelope every replica would
    // reject.
    let Some(response) = node.registry().execute(&request) else {
        return json_error(404, &format!("Service not found for {method} {path}"));
    };

    let transaction = Transaction::new(request, response.clone(), node.node_id());
    let raw_tx = match transaction.canonical_bytes() {
        Ok(bytes) => bytes,
        Err(err) => {
            error!(error = %err, "failed to serialize envelope");
            return json_error(500, "failed to serialize envelope");
        }
    };

    let started = Instant::now();
    let receipt = match node.engine().broadcast_tx_commit(raw_tx) {
        Ok(receipt) => receipt,
        Err(EngineError::NoQuorum { .. }) => {
            // The local store is not rolled back: the engine may still
            // commit the envelope after this deadline.
            metrics::record_consensus_timeout();
            return json_response(
                500,
                json!({
                    "error": "consensus did not confirm the transaction in time",
                    "code": "CONSENSUS_TIMEOUT",
                })
                .to_string(),
            );
        }
    };

    if receipt.check_code == CODE_MEMPOOL_FULL {
        return json_error(503, "mempool full, try again later");
    }
    if receipt.check_code != CODE_OK {
        return json_error(500, "transaction rejected at admission");
    }
    metrics::record_commit(started.elapsed().as_secs_f64(), receipt.height);

    let block_txs = node
        .engine()
        .block(receipt.height)
        .map(|block| BlockTxsDetail::from_block(&block))
        .unwrap_or_default();

    let client_response = ClientResponse {
        body: response.parse_body(),
        meta: TransactionStatus {
            tx_id: receipt.tx_hash.clone(),
            request_id,
            status: "confirmed".to_string(),
            block_height: receipt.height,
            block_hash: None,
            confirm_time: Utc::now(),
            response_info: ResponseInfo::from_response(&response),
            block_txs,
        },
        blockchain_ref: receipt.tx_hash,
        node_id: node.node_id().to_string(),
    };

    match serde_json::to_string(&client_response) {
        Ok(body) => json_response(response.status_code, body),
        Err(err) => {
            error!(error = %err, "failed to encode client response");
            json_error(500, "failed to encode client response")
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Transaction and block views
// ═══════════════════════════════════════════════════════════════════════════

async fn transaction_status_handler(
    State(state): State<AppState>,
    Path(tx_hash): Path<String>,
) -> HttpResponse {
    let engine = state.node.engine();
    let matches = engine.tx_search(&TxQuery::Hash(tx_hash.clone()));
    let Some(found) = matches.first() else {
        return json_error(404, "Transaction not found");
    };

    let transaction: Transaction = match serde_json::from_slice(&found.tx) {
        Ok(tx) => tx,
        Err(err) => return json_error(500, &format!("error parsing transaction: {err}")),
    };

    let status = found
        .events
        .iter()
        .find(|event| event.kind == "app_tx")
        .and_then(|event| event.attribute("status"))
        .unwrap_or("pending")
        .to_string();

    let block_txs = engine
        .block(found.height)
        .map(|block| BlockTxsDetail::from_block(&block))
        .unwrap_or_default();

    let status = TransactionStatus {
        tx_id: tx_hash,
        request_id: transaction.request.request_id.clone(),
        status,
        block_height: found.height,
        block_hash: Some(found.tx_hash.clone()),
        confirm_time: Utc::now(),
        response_info: ResponseInfo::from_response(&transaction.response),
        block_txs,
    };
    json_response(200, serde_json::to_string(&status).unwrap_or_default())
}

async fn block_handler(State(state): State<AppState>, Path(height): Path<u64>) -> HttpResponse {
    let Some(block) = state.node.engine().block(height) else {
        return json_error(404, "Block not found");
    };
    let listing = BlockTxsDetail::from_block(&block);
    json_response(
        200,
        json!({
            "height": block.height,
            "proposer": block.proposer,
            "committed_at": block.committed_at,
            "app_hash": hex::encode(&block.app_hash),
            "accept_votes": block.accept_votes,
            "block_txs": listing,
        })
        .to_string(),
    )
}

// ═══════════════════════════════════════════════════════════════════════════
// Telemetry surfaces
// ═══════════════════════════════════════════════════════════════════════════

async fn root_handler(State(state): State<AppState>) -> Html<String> {
    let node = &state.node;
    let status = node.engine().status();
    Html(format!(
        "<h1>Tandem Node</h1>\
         <p>Node ID: {}</p>\
         <p>Layer: {}</p>\
         <p>Replica set: {} nodes</p>\
         <p>Latest block height: {}</p>",
        node.node_id(),
        node.layer().as_str(),
        status.replica_count,
        status.latest_block_height,
    ))
}

async fn health_handler() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

async fn metrics_handler() -> HttpResponse {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    if let Err(err) = encoder.encode(&metric_families, &mut buffer) {
        error!(error = ?err, "failed to encode metrics");
        return json_error(500, "failed to encode metrics");
    }
    (
        [(header::CONTENT_TYPE, encoder.format_type().to_string())],
        buffer,
    )
        .into_response()
}

async fn debug_handler(State(state): State<AppState>) -> impl IntoResponse {
    let node = &state.node;
    let status = node.engine().status();
    let info = node.engine().abci_info();

    Json(json!({
        "node_id": node.node_id(),
        "layer": node.layer().as_str(),
        "node_status": "online",
        "uptime_secs": node.uptime_secs(),
        "replica_count": status.replica_count,
        "num_peers": status.replica_count.saturating_sub(1),
        "latest_block_height": status.latest_block_height,
        "latest_block_time": status.latest_block_time,
        "catching_up": status.catching_up,
        "last_block_height": info.last_block_height,
        "last_block_app_hash": info.last_block_app_hash.map(hex::encode),
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_ids_are_sixteen_random_bytes() {
        let a = generate_request_id();
        let b = generate_request_id();
        assert_eq!(a.len(), 32);
        assert_ne!(a, b);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }
}

//! RPC HTTP Server
//!
//! Axum-based HTTP server that answers JSON-RPC requests on `/`.

use axum::{extract::State, http::StatusCode, routing::post, Json, Router};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::watch;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use crate::rpc::methods::{handle_request, JsonRpcRequest, JsonRpcResponse, RpcState};

pub fn rpc_router(state: Arc<RpcState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/", post(handle_rpc))
        .layer(cors)
        .with_state(state)
}

/// Serve RPC on `port` until `shutdown` flips to true
pub async fn start_rpc_server(
    state: Arc<RpcState>,
    port: u16,
    mut shutdown: watch::Receiver<bool>,
) -> std::io::Result<()> {
    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("RPC server listening on http://{}", addr);

    axum::serve(listener, rpc_router(state))
        .with_graceful_shutdown(async move {
            while !*shutdown.borrow() {
                if shutdown.changed().await.is_err() {
                    break;
                }
            }
        })
        .await
}

async fn handle_rpc(
    State(state): State<Arc<RpcState>>,
    Json(request): Json<JsonRpcRequest>,
) -> (StatusCode, Json<JsonRpcResponse>) {
    let response = handle_request(&state, request);
    (StatusCode::OK, Json(response))
}

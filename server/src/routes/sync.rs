//! Sync endpoint routes.

use axum::{
    extract::{
        ws::{WebSocket, WebSocketUpgrade},
        State,
    },
    http::HeaderMap,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};

use crate::auth::AuthUser;
use crate::error::Result;
use crate::handlers::{handle_pull, handle_push, handle_websocket_connection};
use crate::AppState;
use carry_engine::{PullMessage, PullResponse, PushMessage, PushResponse, RlsContext};

/// Create sync routes.
pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/sync/push", post(push_handler))
        .route("/sync/pull", post(pull_handler))
        .route("/sync/ws", get(websocket_handler))
}

/// POST /sync/push - Push collection changes to server.
async fn push_handler(
    State(state): State<AppState>,
    auth: AuthUser,
    Json(request): Json<PushMessage>,
) -> Result<Json<PushResponse>> {
    let ctx = rls_context_for(&auth);
    let response = handle_push(&state.adapter, &state.policies, &ctx, request).await?;
    Ok(Json(response))
}

/// POST /sync/pull - Pull collection changes since a checkpoint.
///
/// The checkpoint is passed as the JSON request body, mirroring the push
/// endpoint's shape rather than flattening it into query parameters.
async fn pull_handler(
    State(state): State<AppState>,
    auth: AuthUser,
    Json(request): Json<PullMessage>,
) -> Result<Json<PullResponse>> {
    let ctx = rls_context_for(&auth);
    let response = handle_pull(&state.adapter, &state.policies, &ctx, request).await?;
    Ok(Json(response))
}

/// Builds the RLS evaluation context for an authenticated request. `AuthUser`
/// currently carries only a bearer token, so it becomes the `user_id`;
/// tenant/role-scoped policies need a richer `AuthUser` before they can match.
fn rls_context_for(auth: &AuthUser) -> RlsContext {
    RlsContext {
        user_id: Some(auth.token.clone()),
        ..Default::default()
    }
}

/// GET /sync/ws - WebSocket endpoint for real-time sync.
///
/// Clients should connect with:
/// - `Authorization: Bearer <token>` header (if auth is required)
/// - `X-Node-Id: <node_id>` header to identify the client
async fn websocket_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let node_id = headers
        .get("x-node-id")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
        .unwrap_or_else(|| format!("anon-{}", state.config.node_id));

    if let Some(ref _secret) = state.config.auth_secret {
        let auth_header = headers.get("authorization").and_then(|v| v.to_str().ok());
        match auth_header {
            Some(header) if header.starts_with("Bearer ") => {
                let token = header.trim_start_matches("Bearer ");
                if token.is_empty() {
                    tracing::warn!("WebSocket connection rejected: empty bearer token");
                    return ws.on_upgrade(|_socket| async {});
                }
            }
            Some(_) => {
                tracing::warn!("WebSocket connection rejected: invalid auth header format");
                return ws.on_upgrade(|_socket| async {});
            }
            None => {
                tracing::warn!("WebSocket connection rejected: missing auth header");
                return ws.on_upgrade(|_socket| async {});
            }
        }
    }

    let adapter = state.adapter.clone();
    let conn_manager = state.conn_manager.clone();
    let policies = state.policies.clone();
    let ctx = RlsContext {
        user_id: Some(node_id.clone()),
        ..Default::default()
    };

    tracing::info!(node_id = %node_id, "WebSocket upgrade requested");

    ws.on_upgrade(move |socket: WebSocket| handle_websocket_connection(socket, adapter, conn_manager, policies, ctx, node_id))
}

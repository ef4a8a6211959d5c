//! WebSocket handler for real-time sync.
//!
//! Handles WebSocket connections and dispatches messages to the same
//! push/pull handlers used by the HTTP routes, plus broadcasts accepted
//! changes to other connected clients.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;

use crate::db::PostgresAdapter;
use crate::websocket::{ClientMessage, ConnectionManager, ServerMessage};
use carry_engine::{PolicyGuard, RlsContext};

use super::{handle_pull, handle_push};

/// Handle an established WebSocket connection.
///
/// This function:
/// 1. Registers the connection with the manager
/// 2. Spawns a task to forward outgoing messages
/// 3. Processes incoming messages in a loop
/// 4. Cleans up on disconnect
pub async fn handle_websocket_connection(
    socket: WebSocket,
    adapter: Arc<PostgresAdapter>,
    conn_manager: Arc<ConnectionManager>,
    policies: Arc<PolicyGuard>,
    ctx: RlsContext,
    node_id: String,
) {
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<ServerMessage>();
    let conn_id = conn_manager.register(node_id.clone(), tx);

    tracing::info!(conn_id = %conn_id, node_id = %node_id, "WebSocket client connected");

    let send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            match serde_json::to_string(&msg) {
                Ok(text) => {
                    if let Err(e) = ws_sender.send(Message::Text(text.into())).await {
                        tracing::warn!("Failed to send WebSocket message: {}", e);
                        break;
                    }
                }
                Err(e) => {
                    tracing::error!("Failed to serialize WebSocket message: {}", e);
                }
            }
        }
    });

    while let Some(result) = ws_receiver.next().await {
        match result {
            Ok(Message::Text(text)) => {
                let response = process_message(&text, &adapter, &policies, &ctx, &conn_manager, &conn_id).await;
                conn_manager.send_to_internal(&conn_id, response);
            }
            Ok(Message::Binary(_)) => {
                tracing::warn!("Binary messages not supported");
            }
            Ok(Message::Ping(data)) => {
                tracing::trace!("Received ping: {} bytes", data.len());
            }
            Ok(Message::Pong(_)) => {
                tracing::trace!("Received pong");
            }
            Ok(Message::Close(_)) => {
                tracing::info!(conn_id = %conn_id, "WebSocket close frame received");
                break;
            }
            Err(e) => {
                tracing::warn!(conn_id = %conn_id, "WebSocket error: {}", e);
                break;
            }
        }
    }

    conn_manager.unregister(&conn_id);
    send_task.abort();

    tracing::info!(
        conn_id = %conn_id,
        node_id = %node_id,
        active_connections = conn_manager.connection_count(),
        "WebSocket client disconnected"
    );
}

/// Process a client message and return a server response.
async fn process_message(
    text: &str,
    adapter: &PostgresAdapter,
    policies: &PolicyGuard,
    ctx: &RlsContext,
    conn_manager: &ConnectionManager,
    conn_id: &str,
) -> ServerMessage {
    let client_msg: ClientMessage = match serde_json::from_str(text) {
        Ok(msg) => msg,
        Err(e) => return ServerMessage::error(format!("invalid message format: {e}"), None),
    };

    match client_msg {
        ClientMessage::Pull { checkpoint, id } => {
            let msg = carry_engine::PullMessage { id, checkpoint };
            match handle_pull(adapter, policies, ctx, msg).await {
                Ok(response) => ServerMessage::PullResponse(response),
                Err(e) => ServerMessage::error(e.to_string(), None),
            }
        }

        ClientMessage::Push {
            collection_changes,
            from_checkpoint,
            id,
        } => {
            let msg = carry_engine::PushMessage {
                id,
                collection_changes: collection_changes.clone(),
                from_checkpoint,
            };
            match handle_push(adapter, policies, ctx, msg).await {
                Ok(response) => {
                    if response.success && !collection_changes.is_empty() {
                        let broadcast_msg = ServerMessage::OpsAvailable {
                            collection_changes,
                            checkpoint: response.checkpoint.clone(),
                        };
                        let sent = conn_manager.broadcast_except(conn_id, broadcast_msg);
                        tracing::debug!(sent_to = sent, "broadcast accepted changes to connected clients");
                    }
                    ServerMessage::PushResponse(response)
                }
                Err(e) => ServerMessage::error(e.to_string(), None),
            }
        }

        ClientMessage::Ping => ServerMessage::Pong,
    }
}

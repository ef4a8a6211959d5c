//! WebSocket message envelope: wraps the engine's push/pull replication
//! messages for transport over a socket alongside a keep-alive ping.

use carry_engine::{Checkpoint, PullResponse, PushResponse};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Messages sent from client to server.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Pull { checkpoint: Checkpoint, id: String },
    Push {
        collection_changes: HashMap<String, Vec<carry_engine::ChangeEvent>>,
        from_checkpoint: Checkpoint,
        id: String,
    },
    Ping,
}

/// Messages sent from server to client.
#[derive(Debug, Clone, Serialize)]
#[allow(clippy::large_enum_variant)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    PullResponse(PullResponse),
    PushResponse(PushResponse),
    /// Push notification when another client's changes have been accepted.
    /// Sent to all connected clients except the one that pushed.
    OpsAvailable {
        collection_changes: HashMap<String, Vec<carry_engine::ChangeEvent>>,
        checkpoint: Checkpoint,
    },
    Pong,
    Error { message: String, request_id: Option<String> },
}

impl ServerMessage {
    pub fn error(message: impl Into<String>, request_id: Option<String>) -> Self {
        ServerMessage::Error {
            message: message.into(),
            request_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ping_deserializes() {
        let msg: ClientMessage = serde_json::from_str(r#"{"type": "ping"}"#).unwrap();
        assert!(matches!(msg, ClientMessage::Ping));
    }

    #[test]
    fn pong_serializes() {
        let json = serde_json::to_string(&ServerMessage::Pong).unwrap();
        assert_eq!(json, r#"{"type":"pong"}"#);
    }

    #[test]
    fn error_carries_request_id() {
        let msg = ServerMessage::error("bad request", Some("req-1".to_string()));
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains(r#""message":"bad request""#));
        assert!(json.contains(r#""request_id":"req-1""#));
    }
}

//! Unit tests for the WebSocket wire protocol shape.
//!
//! The server binary has no library target, so these mirror
//! `crate::websocket::protocol::{ClientMessage, ServerMessage}` field-for-field
//! rather than importing them; any drift here should be caught by keeping
//! this in sync with `server/src/websocket/protocol.rs`.

use carry_engine::replication::{Checkpoint, PullResponse, PushResponse};
use carry_engine::ChangeEvent;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
#[allow(dead_code)]
enum ClientMessage {
    Pull {
        checkpoint: Checkpoint,
        id: String,
    },
    Push {
        collection_changes: HashMap<String, Vec<ChangeEvent>>,
        from_checkpoint: Checkpoint,
        id: String,
    },
    Ping,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
#[allow(dead_code, clippy::large_enum_variant)]
enum ServerMessage {
    PullResponse(PullResponse),
    PushResponse(PushResponse),
    OpsAvailable {
        collection_changes: HashMap<String, Vec<ChangeEvent>>,
        checkpoint: Checkpoint,
    },
    Pong,
    Error {
        message: String,
        request_id: Option<String>,
    },
}

#[test]
fn client_message_pull_deserializes() {
    let json = r#"{
        "type": "pull",
        "id": "req-001",
        "checkpoint": {"id": "cp-1", "nodeId": "device-1", "ts": 0, "perCollectionSequences": {}}
    }"#;

    let msg: ClientMessage = serde_json::from_str(json).unwrap();
    match msg {
        ClientMessage::Pull { checkpoint, id } => {
            assert_eq!(id, "req-001");
            assert_eq!(checkpoint.node_id, "device-1");
        }
        _ => panic!("expected Pull message"),
    }
}

#[test]
fn client_message_push_deserializes() {
    let json = r#"{
        "type": "push",
        "id": "req-002",
        "collectionChanges": {},
        "fromCheckpoint": {"id": "cp-1", "nodeId": "device-1", "ts": 0, "perCollectionSequences": {}}
    }"#;

    let msg: ClientMessage = serde_json::from_str(json).unwrap();
    assert!(matches!(msg, ClientMessage::Push { id, .. } if id == "req-002"));
}

#[test]
fn client_message_ping_deserializes() {
    let msg: ClientMessage = serde_json::from_str(r#"{"type": "ping"}"#).unwrap();
    assert!(matches!(msg, ClientMessage::Ping));
}

#[test]
fn server_message_pong_serializes() {
    let json = serde_json::to_string(&ServerMessage::Pong).unwrap();
    assert_eq!(json, r#"{"type":"pong"}"#);
}

#[test]
fn server_message_error_carries_request_id() {
    let msg = ServerMessage::Error {
        message: "invalid message format".to_string(),
        request_id: Some("req-003".to_string()),
    };
    let json = serde_json::to_string(&msg).unwrap();

    assert!(json.contains(r#""type":"error""#));
    assert!(json.contains(r#""message":"invalid message format""#));
    assert!(json.contains(r#""request_id":"req-003""#));
}

#[test]
fn server_message_push_response_reports_success() {
    let msg = ServerMessage::PushResponse(PushResponse {
        id: "req-004".to_string(),
        success: true,
        conflicts: Vec::new(),
        checkpoint: Checkpoint::new("cp-1", "server", 0),
    });

    let json = serde_json::to_string(&msg).unwrap();
    assert!(json.contains(r#""type":"push_response""#));
    assert!(json.contains(r#""success":true"#));
}

#[test]
fn server_message_ops_available_carries_collection_changes() {
    let msg = ServerMessage::OpsAvailable {
        collection_changes: HashMap::new(),
        checkpoint: Checkpoint::new("cp-1", "server", 0),
    };

    let json = serde_json::to_string(&msg).unwrap();
    assert!(json.contains(r#""type":"ops_available""#));
}

//! Integration tests for the sync protocol's wire types and conflict
//! detection. These exercise `carry_engine::replication` directly; the
//! server binary has no library target to import handler internals from,
//! so HTTP-level coverage of `handle_push`/`handle_pull` against a live
//! PostgreSQL database lives outside this crate's test suite.

use carry_engine::replication::{detect_conflict, Checkpoint, PullMessage, PushMessage};
use carry_engine::{ChangeEvent, ChangeOp, Document, Value};
use std::collections::{BTreeMap, HashMap};

fn doc(id: &str, rev: &str, title: &str) -> Document {
    let mut fields = BTreeMap::new();
    fields.insert("title".to_string(), Value::String(title.to_string()));
    let mut d = Document::new(id, fields);
    d.rev = rev.to_string();
    d
}

fn insert_event(collection: &str, document: Document, seq: u64) -> ChangeEvent {
    ChangeEvent {
        op: ChangeOp::Insert,
        collection: collection.to_string(),
        doc_id: document.id.clone(),
        document: Some(document),
        previous_document: None,
        from_sync: false,
        timestamp: 1_706_745_600_000,
        seq,
    }
}

#[test]
fn push_message_round_trips_through_json() {
    let mut changes = HashMap::new();
    changes.insert(
        "todos".to_string(),
        vec![insert_event("todos", doc("todo-1", "1-aaaa0000", "Buy milk"), 1)],
    );

    let msg = PushMessage {
        id: "req-1".to_string(),
        collection_changes: changes,
        from_checkpoint: Checkpoint::new("cp-1", "device-1", 0),
    };

    let json = serde_json::to_string(&msg).unwrap();
    let parsed: PushMessage = serde_json::from_str(&json).unwrap();

    assert_eq!(parsed.id, "req-1");
    assert_eq!(parsed.collection_changes["todos"].len(), 1);
    assert_eq!(parsed.collection_changes["todos"][0].doc_id, "todo-1");
}

#[test]
fn pull_message_carries_per_collection_checkpoint() {
    let mut checkpoint = Checkpoint::new("cp-2", "device-1", 0);
    checkpoint.advance("todos", 7);
    checkpoint.advance("notes", 3);

    let msg = PullMessage {
        id: "req-2".to_string(),
        checkpoint,
    };

    let json = serde_json::to_string(&msg).unwrap();
    assert!(json.contains(r#""perCollectionSequences":{"#));

    let parsed: PullMessage = serde_json::from_str(&json).unwrap();
    assert_eq!(parsed.checkpoint.sequence_for("todos"), 7);
    assert_eq!(parsed.checkpoint.sequence_for("notes"), 3);
    assert_eq!(parsed.checkpoint.sequence_for("unseen"), 0);
}

#[test]
fn detect_conflict_flags_predecessor_mismatch() {
    assert!(detect_conflict("1-aaaa0000", "2-bbbb0000", "doc-1").is_some());
    assert!(detect_conflict("2-bbbb0000", "2-bbbb0000", "doc-1").is_none());
}

#[test]
fn checkpoint_advance_never_regresses() {
    let mut cp = Checkpoint::new("cp-3", "device-1", 0);
    cp.advance("todos", 10);
    cp.advance("todos", 4);
    assert_eq!(cp.sequence_for("todos"), 10);
}

/// A bare JSON number must round-trip back through a `Timestamp` field as
/// `Value::Timestamp`, not `Value::Number` — the two wire identically
/// (`Document::to_json`/`from_json` is what tells them apart by field name),
/// so this only exercises the document-level wire format used inside a
/// `ChangeEvent`, not `Value`'s own untagged derive.
#[test]
fn push_message_round_trips_timestamp_field() {
    let mut fields = BTreeMap::new();
    fields.insert("title".to_string(), Value::String("Buy milk".to_string()));
    fields.insert("dueAt".to_string(), Value::Timestamp(1_706_745_600_000));
    let mut document = Document::new("todo-2", fields);
    document.rev = "1-aaaa0000".to_string();

    let mut changes = HashMap::new();
    changes.insert("todos".to_string(), vec![insert_event("todos", document, 2)]);

    let msg = PushMessage {
        id: "req-5".to_string(),
        collection_changes: changes,
        from_checkpoint: Checkpoint::new("cp-5", "device-1", 0),
    };

    let json = serde_json::to_string(&msg).unwrap();
    let parsed: PushMessage = serde_json::from_str(&json).unwrap();

    let roundtripped = parsed.collection_changes["todos"][0].document.as_ref().unwrap();
    assert_eq!(roundtripped.get("dueAt"), Some(&Value::Timestamp(1_706_745_600_000)));
}

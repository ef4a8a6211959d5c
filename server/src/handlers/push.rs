//! Push handler: applies a client's collection changes to the persistent
//! store, detecting conflicts by predecessor-revision mismatch.

use crate::db::{checkpoint, PostgresAdapter};
use crate::error::Result;
use carry_engine::replication::{detect_conflict, ConflictInfo};
use carry_engine::storage::StorageAdapter;
use carry_engine::{
    Checkpoint, ChangeOp, Collection, CollectionSchema, PolicyGuard, PushMessage, PushResponse, RlsAction,
    RlsContext, RlsEffect,
};
use sqlx::PgPool;

/// Process a push request from a client.
pub async fn handle_push(
    adapter: &PostgresAdapter,
    policies: &PolicyGuard,
    ctx: &RlsContext,
    request: PushMessage,
) -> Result<PushResponse> {
    let pool = adapter.pool();
    let mut checkpoint_state = merged_with_persisted(pool, request.from_checkpoint.clone()).await?;
    let mut conflicts = Vec::new();

    for (collection_name, events) in request.collection_changes {
        let store = adapter.get_store(&collection_name).await?;
        let schema = CollectionSchema::new(collection_name.clone(), vec![]);
        let collection = Collection::new(collection_name.clone(), schema, store);

        for event in events {
            let Some(incoming_doc) = event.document.clone() else {
                continue;
            };
            let incoming_id = incoming_doc.id.clone();
            let action = match event.op {
                ChangeOp::Insert => RlsAction::Insert,
                ChangeOp::Update => RlsAction::Update,
                ChangeOp::Delete => RlsAction::Delete,
            };
            if policies.authorize(action, &collection_name, &incoming_doc, ctx) == RlsEffect::Deny {
                // Reuses the conflict channel to surface the rejection to the
                // client rather than silently dropping the write; a denied
                // write is never applied or counted toward the checkpoint.
                conflicts.push(ConflictInfo {
                    doc_id: incoming_id,
                    server_rev: "denied-by-policy".to_string(),
                    local_rev: incoming_doc.rev.clone(),
                });
                continue;
            }

            let predecessor_rev = event.previous_document.as_ref().map(|d| d.rev.clone()).unwrap_or_default();

            let existing = collection.get(&incoming_id).await?;
            let stored_rev = existing.as_ref().map(|d| d.rev.clone()).unwrap_or_default();

            if let Some(conflict) = detect_conflict(&predecessor_rev, &stored_rev, &incoming_id) {
                conflicts.push(conflict);
                continue;
            }

            collection.apply_remote_change(event).await?;
            if let Some(committed) = collection.get(&incoming_id).await? {
                checkpoint_state.advance(&collection_name, store_seq_hint(&committed));
            }
        }
    }

    let mut to_persist: carry_engine::PersistedCheckpoint = checkpoint_state.clone().into();
    to_persist.id = format!("node-{}", to_persist.node_id);
    checkpoint::save_checkpoint(pool, &to_persist).await?;

    Ok(PushResponse {
        id: request.id,
        success: conflicts.is_empty(),
        conflicts,
        checkpoint: checkpoint_state,
    })
}

/// Loads this node's persisted checkpoint (if any) and folds it into the
/// checkpoint the client sent, so a client that reconnects with a stale
/// `from_checkpoint` never regresses the server's record of its progress.
async fn merged_with_persisted(pool: &PgPool, mut from_checkpoint: Checkpoint) -> Result<Checkpoint> {
    if let Some(persisted) = checkpoint::load_checkpoint(pool, &from_checkpoint.node_id).await? {
        for (collection, seq) in persisted.sequences {
            from_checkpoint.advance(&collection, seq);
        }
    }
    Ok(from_checkpoint)
}

/// Best-effort sequence hint from a committed document: the revision
/// counter, which is monotonic per document but not globally ordered the
/// way `ChangeEvent::seq` is. Real advancement happens in `handle_pull`,
/// which reads the authoritative `seq` from the change log; this merely
/// keeps the push response's checkpoint from regressing.
fn store_seq_hint(doc: &carry_engine::Document) -> u64 {
    doc.rev.split('-').next().and_then(|c| c.parse().ok()).unwrap_or(0)
}

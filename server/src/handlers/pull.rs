//! Pull handler: serves change-feed events to a client since its checkpoint.

use crate::db::{checkpoint, PostgresAdapter};
use crate::error::Result;
use carry_engine::storage::StorageAdapter;
use carry_engine::{PolicyGuard, PullMessage, PullResponse, RlsContext};
use sqlx::PgPool;
use std::collections::HashMap;

/// Maximum change events returned per collection in a single pull.
const MAX_PER_COLLECTION: usize = 500;

/// Process a pull request from a client.
pub async fn handle_pull(
    adapter: &PostgresAdapter,
    policies: &PolicyGuard,
    ctx: &RlsContext,
    request: PullMessage,
) -> Result<PullResponse> {
    let pool = adapter.pool();
    let mut checkpoint_state = merged_with_persisted(pool, request.checkpoint.clone()).await?;
    let mut changes = HashMap::new();
    let mut has_more = false;

    for collection_name in adapter.list_stores().await? {
        let store = adapter.get_store(&collection_name).await?;
        let since = checkpoint_state.sequence_for(&collection_name);
        let mut available = store.changes_since(since).await?;

        available.retain(|event| {
            let visible_doc = event.document.as_ref().or(event.previous_document.as_ref());
            match visible_doc {
                Some(doc) => policies.allows_read(&collection_name, doc, ctx),
                None => true,
            }
        });

        if available.len() > MAX_PER_COLLECTION {
            has_more = true;
            available.truncate(MAX_PER_COLLECTION);
        }

        if let Some(last) = available.last() {
            checkpoint_state.advance(&collection_name, last.seq);
        }
        if !available.is_empty() {
            changes.insert(collection_name, available);
        }
    }

    let mut to_persist: carry_engine::PersistedCheckpoint = checkpoint_state.clone().into();
    to_persist.id = format!("node-{}", to_persist.node_id);
    checkpoint::save_checkpoint(pool, &to_persist).await?;

    Ok(PullResponse {
        id: request.id,
        changes,
        checkpoint: checkpoint_state,
        has_more,
    })
}

/// Loads this node's persisted checkpoint (if any) and folds it into the
/// checkpoint the client sent, mirroring `handle_push`'s merge so a client
/// resuming from a stale checkpoint never re-walks already-acked changes.
async fn merged_with_persisted(pool: &PgPool, mut checkpoint: carry_engine::Checkpoint) -> Result<carry_engine::Checkpoint> {
    if let Some(persisted) = checkpoint::load_checkpoint(pool, &checkpoint.node_id).await? {
        for (collection, seq) in persisted.sequences {
            checkpoint.advance(&collection, seq);
        }
    }
    Ok(checkpoint)
}

//! The replication protocol: push/pull messages, checkpoints, conflict
//! resolution, and the client-side sync scheduler.

use crate::clock::LogicalClock;
use crate::document::{ChangeEvent, Document};
use crate::value::Value;
use crate::{document, CollectionName, Error, NodeId, Result, Seq};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::Duration;

/// The wire checkpoint shape used inside push/pull protocol messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Checkpoint {
    pub id: String,
    pub node_id: NodeId,
    pub ts: i64,
    pub per_collection_sequences: HashMap<CollectionName, Seq>,
}

impl Checkpoint {
    pub fn new(id: impl Into<String>, node_id: impl Into<NodeId>, ts: i64) -> Self {
        Self {
            id: id.into(),
            node_id: node_id.into(),
            ts,
            per_collection_sequences: HashMap::new(),
        }
    }

    pub fn sequence_for(&self, collection: &str) -> Seq {
        self.per_collection_sequences.get(collection).copied().unwrap_or(0)
    }

    pub fn advance(&mut self, collection: &str, seq: Seq) {
        let entry = self.per_collection_sequences.entry(collection.to_string()).or_insert(0);
        if seq > *entry {
            *entry = seq;
        }
    }
}

/// The on-disk checkpoint layout: `{id, node_id, ts, sequences}`. Distinct
/// field name (`sequences` vs. the wire's `per_collection_sequences`)
/// because the persisted layout and the protocol payload are separate
/// contracts that happen to carry the same data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedCheckpoint {
    pub id: String,
    pub node_id: NodeId,
    pub ts: i64,
    pub sequences: HashMap<CollectionName, Seq>,
}

impl From<Checkpoint> for PersistedCheckpoint {
    fn from(c: Checkpoint) -> Self {
        Self {
            id: c.id,
            node_id: c.node_id,
            ts: c.ts,
            sequences: c.per_collection_sequences,
        }
    }
}

impl From<PersistedCheckpoint> for Checkpoint {
    fn from(p: PersistedCheckpoint) -> Self {
        Self {
            id: p.id,
            node_id: p.node_id,
            ts: p.ts,
            per_collection_sequences: p.sequences,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictInfo {
    pub doc_id: String,
    pub server_rev: String,
    pub local_rev: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushMessage {
    pub id: String,
    pub collection_changes: HashMap<CollectionName, Vec<ChangeEvent>>,
    pub from_checkpoint: Checkpoint,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushResponse {
    pub id: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conflicts: Vec<ConflictInfo>,
    pub checkpoint: Checkpoint,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PullMessage {
    pub id: String,
    pub checkpoint: Checkpoint,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PullResponse {
    pub id: String,
    pub changes: HashMap<CollectionName, Vec<ChangeEvent>>,
    pub checkpoint: Checkpoint,
    pub has_more: bool,
}

/// The server-side conflict check on push: compares each incoming change's
/// predecessor revision (the revision the client believed it was editing)
/// against the revision currently stored. A mismatch is a conflict.
pub fn detect_conflict(
    predecessor_rev: &str,
    stored_rev: &str,
    doc_id: &str,
) -> Option<ConflictInfo> {
    if predecessor_rev != stored_rev {
        Some(ConflictInfo {
            doc_id: doc_id.to_string(),
            server_rev: stored_rev.to_string(),
            local_rev: predecessor_rev.to_string(),
        })
    } else {
        None
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConflictStrategy {
    ServerWins,
    ClientWins,
    LastWriteWins,
    Merge,
}

/// Resolves a conflicting local/server document pair per `strategy`,
/// returning the document that should become the new local state. The
/// caller is responsible for re-pushing under `ClientWins`.
pub fn resolve_conflict(
    strategy: ConflictStrategy,
    local: &Document,
    server: &Document,
    local_node_id: &str,
    server_node_id: &str,
) -> Document {
    match strategy {
        ConflictStrategy::ServerWins => server.clone(),
        ConflictStrategy::ClientWins => {
            let counter = server
                .rev
                .split('-')
                .next()
                .and_then(|c| c.parse::<u64>().ok())
                .unwrap_or(0);
            let mut repushed = local.clone();
            repushed.rev = document::new_revision(counter, &repushed.fields);
            repushed
        }
        ConflictStrategy::LastWriteWins => match local.updated_at.cmp(&server.updated_at) {
            Ordering::Greater => local.clone(),
            Ordering::Less => server.clone(),
            Ordering::Equal => {
                if local_node_id >= server_node_id {
                    local.clone()
                } else {
                    server.clone()
                }
            }
        },
        ConflictStrategy::Merge => merge_documents(local, server),
    }
}

/// Deep field-wise merge: scalar collisions resolved by later `updated_at`;
/// arrays are concatenated with de-duplication by element deep-equality.
fn merge_documents(local: &Document, server: &Document) -> Document {
    let (newer, older) = if local.updated_at >= server.updated_at {
        (local, server)
    } else {
        (server, local)
    };

    let mut fields = older.fields.clone();
    for (key, newer_value) in &newer.fields {
        match (fields.get(key), newer_value) {
            (Some(Value::Array(existing)), Value::Array(incoming)) => {
                let mut merged = existing.clone();
                for item in incoming {
                    if !merged.iter().any(|m| m.deep_eq(item)) {
                        merged.push(item.clone());
                    }
                }
                fields.insert(key.clone(), Value::Array(merged));
            }
            _ => {
                fields.insert(key.clone(), newer_value.clone());
            }
        }
    }

    let mut merged_doc = newer.clone();
    merged_doc.fields = fields;
    merged_doc
}

/// Exponential backoff: initial 1s, cap 30s, factor 2.
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    initial: Duration,
    cap: Duration,
    factor: f64,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(1),
            cap: Duration::from_secs(30),
            factor: 2.0,
        }
    }
}

impl Backoff {
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let millis = self.initial.as_millis() as f64 * self.factor.powi(attempt as i32);
        let capped = millis.min(self.cap.as_millis() as f64);
        Duration::from_millis(capped as u64)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SyncStatus {
    Idle,
    Syncing,
    Offline,
    Error(String),
}

/// Pluggable sync transport: the engine core never opens sockets directly.
#[async_trait]
pub trait SyncTransport: Send + Sync {
    async fn push(&self, msg: PushMessage) -> Result<PushResponse>;
    async fn pull(&self, msg: PullMessage) -> Result<PullResponse>;
}

/// Drives the push/pull schedule for one engine instance: a single
/// background task, never parallel across collections. Concurrent
/// `force_sync` calls are coalesced.
pub struct Replicator<T: SyncTransport> {
    transport: Arc<T>,
    status: std::sync::Mutex<SyncStatus>,
    checkpoint: std::sync::Mutex<Checkpoint>,
    backoff: Backoff,
    attempt: AtomicU64,
    force_sync_in_flight: AtomicBool,
    request_clock: std::sync::Mutex<LogicalClock>,
}

impl<T: SyncTransport> Replicator<T> {
    pub fn new(transport: Arc<T>, checkpoint: Checkpoint) -> Self {
        let request_clock = LogicalClock::new(checkpoint.node_id.clone());
        Self {
            transport,
            status: std::sync::Mutex::new(SyncStatus::Idle),
            checkpoint: std::sync::Mutex::new(checkpoint),
            backoff: Backoff::default(),
            attempt: AtomicU64::new(0),
            force_sync_in_flight: AtomicBool::new(false),
            request_clock: std::sync::Mutex::new(request_clock),
        }
    }

    /// Ticks this replicator's request clock and formats a correlation id
    /// from it, so push/pull requests from the same node are totally
    /// ordered even when dispatched across concurrent `force_sync` calls.
    fn next_request_id(&self) -> String {
        let mut clock = self.request_clock.lock().unwrap();
        clock.tick();
        format!("req-{}-{}", clock.node_id, clock.counter)
    }

    pub fn status(&self) -> SyncStatus {
        self.status.lock().unwrap().clone()
    }

    fn set_status(&self, status: SyncStatus) {
        *self.status.lock().unwrap() = status;
    }

    pub fn checkpoint(&self) -> Checkpoint {
        self.checkpoint.lock().unwrap().clone()
    }

    /// Pushes one batch of outstanding local changes. On success resets the
    /// retry counter and advances the checkpoint; on transport failure
    /// transitions to `Offline` and returns the computed retry delay.
    pub async fn push(
        &self,
        changes: HashMap<CollectionName, Vec<ChangeEvent>>,
    ) -> std::result::Result<PushResponse, Duration> {
        self.set_status(SyncStatus::Syncing);
        let from_checkpoint = self.checkpoint();
        let msg = PushMessage {
            id: self.next_request_id(),
            collection_changes: changes,
            from_checkpoint,
        };

        match self.transport.push(msg).await {
            Ok(response) => {
                self.attempt.store(0, AtomicOrdering::SeqCst);
                *self.checkpoint.lock().unwrap() = response.checkpoint.clone();
                self.set_status(SyncStatus::Idle);
                Ok(response)
            }
            Err(e) => {
                self.set_status(SyncStatus::Offline);
                let attempt = self.attempt.fetch_add(1, AtomicOrdering::SeqCst) as u32;
                let _ = e;
                Err(self.backoff.delay_for_attempt(attempt))
            }
        }
    }

    /// Pulls until `has_more` is false, applying each batch via `apply`.
    pub async fn pull_until_caught_up(
        &self,
        mut apply: impl FnMut(HashMap<CollectionName, Vec<ChangeEvent>>) -> Result<()>,
    ) -> Result<()> {
        self.set_status(SyncStatus::Syncing);
        loop {
            let msg = PullMessage {
                id: self.next_request_id(),
                checkpoint: self.checkpoint(),
            };
            let response = match self.transport.pull(msg).await {
                Ok(r) => r,
                Err(e) => {
                    self.set_status(SyncStatus::Offline);
                    return Err(e);
                }
            };
            apply(response.changes)?;
            *self.checkpoint.lock().unwrap() = response.checkpoint.clone();
            if !response.has_more {
                break;
            }
        }
        self.set_status(SyncStatus::Idle);
        Ok(())
    }

    /// Coalesces concurrent `force_sync` calls: a second call while one is
    /// already in flight is a no-op.
    pub async fn force_sync(
        &self,
        changes: HashMap<CollectionName, Vec<ChangeEvent>>,
    ) -> Option<std::result::Result<PushResponse, Duration>> {
        if self
            .force_sync_in_flight
            .compare_exchange(false, true, AtomicOrdering::SeqCst, AtomicOrdering::SeqCst)
            .is_err()
        {
            return None;
        }
        let result = self.push(changes).await;
        self.force_sync_in_flight.store(false, AtomicOrdering::SeqCst);
        Some(result)
    }

    /// Cancels any in-flight operation's effect on status and resets it to
    /// idle; the caller is responsible for persisting the latest checkpoint.
    pub fn stop(&self) {
        self.set_status(SyncStatus::Idle);
    }
}

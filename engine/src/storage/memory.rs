//! Reference in-memory storage adapter, used by tests and as the default
//! backend for an embedded (non-persistent) engine instance.

use super::{DocumentStore, StorageAdapter, StorageStats, Transaction, TransactionMode};
use crate::document::{ChangeEvent, ChangeOp, Document};
use crate::index::{IndexDef, IndexManager};
use crate::{document, CollectionName, DocId, Error, Result, Seq};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};

#[derive(Clone)]
struct StoreState {
    documents: BTreeMap<DocId, Document>,
    change_log: Vec<ChangeEvent>,
    indexes: IndexManager,
    seq_counter: Seq,
}

impl StoreState {
    fn new() -> Self {
        Self {
            documents: BTreeMap::new(),
            change_log: Vec::new(),
            indexes: IndexManager::new(),
            seq_counter: 0,
        }
    }

    fn next_seq(&mut self) -> Seq {
        self.seq_counter += 1;
        self.seq_counter
    }
}

/// An in-memory [`DocumentStore`] for one collection.
pub struct MemoryStore {
    name: CollectionName,
    state: Mutex<StoreState>,
}

impl MemoryStore {
    fn new(name: CollectionName) -> Self {
        Self {
            name,
            state: Mutex::new(StoreState::new()),
        }
    }

    fn now_millis() -> i64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0)
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn get(&self, id: &DocId) -> Result<Option<Document>> {
        Ok(self.state.lock().await.documents.get(id).cloned())
    }

    async fn get_many(&self, ids: &[DocId]) -> Result<Vec<Document>> {
        let state = self.state.lock().await;
        Ok(ids.iter().filter_map(|id| state.documents.get(id).cloned()).collect())
    }

    async fn get_all(&self) -> Result<Vec<Document>> {
        Ok(self.state.lock().await.documents.values().cloned().collect())
    }

    async fn put(&self, mut doc: Document) -> Result<ChangeEvent> {
        let mut state = self.state.lock().await;

        let previous = state.documents.get(&doc.id).cloned();
        let prev_counter = previous
            .as_ref()
            .map(|p| p.rev.split('-').next().and_then(|c| c.parse::<u64>().ok()).unwrap_or(0))
            .unwrap_or(0);

        doc.rev = document::new_revision(prev_counter, &doc.fields);
        doc.updated_at = Self::now_millis();

        if let Some(prev) = &previous {
            if let Err(e) = state.indexes.on_update(prev, &doc) {
                return Err(e);
            }
        } else if let Err(e) = state.indexes.on_insert(&doc) {
            return Err(e);
        }

        let op = if previous.is_none() {
            ChangeOp::Insert
        } else {
            ChangeOp::Update
        };
        state.documents.insert(doc.id.clone(), doc.clone());

        let seq = state.next_seq();
        let event = ChangeEvent {
            op,
            collection: self.name.clone(),
            doc_id: doc.id.clone(),
            document: Some(doc),
            previous_document: previous,
            from_sync: false,
            timestamp: Self::now_millis(),
            seq,
        };
        state.change_log.push(event.clone());
        Ok(event)
    }

    async fn bulk_put(&self, docs: Vec<Document>) -> Result<Vec<ChangeEvent>> {
        let mut events = Vec::with_capacity(docs.len());
        for doc in docs {
            events.push(self.put(doc).await?);
        }
        Ok(events)
    }

    async fn delete(&self, id: &DocId) -> Result<ChangeEvent> {
        let mut state = self.state.lock().await;
        let previous = state
            .documents
            .get(id)
            .cloned()
            .ok_or_else(|| Error::NotFound {
                collection: self.name.clone(),
                id: id.clone(),
            })?;

        state.indexes.on_delete(&previous);

        let mut tombstone = previous.clone();
        tombstone.deleted = true;
        let prev_counter = previous
            .rev
            .split('-')
            .next()
            .and_then(|c| c.parse::<u64>().ok())
            .unwrap_or(0);
        tombstone.rev = document::new_revision(prev_counter, &tombstone.fields);
        tombstone.updated_at = Self::now_millis();
        state.documents.insert(id.clone(), tombstone.clone());

        let seq = state.next_seq();
        let event = ChangeEvent {
            op: ChangeOp::Delete,
            collection: self.name.clone(),
            doc_id: id.clone(),
            document: Some(tombstone),
            previous_document: Some(previous),
            from_sync: false,
            timestamp: Self::now_millis(),
            seq,
        };
        state.change_log.push(event.clone());
        Ok(event)
    }

    async fn bulk_delete(&self, ids: &[DocId]) -> Result<Vec<ChangeEvent>> {
        let mut events = Vec::with_capacity(ids.len());
        for id in ids {
            events.push(self.delete(id).await?);
        }
        Ok(events)
    }

    async fn create_index(&self, def: IndexDef) -> Result<()> {
        let mut state = self.state.lock().await;
        let docs: Vec<Document> = state.documents.values().cloned().collect();
        state.indexes.create_index(def, docs.iter())
    }

    async fn drop_index(&self, name: &str) -> Result<bool> {
        Ok(self.state.lock().await.indexes.drop_index(name))
    }

    async fn get_indexes(&self) -> Result<Vec<IndexDef>> {
        Ok(self.state.lock().await.indexes.list().into_iter().cloned().collect())
    }

    async fn changes_since(&self, after: Seq) -> Result<Vec<ChangeEvent>> {
        let state = self.state.lock().await;
        Ok(state
            .change_log
            .iter()
            .filter(|e| e.seq > after)
            .cloned()
            .collect())
    }

    async fn clear(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        *state = StoreState::new();
        Ok(())
    }

    async fn compact(&self, watermark: Seq) -> Result<usize> {
        let mut state = self.state.lock().await;
        let to_prune: Vec<DocId> = state
            .documents
            .iter()
            .filter(|(_, d)| d.deleted)
            .filter_map(|(id, _)| {
                state
                    .change_log
                    .iter()
                    .rev()
                    .find(|e| &e.doc_id == id)
                    .filter(|e| e.seq <= watermark)
                    .map(|_| id.clone())
            })
            .collect();
        for id in &to_prune {
            state.documents.remove(id);
        }
        Ok(to_prune.len())
    }
}

async fn get_or_create_store(
    stores: &RwLock<BTreeMap<CollectionName, Arc<MemoryStore>>>,
    name: &CollectionName,
) -> Arc<MemoryStore> {
    if let Some(store) = stores.read().await.get(name).cloned() {
        return store;
    }
    let mut guard = stores.write().await;
    guard
        .entry(name.clone())
        .or_insert_with(|| Arc::new(MemoryStore::new(name.clone())))
        .clone()
}

/// The reference in-memory [`StorageAdapter`]: every store lives for the
/// lifetime of the process and is lost on close.
pub struct MemoryAdapter {
    stores: Arc<RwLock<BTreeMap<CollectionName, Arc<MemoryStore>>>>,
}

impl MemoryAdapter {
    pub fn new() -> Self {
        Self {
            stores: Arc::new(RwLock::new(BTreeMap::new())),
        }
    }
}

impl Default for MemoryAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StorageAdapter for MemoryAdapter {
    async fn initialize(&mut self) -> Result<()> {
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.stores.write().await.clear();
        Ok(())
    }

    async fn has_store(&self, name: &CollectionName) -> Result<bool> {
        Ok(self.stores.read().await.contains_key(name))
    }

    async fn list_stores(&self) -> Result<Vec<CollectionName>> {
        Ok(self.stores.read().await.keys().cloned().collect())
    }

    async fn delete_store(&mut self, name: &CollectionName) -> Result<()> {
        self.stores.write().await.remove(name);
        Ok(())
    }

    async fn get_store(&self, name: &CollectionName) -> Result<Box<dyn DocumentStore>> {
        let store = get_or_create_store(&self.stores, name).await;
        Ok(Box::new(ArcStore(store)))
    }

    async fn get_stats(&self) -> Result<StorageStats> {
        let stores = self.stores.read().await;
        let mut total_documents = 0;
        for store in stores.values() {
            total_documents += store.state.lock().await.documents.len();
        }
        Ok(StorageStats {
            store_count: stores.len(),
            total_documents,
        })
    }

    async fn transaction(&self, mode: TransactionMode) -> Result<Box<dyn Transaction>> {
        Ok(Box::new(MemoryTransaction {
            stores: self.stores.clone(),
            mode,
            snapshots: BTreeMap::new(),
        }))
    }
}

/// An all-or-nothing group of writes against the in-memory backend. Each
/// `put`/`delete` commits to its store immediately (the reference backend
/// offers no read isolation between an open transaction and other callers);
/// what this adds is a snapshot of every touched store's state taken before
/// its first write, so `rollback` can undo the whole group.
struct MemoryTransaction {
    stores: Arc<RwLock<BTreeMap<CollectionName, Arc<MemoryStore>>>>,
    mode: TransactionMode,
    snapshots: BTreeMap<CollectionName, (Arc<MemoryStore>, StoreState)>,
}

impl MemoryTransaction {
    async fn store_for_write(&mut self, name: &CollectionName) -> Result<Arc<MemoryStore>> {
        if self.mode == TransactionMode::ReadOnly {
            return Err(Error::internal("cannot write inside a read-only transaction"));
        }
        let store = get_or_create_store(&self.stores, name).await;
        if !self.snapshots.contains_key(name) {
            let snapshot = store.state.lock().await.clone();
            self.snapshots.insert(name.clone(), (store.clone(), snapshot));
        }
        Ok(store)
    }
}

#[async_trait]
impl Transaction for MemoryTransaction {
    async fn put(&mut self, collection: &CollectionName, doc: Document) -> Result<ChangeEvent> {
        let store = self.store_for_write(collection).await?;
        store.put(doc).await
    }

    async fn delete(&mut self, collection: &CollectionName, id: &DocId) -> Result<ChangeEvent> {
        let store = self.store_for_write(collection).await?;
        store.delete(id).await
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        for (_, (store, snapshot)) in self.snapshots {
            *store.state.lock().await = snapshot;
        }
        Ok(())
    }
}

/// Wraps an `Arc<MemoryStore>` so [`StorageAdapter::get_store`] can hand out
/// an owned trait object while multiple callers share the same backing
/// state.
struct ArcStore(Arc<MemoryStore>);

#[async_trait]
impl DocumentStore for ArcStore {
    async fn get(&self, id: &DocId) -> Result<Option<Document>> {
        self.0.get(id).await
    }
    async fn get_many(&self, ids: &[DocId]) -> Result<Vec<Document>> {
        self.0.get_many(ids).await
    }
    async fn get_all(&self) -> Result<Vec<Document>> {
        self.0.get_all().await
    }
    async fn put(&self, doc: Document) -> Result<ChangeEvent> {
        self.0.put(doc).await
    }
    async fn bulk_put(&self, docs: Vec<Document>) -> Result<Vec<ChangeEvent>> {
        self.0.bulk_put(docs).await
    }
    async fn delete(&self, id: &DocId) -> Result<ChangeEvent> {
        self.0.delete(id).await
    }
    async fn bulk_delete(&self, ids: &[DocId]) -> Result<Vec<ChangeEvent>> {
        self.0.bulk_delete(ids).await
    }
    async fn create_index(&self, def: IndexDef) -> Result<()> {
        self.0.create_index(def).await
    }
    async fn drop_index(&self, name: &str) -> Result<bool> {
        self.0.drop_index(name).await
    }
    async fn get_indexes(&self) -> Result<Vec<IndexDef>> {
        self.0.get_indexes().await
    }
    async fn changes_since(&self, after: Seq) -> Result<Vec<ChangeEvent>> {
        self.0.changes_since(after).await
    }
    async fn clear(&self) -> Result<()> {
        self.0.clear().await
    }
    async fn compact(&self, watermark: Seq) -> Result<usize> {
        self.0.compact(watermark).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Value;

    fn doc(id: &str, fields: &[(&str, Value)]) -> Document {
        Document::new(id, fields.iter().map(|(k, v)| (k.to_string(), v.clone())).collect())
    }

    #[tokio::test]
    async fn put_assigns_strictly_increasing_seq() {
        let adapter = MemoryAdapter::new();
        let store = adapter.get_store(&"users".to_string()).await.unwrap();
        let e1 = store.put(doc("1", &[])).await.unwrap();
        let e2 = store.put(doc("2", &[])).await.unwrap();
        assert!(e2.seq > e1.seq);
    }

    #[tokio::test]
    async fn unique_index_rejects_duplicate_and_leaves_state_unchanged() {
        let adapter = MemoryAdapter::new();
        let store = adapter.get_store(&"users".to_string()).await.unwrap();
        store
            .create_index(crate::index::IndexDef::new(
                "by_email",
                vec![crate::index::IndexField {
                    path: "email".to_string(),
                    direction: crate::index::SortDirection::Asc,
                }],
            ).unique())
            .await
            .unwrap();

        store.put(doc("u1", &[("email", "a@x".into())])).await.unwrap();
        let err = store.put(doc("u2", &[("email", "a@x".into())])).await;
        assert!(matches!(err, Err(Error::UniqueConstraint { .. })));
        assert_eq!(store.get_all().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn delete_produces_tombstone_retaining_id_and_rev() {
        let adapter = MemoryAdapter::new();
        let store = adapter.get_store(&"users".to_string()).await.unwrap();
        store.put(doc("1", &[])).await.unwrap();
        let event = store.delete(&"1".to_string()).await.unwrap();
        let tombstone = event.document.unwrap();
        assert!(tombstone.deleted);
        assert_eq!(tombstone.id, "1");
        assert!(!tombstone.rev.is_empty());
    }

    #[tokio::test]
    async fn changes_since_replays_from_cursor() {
        let adapter = MemoryAdapter::new();
        let store = adapter.get_store(&"users".to_string()).await.unwrap();
        store.put(doc("1", &[])).await.unwrap();
        let e2 = store.put(doc("2", &[])).await.unwrap();
        let since = store.changes_since(e2.seq - 1).await.unwrap();
        assert_eq!(since.len(), 1);
        assert_eq!(since[0].doc_id, "2");
    }

    #[tokio::test]
    async fn get_store_is_shared_across_calls() {
        let adapter = MemoryAdapter::new();
        let store_a = adapter.get_store(&"users".to_string()).await.unwrap();
        store_a.put(doc("1", &[])).await.unwrap();
        let store_b = adapter.get_store(&"users".to_string()).await.unwrap();
        assert_eq!(store_b.get_all().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn compact_prunes_tombstones_below_watermark() {
        let adapter = MemoryAdapter::new();
        let store = adapter.get_store(&"users".to_string()).await.unwrap();
        store.put(doc("1", &[])).await.unwrap();
        let del = store.delete(&"1".to_string()).await.unwrap();
        let pruned = store.compact(del.seq).await.unwrap();
        assert_eq!(pruned, 1);
        assert!(store.get(&"1".to_string()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn transaction_rollback_restores_pre_transaction_state() {
        let adapter = MemoryAdapter::new();
        let store = adapter.get_store(&"users".to_string()).await.unwrap();
        store.put(doc("1", &[("name", "Alice".into())])).await.unwrap();

        let mut tx = adapter.transaction(TransactionMode::ReadWrite).await.unwrap();
        tx.put(&"users".to_string(), doc("2", &[("name", "Bob".into())]))
            .await
            .unwrap();
        tx.delete(&"users".to_string(), &"1".to_string()).await.unwrap();
        tx.rollback().await.unwrap();

        let all = store.get_all().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].id, "1");
        assert!(!all[0].deleted);
    }

    #[tokio::test]
    async fn transaction_commit_keeps_writes() {
        let adapter = MemoryAdapter::new();
        let store = adapter.get_store(&"users".to_string()).await.unwrap();

        let mut tx = adapter.transaction(TransactionMode::ReadWrite).await.unwrap();
        tx.put(&"users".to_string(), doc("1", &[])).await.unwrap();
        tx.commit().await.unwrap();

        assert_eq!(store.get_all().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn read_only_transaction_rejects_writes() {
        let adapter = MemoryAdapter::new();
        let mut tx = adapter.transaction(TransactionMode::ReadOnly).await.unwrap();
        let err = tx.put(&"users".to_string(), doc("1", &[])).await;
        assert!(err.is_err());
    }
}

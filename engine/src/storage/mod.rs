//! The pluggable storage adapter contract.
//!
//! The engine core never touches disk directly; every durable effect flows
//! through a [`StorageAdapter`] and the [`DocumentStore`] it hands out per
//! collection. This is the one seam where IO is allowed to cross into
//! otherwise pure collection/query logic.

pub mod memory;

use crate::document::{ChangeEvent, Document};
use crate::index::IndexDef;
use crate::{CollectionName, DocId, Result, Seq};
use async_trait::async_trait;
use std::collections::HashMap;

/// Aggregate counters a storage adapter reports for diagnostics.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StorageStats {
    pub store_count: usize,
    pub total_documents: usize,
}

/// Isolation/locking mode requested for a [`StorageAdapter::transaction`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionMode {
    ReadOnly,
    ReadWrite,
}

/// Top-level adapter: owns zero or more named document stores (one per
/// collection) plus whatever connection/config state the backend needs.
#[async_trait]
pub trait StorageAdapter: Send + Sync {
    async fn initialize(&mut self) -> Result<()>;
    async fn close(&mut self) -> Result<()>;

    async fn has_store(&self, name: &CollectionName) -> Result<bool>;
    async fn list_stores(&self) -> Result<Vec<CollectionName>>;
    async fn delete_store(&mut self, name: &CollectionName) -> Result<()>;

    /// Returns a handle to the named document store, creating it if it does
    /// not already exist.
    async fn get_store(&self, name: &CollectionName) -> Result<Box<dyn DocumentStore>>;

    async fn get_stats(&self) -> Result<StorageStats>;

    /// Opens a [`Transaction`] spanning one or more collections. Writes made
    /// through it are invisible to other callers until `commit()`, and
    /// `rollback()` (or dropping without committing, for backends that
    /// support it) undoes them as a unit.
    async fn transaction(&self, mode: TransactionMode) -> Result<Box<dyn Transaction>>;
}

/// Per-collection document storage. Implementations are responsible for
/// correct `seq` assignment (strictly increasing, per adapter) and for
/// surfacing `UniqueConstraint` without partially mutating state.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn get(&self, id: &DocId) -> Result<Option<Document>>;
    async fn get_many(&self, ids: &[DocId]) -> Result<Vec<Document>>;
    async fn get_all(&self) -> Result<Vec<Document>>;

    async fn put(&self, doc: Document) -> Result<ChangeEvent>;
    async fn bulk_put(&self, docs: Vec<Document>) -> Result<Vec<ChangeEvent>>;

    async fn delete(&self, id: &DocId) -> Result<ChangeEvent>;
    async fn bulk_delete(&self, ids: &[DocId]) -> Result<Vec<ChangeEvent>>;

    async fn create_index(&self, def: IndexDef) -> Result<()>;
    async fn drop_index(&self, name: &str) -> Result<bool>;
    async fn get_indexes(&self) -> Result<Vec<IndexDef>>;

    /// Returns every change event committed with `seq > after`, in commit
    /// order. Callers drive polling/backoff; this call never blocks.
    async fn changes_since(&self, after: Seq) -> Result<Vec<ChangeEvent>>;

    async fn clear(&self) -> Result<()>;

    /// Prunes tombstones with `seq` at or below `watermark`. Never invoked
    /// automatically; exposed for an operator-driven compaction pass.
    async fn compact(&self, watermark: Seq) -> Result<usize>;
}

/// A named, atomic group of operations across one or more stores. Only the
/// in-memory reference adapter is provided in the core; persistent adapters
/// implement their own transaction semantics against the same contract.
#[async_trait]
pub trait Transaction: Send + Sync {
    async fn put(&mut self, collection: &CollectionName, doc: Document) -> Result<ChangeEvent>;
    async fn delete(&mut self, collection: &CollectionName, id: &DocId) -> Result<ChangeEvent>;
    async fn commit(self: Box<Self>) -> Result<()>;
    async fn rollback(self: Box<Self>) -> Result<()>;
}

pub type StoreRegistry = HashMap<CollectionName, Box<dyn DocumentStore>>;

//! Postgres-backed [`StorageAdapter`]/[`DocumentStore`] implementation: the
//! persistent adapter referenced by the replication server. Mirrors
//! `carry_engine::storage::memory::MemoryStore`'s shape (a document map plus
//! an in-process index manager guarded by a mutex) but backs the document
//! map with Postgres rows so state survives a restart.

use async_trait::async_trait;
use carry_engine::document::{ChangeEvent, ChangeOp, Document};
use carry_engine::index::{IndexDef, IndexManager};
use carry_engine::storage::{DocumentStore, StorageAdapter, StorageStats, Transaction, TransactionMode};
use carry_engine::{document, CollectionName, DocId, Error, Result, Seq};
use sqlx::{PgPool, Row};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};

fn sql_err(e: sqlx::Error) -> Error {
    Error::internal(format!("postgres error: {e}"))
}

fn now_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Encodes a document's field map the same way `Document::to_json` does, so
/// timestamps survive the round trip through `jsonb` as `{"$date": millis}`
/// rather than collapsing onto a plain number.
fn fields_to_json(fields: &BTreeMap<String, carry_engine::Value>) -> serde_json::Value {
    let mut map = serde_json::Map::new();
    for (k, v) in fields {
        map.insert(k.clone(), v.to_json());
    }
    serde_json::Value::Object(map)
}

fn row_to_document(fields: serde_json::Value, id: String, rev: String, updated_at: i64, deleted: bool) -> Document {
    let mut obj = match fields {
        serde_json::Value::Object(m) => m,
        _ => serde_json::Map::new(),
    };
    obj.insert("id".to_string(), serde_json::Value::String(id));
    obj.insert("rev".to_string(), serde_json::Value::String(rev));
    obj.insert("updatedAt".to_string(), serde_json::Value::from(updated_at));
    obj.insert("deleted".to_string(), serde_json::Value::Bool(deleted));
    Document::from_json(&serde_json::Value::Object(obj)).expect("row always round-trips")
}

fn revision_counter(rev: &str) -> u64 {
    rev.split('-').next().and_then(|c| c.parse().ok()).unwrap_or(0)
}

async fn fetch_one_via<'e, E>(exec: E, collection: &CollectionName, id: &DocId) -> Result<Option<Document>>
where
    E: sqlx::PgExecutor<'e>,
{
    let row = sqlx::query("SELECT id, rev, updated_at, deleted, fields FROM documents WHERE collection = $1 AND id = $2")
        .bind(collection)
        .bind(id)
        .fetch_optional(exec)
        .await
        .map_err(sql_err)?;

    Ok(row.map(|r| {
        let fields: serde_json::Value = r.get("fields");
        row_to_document(fields, r.get("id"), r.get("rev"), r.get("updated_at"), r.get("deleted"))
    }))
}

async fn next_seq_via<'e, E>(exec: E) -> Result<Seq>
where
    E: sqlx::PgExecutor<'e>,
{
    let row = sqlx::query("SELECT nextval('change_seq') AS seq")
        .fetch_one(exec)
        .await
        .map_err(sql_err)?;
    let seq: i64 = row.get("seq");
    Ok(seq as Seq)
}

async fn upsert_row_via<'e, E>(exec: E, collection: &CollectionName, doc: &Document, seq: Seq) -> Result<()>
where
    E: sqlx::PgExecutor<'e>,
{
    let fields = fields_to_json(&doc.fields);
    sqlx::query(
        r#"
        INSERT INTO documents (collection, id, rev, updated_at, deleted, fields, seq)
        VALUES ($1, $2, $3, $4, $5, $6, $7)
        ON CONFLICT (collection, id) DO UPDATE SET
            rev = EXCLUDED.rev,
            updated_at = EXCLUDED.updated_at,
            deleted = EXCLUDED.deleted,
            fields = EXCLUDED.fields,
            seq = EXCLUDED.seq
        "#,
    )
    .bind(collection)
    .bind(&doc.id)
    .bind(&doc.rev)
    .bind(doc.updated_at)
    .bind(doc.deleted)
    .bind(fields)
    .bind(seq as i64)
    .execute(exec)
    .await
    .map_err(sql_err)?;
    Ok(())
}

async fn append_change_log_via<'e, E>(exec: E, collection: &CollectionName, event: &ChangeEvent) -> Result<()>
where
    E: sqlx::PgExecutor<'e>,
{
    let document = event.document.as_ref().map(|d| d.to_json());
    let previous_document = event.previous_document.as_ref().map(|d| d.to_json());
    let op = match event.op {
        ChangeOp::Insert => "insert",
        ChangeOp::Update => "update",
        ChangeOp::Delete => "delete",
    };

    sqlx::query(
        r#"
        INSERT INTO change_log (seq, collection, doc_id, op, document, previous_document, from_sync, "timestamp")
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
        "#,
    )
    .bind(event.seq as i64)
    .bind(collection)
    .bind(&event.doc_id)
    .bind(op)
    .bind(document)
    .bind(previous_document)
    .bind(event.from_sync)
    .bind(event.timestamp)
    .execute(exec)
    .await
    .map_err(sql_err)?;
    Ok(())
}

/// Per-collection Postgres-backed document store.
pub struct PostgresStore {
    pool: PgPool,
    collection: CollectionName,
    indexes: Mutex<IndexManager>,
}

impl PostgresStore {
    async fn new(pool: PgPool, collection: CollectionName) -> Result<Self> {
        let store = Self {
            pool,
            collection,
            indexes: Mutex::new(IndexManager::new()),
        };
        Ok(store)
    }

    async fn fetch_one(&self, id: &DocId) -> Result<Option<Document>> {
        fetch_one_via(&self.pool, &self.collection, id).await
    }
}

#[async_trait]
impl DocumentStore for PostgresStore {
    async fn get(&self, id: &DocId) -> Result<Option<Document>> {
        self.fetch_one(id).await
    }

    async fn get_many(&self, ids: &[DocId]) -> Result<Vec<Document>> {
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(doc) = self.fetch_one(id).await? {
                out.push(doc);
            }
        }
        Ok(out)
    }

    async fn get_all(&self) -> Result<Vec<Document>> {
        let rows = sqlx::query("SELECT id, rev, updated_at, deleted, fields FROM documents WHERE collection = $1")
            .bind(&self.collection)
            .fetch_all(&self.pool)
            .await
            .map_err(sql_err)?;
        Ok(rows
            .into_iter()
            .map(|r| {
                let fields: serde_json::Value = r.get("fields");
                row_to_document(fields, r.get("id"), r.get("rev"), r.get("updated_at"), r.get("deleted"))
            })
            .collect())
    }

    async fn put(&self, mut doc: Document) -> Result<ChangeEvent> {
        let previous = self.fetch_one(&doc.id).await?;
        let prev_counter = previous.as_ref().map(|p| revision_counter(&p.rev)).unwrap_or(0);

        doc.rev = document::new_revision(prev_counter, &doc.fields);
        doc.updated_at = now_millis();

        {
            let mut indexes = self.indexes.lock().await;
            if let Some(prev) = &previous {
                indexes.on_update(prev, &doc)?;
            } else {
                indexes.on_insert(&doc)?;
            }
        }

        let op = if previous.is_none() { ChangeOp::Insert } else { ChangeOp::Update };

        // The document write and its change-log entry commit as one unit so a
        // crash between them can never leave a mutation with no change-feed
        // record (or vice versa).
        let mut tx = self.pool.begin().await.map_err(sql_err)?;
        let seq = next_seq_via(&mut *tx).await?;
        upsert_row_via(&mut *tx, &self.collection, &doc, seq).await?;

        let event = ChangeEvent {
            op,
            collection: self.collection.clone(),
            doc_id: doc.id.clone(),
            document: Some(doc),
            previous_document: previous,
            from_sync: false,
            timestamp: now_millis(),
            seq,
        };
        append_change_log_via(&mut *tx, &self.collection, &event).await?;
        tx.commit().await.map_err(sql_err)?;
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
        let previous = self.fetch_one(id).await?.ok_or_else(|| Error::NotFound {
            collection: self.collection.clone(),
            id: id.clone(),
        })?;

        {
            let mut indexes = self.indexes.lock().await;
            indexes.on_delete(&previous);
        }

        let mut tombstone = previous.clone();
        tombstone.deleted = true;
        let prev_counter = revision_counter(&previous.rev);
        tombstone.rev = document::new_revision(prev_counter, &tombstone.fields);
        tombstone.updated_at = now_millis();

        let mut tx = self.pool.begin().await.map_err(sql_err)?;
        let seq = next_seq_via(&mut *tx).await?;
        upsert_row_via(&mut *tx, &self.collection, &tombstone, seq).await?;

        let event = ChangeEvent {
            op: ChangeOp::Delete,
            collection: self.collection.clone(),
            doc_id: id.clone(),
            document: Some(tombstone),
            previous_document: Some(previous),
            from_sync: false,
            timestamp: now_millis(),
            seq,
        };
        append_change_log_via(&mut *tx, &self.collection, &event).await?;
        tx.commit().await.map_err(sql_err)?;
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
        let docs = self.get_all().await?;
        let mut indexes = self.indexes.lock().await;
        indexes.create_index(def, docs.iter())
    }

    async fn drop_index(&self, name: &str) -> Result<bool> {
        Ok(self.indexes.lock().await.drop_index(name))
    }

    async fn get_indexes(&self) -> Result<Vec<IndexDef>> {
        Ok(self.indexes.lock().await.list().into_iter().cloned().collect())
    }

    async fn changes_since(&self, after: Seq) -> Result<Vec<ChangeEvent>> {
        let rows = sqlx::query(
            r#"
            SELECT seq, doc_id, op, document, previous_document, from_sync, "timestamp"
            FROM change_log
            WHERE collection = $1 AND seq > $2
            ORDER BY seq ASC
            "#,
        )
        .bind(&self.collection)
        .bind(after as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(sql_err)?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let op_str: String = row.get("op");
            let op = match op_str.as_str() {
                "insert" => ChangeOp::Insert,
                "update" => ChangeOp::Update,
                _ => ChangeOp::Delete,
            };
            let document: Option<serde_json::Value> = row.get("document");
            let previous_document: Option<serde_json::Value> = row.get("previous_document");
            out.push(ChangeEvent {
                op,
                collection: self.collection.clone(),
                doc_id: row.get("doc_id"),
                document: document.and_then(|v| Document::from_json(&v)),
                previous_document: previous_document.and_then(|v| Document::from_json(&v)),
                from_sync: row.get("from_sync"),
                timestamp: row.get("timestamp"),
                seq: row.get::<i64, _>("seq") as Seq,
            });
        }
        Ok(out)
    }

    async fn clear(&self) -> Result<()> {
        sqlx::query("DELETE FROM documents WHERE collection = $1")
            .bind(&self.collection)
            .execute(&self.pool)
            .await
            .map_err(sql_err)?;
        sqlx::query("DELETE FROM change_log WHERE collection = $1")
            .bind(&self.collection)
            .execute(&self.pool)
            .await
            .map_err(sql_err)?;
        *self.indexes.lock().await = IndexManager::new();
        Ok(())
    }

    async fn compact(&self, watermark: Seq) -> Result<usize> {
        let result = sqlx::query(
            r#"
            DELETE FROM documents
            WHERE collection = $1 AND deleted = true AND seq <= $2
            "#,
        )
        .bind(&self.collection)
        .bind(watermark as i64)
        .execute(&self.pool)
        .await
        .map_err(sql_err)?;
        Ok(result.rows_affected() as usize)
    }
}

/// The persistent [`StorageAdapter`]: every store is backed by rows in the
/// shared `documents`/`change_log` tables, scoped by collection name.
pub struct PostgresAdapter {
    pool: PgPool,
    stores: Arc<RwLock<BTreeMap<CollectionName, Arc<PostgresStore>>>>,
}

impl PostgresAdapter {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            stores: Arc::new(RwLock::new(BTreeMap::new())),
        }
    }

    /// The underlying connection pool, for callers (checkpoint persistence,
    /// migrations) that need to issue queries outside the store abstraction.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn get_or_create_store(&self, name: &CollectionName) -> Result<Arc<PostgresStore>> {
        if let Some(store) = self.stores.read().await.get(name).cloned() {
            return Ok(store);
        }
        let mut stores = self.stores.write().await;
        if let Some(store) = stores.get(name).cloned() {
            return Ok(store);
        }
        let created = Arc::new(PostgresStore::new(self.pool.clone(), name.clone()).await?);
        let docs = created.get_all().await?;
        let indexes = created.get_indexes().await?;
        if !indexes.is_empty() {
            let mut manager = IndexManager::new();
            for def in indexes {
                manager.create_index(def, docs.iter())?;
            }
            *created.indexes.lock().await = manager;
        }
        stores.insert(name.clone(), created.clone());
        Ok(created)
    }
}

#[async_trait]
impl StorageAdapter for PostgresAdapter {
    async fn initialize(&mut self) -> Result<()> {
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.stores.write().await.clear();
        Ok(())
    }

    async fn has_store(&self, name: &CollectionName) -> Result<bool> {
        if self.stores.read().await.contains_key(name) {
            return Ok(true);
        }
        let row = sqlx::query("SELECT 1 FROM documents WHERE collection = $1 LIMIT 1")
            .bind(name)
            .fetch_optional(&self.pool)
            .await
            .map_err(sql_err)?;
        Ok(row.is_some())
    }

    async fn list_stores(&self) -> Result<Vec<CollectionName>> {
        let rows = sqlx::query("SELECT DISTINCT collection FROM documents")
            .fetch_all(&self.pool)
            .await
            .map_err(sql_err)?;
        Ok(rows.into_iter().map(|r| r.get("collection")).collect())
    }

    async fn delete_store(&mut self, name: &CollectionName) -> Result<()> {
        self.stores.write().await.remove(name);
        sqlx::query("DELETE FROM documents WHERE collection = $1")
            .bind(name)
            .execute(&self.pool)
            .await
            .map_err(sql_err)?;
        sqlx::query("DELETE FROM change_log WHERE collection = $1")
            .bind(name)
            .execute(&self.pool)
            .await
            .map_err(sql_err)?;
        Ok(())
    }

    async fn get_store(&self, name: &CollectionName) -> Result<Box<dyn DocumentStore>> {
        let store = self.get_or_create_store(name).await?;
        Ok(Box::new(ArcStore(store)))
    }

    async fn transaction(&self, mode: TransactionMode) -> Result<Box<dyn Transaction>> {
        let tx = self.pool.begin().await.map_err(sql_err)?;
        Ok(Box::new(PostgresTransaction {
            pool: self.pool.clone(),
            stores: self.stores.clone(),
            tx: Mutex::new(Some(tx)),
            mode,
        }))
    }

    async fn get_stats(&self) -> Result<StorageStats> {
        let stores = self.stores.read().await;
        let row = sqlx::query("SELECT COUNT(*) AS c FROM documents")
            .fetch_one(&self.pool)
            .await
            .map_err(sql_err)?;
        let total_documents: i64 = row.get("c");
        Ok(StorageStats {
            store_count: stores.len(),
            total_documents: total_documents as usize,
        })
    }
}

/// Wraps an `Arc<PostgresStore>` so [`StorageAdapter::get_store`] can hand
/// out an owned trait object while multiple callers share the same
/// in-process index cache.
struct ArcStore(Arc<PostgresStore>);

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

/// A genuine `sqlx` transaction spanning writes to one or more collections.
/// Each `put`/`delete` issues its statements against the shared connection
/// held by `tx`; nothing is visible to other callers until `commit()`.
struct PostgresTransaction {
    pool: PgPool,
    stores: Arc<RwLock<BTreeMap<CollectionName, Arc<PostgresStore>>>>,
    // Behind a `Mutex` (rather than a bare `Option`) purely so this type is
    // unconditionally `Sync`, as `Transaction: Send + Sync` requires; every
    // access still goes through `&mut self` so there is never contention.
    tx: Mutex<Option<sqlx::Transaction<'static, sqlx::Postgres>>>,
    mode: TransactionMode,
}

impl PostgresTransaction {
    async fn store_for(&self, name: &CollectionName) -> Result<Arc<PostgresStore>> {
        if let Some(store) = self.stores.read().await.get(name).cloned() {
            return Ok(store);
        }
        let mut stores = self.stores.write().await;
        if let Some(store) = stores.get(name).cloned() {
            return Ok(store);
        }
        let created = Arc::new(PostgresStore::new(self.pool.clone(), name.clone()).await?);
        stores.insert(name.clone(), created.clone());
        Ok(created)
    }
}

#[async_trait]
impl Transaction for PostgresTransaction {
    async fn put(&mut self, collection: &CollectionName, mut doc: Document) -> Result<ChangeEvent> {
        if self.mode == TransactionMode::ReadOnly {
            return Err(Error::internal("cannot write inside a read-only transaction"));
        }
        let store = self.store_for(collection).await?;
        let mut guard = self.tx.lock().await;
        let tx = guard.as_mut().expect("transaction already finished");

        let previous = fetch_one_via(&mut *tx, collection, &doc.id).await?;
        let prev_counter = previous.as_ref().map(|p| revision_counter(&p.rev)).unwrap_or(0);
        doc.rev = document::new_revision(prev_counter, &doc.fields);
        doc.updated_at = now_millis();

        {
            let mut indexes = store.indexes.lock().await;
            if let Some(prev) = &previous {
                indexes.on_update(prev, &doc)?;
            } else {
                indexes.on_insert(&doc)?;
            }
        }

        let op = if previous.is_none() { ChangeOp::Insert } else { ChangeOp::Update };
        let seq = next_seq_via(&mut *tx).await?;
        upsert_row_via(&mut *tx, collection, &doc, seq).await?;

        let event = ChangeEvent {
            op,
            collection: collection.clone(),
            doc_id: doc.id.clone(),
            document: Some(doc),
            previous_document: previous,
            from_sync: false,
            timestamp: now_millis(),
            seq,
        };
        append_change_log_via(&mut *tx, collection, &event).await?;
        Ok(event)
    }

    async fn delete(&mut self, collection: &CollectionName, id: &DocId) -> Result<ChangeEvent> {
        if self.mode == TransactionMode::ReadOnly {
            return Err(Error::internal("cannot write inside a read-only transaction"));
        }
        let store = self.store_for(collection).await?;
        let mut guard = self.tx.lock().await;
        let tx = guard.as_mut().expect("transaction already finished");

        let previous = fetch_one_via(&mut *tx, collection, id).await?.ok_or_else(|| Error::NotFound {
            collection: collection.clone(),
            id: id.clone(),
        })?;

        {
            let mut indexes = store.indexes.lock().await;
            indexes.on_delete(&previous);
        }

        let mut tombstone = previous.clone();
        tombstone.deleted = true;
        tombstone.rev = document::new_revision(revision_counter(&previous.rev), &tombstone.fields);
        tombstone.updated_at = now_millis();

        let seq = next_seq_via(&mut *tx).await?;
        upsert_row_via(&mut *tx, collection, &tombstone, seq).await?;

        let event = ChangeEvent {
            op: ChangeOp::Delete,
            collection: collection.clone(),
            doc_id: id.clone(),
            document: Some(tombstone),
            previous_document: Some(previous),
            from_sync: false,
            timestamp: now_millis(),
            seq,
        };
        append_change_log_via(&mut *tx, collection, &event).await?;
        Ok(event)
    }

    async fn commit(mut self: Box<Self>) -> Result<()> {
        let tx = self.tx.get_mut().take().expect("transaction already finished");
        tx.commit().await.map_err(sql_err)
    }

    async fn rollback(mut self: Box<Self>) -> Result<()> {
        let tx = self.tx.get_mut().take().expect("transaction already finished");
        tx.rollback().await.map_err(sql_err)
    }
}

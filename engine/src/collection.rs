//! Collection: the public write/read surface over a [`DocumentStore`].

use crate::document::{ChangeEvent, Document};
use crate::error::{Error, Result};
use crate::executor::{self, ExecuteRequest, Projection, QueryResult};
use crate::filter::Filter;
use crate::planner::{self, SortSpec};
use crate::schema::CollectionSchema;
use crate::storage::DocumentStore;
use crate::value::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::broadcast;

/// A hook receives the document about to be written (for `before_*`) or
/// just committed (for `after_*`) and may reject the write with a typed
/// error. Re-entrant hook invocation is not supported, matching the
/// priority-ordered middleware design note.
pub type Hook = Arc<dyn Fn(&Document) -> Result<()> + Send + Sync>;

#[derive(Clone)]
struct PrioritizedHook {
    priority: i32,
    hook: Hook,
}

/// Hook lists for one lifecycle point, run in descending priority order
/// (lower-priority hooks run later).
#[derive(Clone, Default)]
struct HookSet {
    before_insert: Vec<PrioritizedHook>,
    before_update: Vec<PrioritizedHook>,
    before_delete: Vec<PrioritizedHook>,
    after_insert: Vec<PrioritizedHook>,
    after_update: Vec<PrioritizedHook>,
    after_delete: Vec<PrioritizedHook>,
}

fn sorted(mut hooks: Vec<PrioritizedHook>) -> Vec<PrioritizedHook> {
    hooks.sort_by(|a, b| b.priority.cmp(&a.priority));
    hooks
}

/// A named collection of documents: schema + storage + indexes + a change
/// broadcast for reactive subscribers and replication.
pub struct Collection {
    name: String,
    schema: CollectionSchema,
    store: Box<dyn DocumentStore>,
    hooks: HookSet,
    change_tx: broadcast::Sender<ChangeEvent>,
}

const CHANGE_CHANNEL_CAPACITY: usize = 1024;

impl Collection {
    pub fn new(name: impl Into<String>, schema: CollectionSchema, store: Box<dyn DocumentStore>) -> Self {
        let (change_tx, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            name: name.into(),
            schema,
            store,
            hooks: HookSet::default(),
            change_tx,
        }
    }

    pub fn subscribe_changes(&self) -> broadcast::Receiver<ChangeEvent> {
        self.change_tx.subscribe()
    }

    pub fn add_before_insert(&mut self, priority: i32, hook: Hook) {
        self.hooks.before_insert.push(PrioritizedHook { priority, hook });
        self.hooks.before_insert = sorted(std::mem::take(&mut self.hooks.before_insert));
    }

    pub fn add_after_insert(&mut self, priority: i32, hook: Hook) {
        self.hooks.after_insert.push(PrioritizedHook { priority, hook });
        self.hooks.after_insert = sorted(std::mem::take(&mut self.hooks.after_insert));
    }

    pub fn add_before_update(&mut self, priority: i32, hook: Hook) {
        self.hooks.before_update.push(PrioritizedHook { priority, hook });
        self.hooks.before_update = sorted(std::mem::take(&mut self.hooks.before_update));
    }

    pub fn add_after_update(&mut self, priority: i32, hook: Hook) {
        self.hooks.after_update.push(PrioritizedHook { priority, hook });
        self.hooks.after_update = sorted(std::mem::take(&mut self.hooks.after_update));
    }

    pub fn add_before_delete(&mut self, priority: i32, hook: Hook) {
        self.hooks.before_delete.push(PrioritizedHook { priority, hook });
        self.hooks.before_delete = sorted(std::mem::take(&mut self.hooks.before_delete));
    }

    pub fn add_after_delete(&mut self, priority: i32, hook: Hook) {
        self.hooks.after_delete.push(PrioritizedHook { priority, hook });
        self.hooks.after_delete = sorted(std::mem::take(&mut self.hooks.after_delete));
    }

    fn run_before(&self, hooks: &[PrioritizedHook], doc: &Document) -> Result<()> {
        for h in hooks {
            (h.hook)(doc)?;
        }
        Ok(())
    }

    fn run_after(&self, hooks: &[PrioritizedHook], doc: &Document) {
        for h in hooks {
            let _ = (h.hook)(doc);
        }
    }

    fn now_millis() -> i64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0)
    }

    /// Inserts a new document: applies schema defaults, validates, commits,
    /// and emits a change event. Fails without mutating state on a
    /// validation or unique-constraint error.
    pub async fn insert(&self, id: impl Into<String>, fields: BTreeMap<String, Value>) -> Result<Document> {
        let fields = self.schema.apply_defaults(fields, Self::now_millis());
        let errors = self.schema.validate(&fields);
        if !errors.is_empty() {
            return Err(Error::SchemaError { errors });
        }

        let doc = Document::new(id, fields);
        self.run_before(&self.hooks.before_insert, &doc)?;

        let event = self.store.put(doc).await?;
        let committed = event.document.clone().ok_or_else(|| {
            Error::internal("storage adapter returned no document for insert")
        })?;

        self.run_after(&self.hooks.after_insert, &committed);
        let _ = self.change_tx.send(event);
        Ok(committed)
    }

    pub async fn insert_many(
        &self,
        docs: Vec<(String, BTreeMap<String, Value>)>,
    ) -> Result<Vec<Document>> {
        let mut out = Vec::with_capacity(docs.len());
        for (id, fields) in docs {
            out.push(self.insert(id, fields).await?);
        }
        Ok(out)
    }

    /// Merges `patch` onto the existing document (the core always treats
    /// writes as replace-after-merge).
    pub async fn update(&self, id: &str, patch: BTreeMap<String, Value>) -> Result<Document> {
        let existing = self.get(id).await?.ok_or_else(|| Error::NotFound {
            collection: self.name.clone(),
            id: id.to_string(),
        })?;

        let mut merged = existing.fields.clone();
        for (k, v) in patch {
            merged.insert(k, v);
        }
        self.replace_fields(id, merged).await
    }

    pub async fn replace(&self, id: &str, fields: BTreeMap<String, Value>) -> Result<Document> {
        self.replace_fields(id, fields).await
    }

    async fn replace_fields(&self, id: &str, fields: BTreeMap<String, Value>) -> Result<Document> {
        let fields = self.schema.apply_defaults(fields, Self::now_millis());
        let errors = self.schema.validate(&fields);
        if !errors.is_empty() {
            return Err(Error::SchemaError { errors });
        }

        let doc = Document::new(id.to_string(), fields);
        self.run_before(&self.hooks.before_update, &doc)?;

        let event = self.store.put(doc).await?;
        let committed = event.document.clone().ok_or_else(|| {
            Error::internal("storage adapter returned no document for update")
        })?;

        self.run_after(&self.hooks.after_update, &committed);
        let _ = self.change_tx.send(event);
        Ok(committed)
    }

    pub async fn delete(&self, id: &str) -> Result<()> {
        let existing = self.get(id).await?.ok_or_else(|| Error::NotFound {
            collection: self.name.clone(),
            id: id.to_string(),
        })?;
        self.run_before(&self.hooks.before_delete, &existing)?;

        let event = self.store.delete(&id.to_string()).await?;

        if let Some(tombstone) = &event.document {
            self.run_after(&self.hooks.after_delete, tombstone);
        }
        let _ = self.change_tx.send(event);
        Ok(())
    }

    pub async fn get(&self, id: &str) -> Result<Option<Document>> {
        self.store.get(&id.to_string()).await
    }

    pub async fn find(
        &self,
        filter: &Filter,
        sort: &[SortSpec],
        skip: usize,
        limit: Option<usize>,
        projection: Projection,
        aggregates: &[crate::executor::Aggregate],
    ) -> Result<QueryResult> {
        let indexes = self.store.get_indexes().await?;
        let index_refs: Vec<&crate::index::IndexDef> = indexes.iter().collect();
        let plan = planner::plan_query(filter, sort, skip, limit, &index_refs);

        let candidates = self.store.get_all().await?;
        let req = ExecuteRequest {
            filter,
            sort,
            skip,
            limit,
            projection,
            aggregates,
        };
        Ok(executor::execute(&plan, candidates, &req, || Self::now_millis() as f64))
    }

    pub async fn count(&self, filter: Option<&Filter>) -> Result<usize> {
        let all = self.store.get_all().await?;
        Ok(match filter {
            Some(f) => all.iter().filter(|d| f.matches(d)).count(),
            None => all.len(),
        })
    }

    /// Applies a change event received from replication. Bypasses local
    /// hooks that assume a local actor but still commits through the same
    /// storage path, preserving invariants (unique constraints, seq
    /// assignment).
    pub async fn apply_remote_change(&self, event: ChangeEvent) -> Result<()> {
        if let Some(doc) = event.document {
            let committed_event = self.store.put(doc).await?;
            let mut remote_event = committed_event;
            remote_event.from_sync = true;
            let _ = self.change_tx.send(remote_event);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::FieldType;
    use crate::storage::memory::MemoryAdapter;
    use crate::storage::StorageAdapter;

    async fn test_collection() -> Collection {
        let adapter = MemoryAdapter::new();
        let store = adapter.get_store(&"users".to_string()).await.unwrap();
        let schema = CollectionSchema::new(
            "users",
            vec![crate::schema::FieldDef::required("title", FieldType::String)],
        );
        Collection::new("users", schema, store)
    }

    #[tokio::test]
    async fn insert_then_get_round_trips() {
        let c = test_collection().await;
        let mut fields = BTreeMap::new();
        fields.insert("title".to_string(), "A".into());
        let doc = c.insert("1", fields).await.unwrap();
        assert!(!doc.rev.is_empty());
        assert_eq!(c.count(None).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn insert_emits_change_with_seq_one() {
        let c = test_collection().await;
        let mut rx = c.subscribe_changes();
        let mut fields = BTreeMap::new();
        fields.insert("title".to_string(), "A".into());
        c.insert("1", fields).await.unwrap();
        let event = rx.recv().await.unwrap();
        assert_eq!(event.seq, 1);
    }

    #[tokio::test]
    async fn insert_rejects_missing_required_field() {
        let c = test_collection().await;
        let err = c.insert("1", BTreeMap::new()).await;
        assert!(matches!(err, Err(Error::SchemaError { .. })));
        assert_eq!(c.count(None).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn update_merges_onto_existing_fields() {
        let c = test_collection().await;
        let mut fields = BTreeMap::new();
        fields.insert("title".to_string(), "A".into());
        c.insert("1", fields).await.unwrap();

        let mut patch = BTreeMap::new();
        patch.insert("title".to_string(), "B".into());
        let updated = c.update("1", patch).await.unwrap();
        assert_eq!(updated.fields.get("title"), Some(&Value::String("B".into())));
    }

    #[tokio::test]
    async fn hooks_run_in_priority_order() {
        let mut c = test_collection().await;
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        let order_a = order.clone();
        c.add_before_insert(
            10,
            Arc::new(move |_| {
                order_a.lock().unwrap().push("high");
                Ok(())
            }),
        );
        let order_b = order.clone();
        c.add_before_insert(
            1,
            Arc::new(move |_| {
                order_b.lock().unwrap().push("low");
                Ok(())
            }),
        );
        let mut fields = BTreeMap::new();
        fields.insert("title".to_string(), "A".into());
        c.insert("1", fields).await.unwrap();
        assert_eq!(*order.lock().unwrap(), vec!["high", "low"]);
    }

    #[tokio::test]
    async fn update_and_delete_hooks_fire() {
        let mut c = test_collection().await;
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let seen_update = seen.clone();
        c.add_after_update(
            0,
            Arc::new(move |_| {
                seen_update.lock().unwrap().push("updated");
                Ok(())
            }),
        );
        let seen_delete = seen.clone();
        c.add_after_delete(
            0,
            Arc::new(move |_| {
                seen_delete.lock().unwrap().push("deleted");
                Ok(())
            }),
        );

        let mut fields = BTreeMap::new();
        fields.insert("title".to_string(), "A".into());
        c.insert("1", fields).await.unwrap();

        let mut patch = BTreeMap::new();
        patch.insert("title".to_string(), "B".into());
        c.update("1", patch).await.unwrap();
        c.delete("1").await.unwrap();

        assert_eq!(*seen.lock().unwrap(), vec!["updated", "deleted"]);
    }

    #[tokio::test]
    async fn find_computes_requested_aggregates() {
        let c = test_collection().await;
        let mut fields = BTreeMap::new();
        fields.insert("title".to_string(), "A".into());
        c.insert("1", fields).await.unwrap();

        let aggregates = [crate::executor::Aggregate::Count];
        let result = c
            .find(
                &Filter::Fields(BTreeMap::new()),
                &[],
                0,
                None,
                Projection::default(),
                &aggregates,
            )
            .await
            .unwrap();
        assert_eq!(result.aggregations.len(), 1);
    }

    #[tokio::test]
    async fn before_insert_hook_can_reject() {
        let mut c = test_collection().await;
        c.add_before_insert(
            0,
            Arc::new(|_| Err(Error::internal("rejected by hook"))),
        );
        let mut fields = BTreeMap::new();
        fields.insert("title".to_string(), "A".into());
        let err = c.insert("1", fields).await;
        assert!(err.is_err());
        assert_eq!(c.count(None).await.unwrap(), 0);
    }
}

//! # Carry Engine
//!
//! A deterministic, embeddable document database engine for local-first
//! applications.
//!
//! This crate provides the core logic for an offline-first document store:
//! schema validation, secondary indexes, a MongoDB-style filter language, a
//! query planner and executor, reactive subscriptions over a change feed,
//! peer replication with conflict resolution, row-level security, and a
//! collaborative text CRDT. Storage is abstracted behind the
//! [`storage::StorageAdapter`]/[`storage::DocumentStore`] traits; this crate
//! ships an in-memory reference implementation ([`storage::memory`]).
//!
//! ## Design Principles
//!
//! - **Storage-agnostic core**: all logic (schema, filter, planner, executor,
//!   RLS) is pure and deterministic; IO only happens behind the storage
//!   adapter and sync transport trait seams.
//! - **Deterministic**: the same inputs always produce the same outputs -
//!   revisions, sequence numbers, and query plans are reproducible.
//! - **Testable**: pure logic, async traits for the IO seams, no mocks
//!   needed for the core.
//!
//! ## Core Concepts
//!
//! ### Documents
//!
//! Data is stored as [`document::Document`]s: an id, a revision string, an
//! `updatedAt` timestamp, a soft-delete flag, and a field map. Revisions are
//! `<counter>-<hash>` strings that strictly increase per document.
//!
//! ### Collections
//!
//! A [`collection::Collection`] is the write/read surface over one named
//! document set: it validates writes against a [`schema::CollectionSchema`],
//! commits through a [`storage::DocumentStore`], runs priority-ordered
//! lifecycle hooks, and broadcasts [`document::ChangeEvent`]s to subscribers.
//!
//! ### Filters and queries
//!
//! [`filter::Filter`] is a MongoDB-style filter AST. [`planner::plan_query`]
//! picks the best available index for a filter/sort pair; [`executor::execute`]
//! runs the filter/sort/paginate/project/aggregate pipeline against a
//! candidate set.
//!
//! ### Replication
//!
//! [`replication::Replicator`] drives a push/pull sync loop against a
//! pluggable [`replication::SyncTransport`], exchanging
//! [`replication::Checkpoint`]s and resolving conflicts via
//! [`replication::ConflictStrategy`].
//!
//! ### Row-level security
//!
//! [`rls::PolicySet`] evaluates per-document access rules and can lower
//! allow-rule conditions into a [`filter::Filter`] to push tenant isolation
//! down into the query itself.
//!
//! ## Quick Start
//!
//! ```rust
//! use carry_engine::{CollectionSchema, FieldDef, FieldType, Collection};
//! use carry_engine::storage::memory::MemoryAdapter;
//! use carry_engine::storage::StorageAdapter;
//! use std::collections::BTreeMap;
//!
//! # #[tokio::main]
//! # async fn main() {
//! let adapter = MemoryAdapter::new();
//! let store = adapter.get_store(&"users".to_string()).await.unwrap();
//!
//! let schema = CollectionSchema::new(
//!     "users",
//!     vec![FieldDef::required("name", FieldType::String)],
//! );
//! let users = Collection::new("users", schema, store);
//!
//! let mut fields = BTreeMap::new();
//! fields.insert("name".to_string(), "Alice".into());
//! let doc = users.insert("user_1", fields).await.unwrap();
//! assert_eq!(doc.id, "user_1");
//! # }
//! ```

pub mod clock;
pub mod collection;
pub mod document;
pub mod error;
pub mod executor;
pub mod filter;
pub mod index;
pub mod planner;
pub mod regex_safety;
pub mod rls;
pub mod schema;
pub mod storage;
pub mod subscription;
pub mod replication;
pub mod text;
pub mod value;

// Re-export main types at crate root
pub use clock::LogicalClock;
pub use collection::Collection;
pub use document::{ChangeEvent, ChangeOp, Document};
pub use error::Error;
pub use executor::{Aggregate, AggregateResult, Projection, QueryResult};
pub use filter::Filter;
pub use index::{IndexDef, IndexField, SortDirection};
pub use planner::{QueryPlan, SortSpec};
pub use replication::{
    Checkpoint, ConflictStrategy, PersistedCheckpoint, PullMessage, PullResponse, PushMessage, PushResponse,
    Replicator, SyncTransport,
};
pub use rls::{attach_policies, Action as RlsAction, Context as RlsContext, Effect as RlsEffect, PolicyGuard, PolicySet, Rule as RlsRule};
pub use schema::{CollectionSchema, FieldDef, FieldType, Schema};
pub use text::TextDocument;
pub use value::Value;

pub use error::Result;

/// Type aliases for clarity.
pub type DocId = String;
pub type CollectionName = String;
pub type NodeId = String;
pub type Version = u64;
pub type Timestamp = i64;
pub type SchemaVersion = u32;
pub type Seq = u64;

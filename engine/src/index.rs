//! Secondary index management.
//!
//! An index is a named, ordered sequence of (field-path, direction) pairs.
//! Entries are kept in a `BTreeMap` keyed by the extracted tuple so range,
//! prefix, and equality scans are all plain B-tree operations.

use crate::document::Document;
use crate::value::Value;
use crate::{DocId, Error, Result};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortDirection {
    Asc,
    Desc,
}

/// A single (field, direction) pair in an index or sort spec.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexField {
    pub path: String,
    pub direction: SortDirection,
}

/// Declares an index: its name, the ordered field list, and whether it
/// enforces uniqueness.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexDef {
    pub name: String,
    pub fields: Vec<IndexField>,
    #[serde(default)]
    pub unique: bool,
}

impl IndexDef {
    pub fn new(name: impl Into<String>, fields: Vec<IndexField>) -> Self {
        Self {
            name: name.into(),
            fields,
            unique: false,
        }
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }
}

/// A totally-ordered key tuple extracted from a document for one index.
/// Missing/null fields sort last in both directions, matching the filter
/// language's sort semantics.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexKey(pub Vec<Value>);

impl IndexKey {
    fn extract(def: &IndexDef, doc: &Document) -> IndexKey {
        IndexKey(
            def.fields
                .iter()
                .map(|f| doc.get(&f.path).cloned().unwrap_or(Value::Null))
                .collect(),
        )
    }

    fn compare(&self, other: &IndexKey, def: &IndexDef) -> Ordering {
        for (i, field) in def.fields.iter().enumerate() {
            let a = &self.0[i];
            let b = &other.0[i];
            let ord = a.sort_compare(b);
            let ord = match field.direction {
                SortDirection::Asc => ord,
                SortDirection::Desc => {
                    if a.is_null() || b.is_null() {
                        ord // null/missing still sorts last regardless of direction
                    } else {
                        ord.reverse()
                    }
                }
            };
            if ord != Ordering::Equal {
                return ord;
            }
        }
        Ordering::Equal
    }
}

/// An in-memory ordered index over one collection.
#[derive(Debug, Clone)]
pub struct Index {
    pub def: IndexDef,
    entries: Vec<(IndexKey, DocId)>,
}

impl Index {
    pub fn new(def: IndexDef) -> Self {
        Self {
            def,
            entries: Vec::new(),
        }
    }

    /// Rebuilds the index from scratch over every document, used when a
    /// backing store reopens and the index was not found persisted.
    pub fn rebuild<'a>(&mut self, docs: impl Iterator<Item = &'a Document>) -> Result<()> {
        self.entries.clear();
        for doc in docs {
            self.insert(doc)?;
        }
        Ok(())
    }

    fn position_of(&self, key: &IndexKey) -> usize {
        let mut lo = 0usize;
        let mut hi = self.entries.len();
        while lo < hi {
            let mid = (lo + hi) / 2;
            match self.entries[mid].0.compare(key, &self.def) {
                Ordering::Less => lo = mid + 1,
                _ => hi = mid,
            }
        }
        lo
    }

    /// Inserts `doc`'s entry, enforcing uniqueness if configured.
    pub fn insert(&mut self, doc: &Document) -> Result<()> {
        let key = IndexKey::extract(&self.def, doc);

        if self.def.unique {
            let pos = self.position_of(&key);
            if let Some((existing_key, existing_id)) = self.entries.get(pos) {
                if existing_key.compare(&key, &self.def) == Ordering::Equal && existing_id != &doc.id {
                    return Err(Error::UniqueConstraint {
                        index: self.def.name.clone(),
                        values: key.0.iter().map(Value::to_json).collect(),
                    });
                }
            }
        }

        let pos = self.position_of(&key);
        self.entries.insert(pos, (key, doc.id.clone()));
        Ok(())
    }

    /// Removes the entry for a previous document state (found via old key).
    pub fn remove(&mut self, previous: &Document) {
        let key = IndexKey::extract(&self.def, previous);
        if let Some(idx) = self
            .entries
            .iter()
            .position(|(k, id)| id == &previous.id && k.compare(&key, &self.def) == Ordering::Equal)
        {
            self.entries.remove(idx);
        } else if let Some(idx) = self.entries.iter().position(|(_, id)| id == &previous.id) {
            self.entries.remove(idx);
        }
    }

    /// Replaces the entry for `previous` with the entry for `current`.
    pub fn update(&mut self, previous: &Document, current: &Document) -> Result<()> {
        self.remove(previous);
        self.insert(current)
    }

    /// Returns document ids in index order, useful for covering scans when
    /// the planner selects this index purely for sort order.
    pub fn ids_in_order(&self) -> Vec<DocId> {
        self.entries.iter().map(|(_, id)| id.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Owns the set of indexes declared on a collection.
#[derive(Debug, Clone, Default)]
pub struct IndexManager {
    indexes: BTreeMap<String, Index>,
}

impl IndexManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create_index<'a>(
        &mut self,
        def: IndexDef,
        docs: impl Iterator<Item = &'a Document>,
    ) -> Result<()> {
        let mut index = Index::new(def.clone());
        index.rebuild(docs)?;
        self.indexes.insert(def.name, index);
        Ok(())
    }

    pub fn drop_index(&mut self, name: &str) -> bool {
        self.indexes.remove(name).is_some()
    }

    pub fn get(&self, name: &str) -> Option<&Index> {
        self.indexes.get(name)
    }

    pub fn list(&self) -> Vec<&IndexDef> {
        self.indexes.values().map(|i| &i.def).collect()
    }

    pub fn on_insert(&mut self, doc: &Document) -> Result<()> {
        for index in self.indexes.values_mut() {
            index.insert(doc)?;
        }
        Ok(())
    }

    pub fn on_update(&mut self, previous: &Document, current: &Document) -> Result<()> {
        for index in self.indexes.values_mut() {
            index.update(previous, current)?;
        }
        Ok(())
    }

    pub fn on_delete(&mut self, previous: &Document) {
        for index in self.indexes.values_mut() {
            index.remove(previous);
        }
    }
}

//! Document identity, revisions, and change events.

use crate::value::Value;
use crate::{CollectionName, DocId, Seq};
use serde::de::Error as DeError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::cmp::Ordering;
use std::collections::BTreeMap;

/// Reserved top-level document keys. `id`, `rev`, `updatedAt`, and `deleted`
/// are managed by the engine; callers may read but must not hand-set them on
/// insert/update (the write path overwrites them).
pub const KEY_ID: &str = "id";
pub const KEY_REV: &str = "rev";
pub const KEY_UPDATED_AT: &str = "updatedAt";
pub const KEY_DELETED: &str = "deleted";

pub fn is_reserved(key: &str) -> bool {
    matches!(key, KEY_ID | KEY_REV | KEY_UPDATED_AT | KEY_DELETED) || key.starts_with('_')
}

/// A document: an ordered map of fields plus the engine-managed identity and
/// metadata keys, kept alongside rather than interleaved so lookups of `id`
/// or `rev` never touch the field map.
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    pub id: DocId,
    pub rev: String,
    pub updated_at: i64,
    pub deleted: bool,
    pub fields: BTreeMap<String, Value>,
}

/// Routes through [`Document::to_json`] rather than deriving field-by-field,
/// so the wire format stays the flattened, camelCase object the rest of the
/// protocol expects (and so `Value::Timestamp` serializes as `{"$date": ..}`
/// instead of a bare number).
impl Serialize for Document {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        self.to_json().serialize(serializer)
    }
}

/// Routes through [`Document::from_json`]; see the `Serialize` impl above.
impl<'de> Deserialize<'de> for Document {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = serde_json::Value::deserialize(deserializer)?;
        Document::from_json(&value).ok_or_else(|| DeError::custom("document is missing a required \"id\" field"))
    }
}

impl Document {
    pub fn new(id: impl Into<DocId>, fields: BTreeMap<String, Value>) -> Self {
        Self {
            id: id.into(),
            rev: String::new(),
            updated_at: 0,
            deleted: false,
            fields,
        }
    }

    pub fn get(&self, path: &str) -> Option<&Value> {
        if let Some(first) = path.split('.').next() {
            if first == path {
                return self.fields.get(path);
            }
        }
        let mut parts = path.splitn(2, '.');
        let head = parts.next()?;
        let rest = parts.next();
        let head_val = self.fields.get(head)?;
        match rest {
            None => Some(head_val),
            Some(rest) => head_val.get_path(rest),
        }
    }

    /// Serialize this document to a single JSON object, interleaving the
    /// reserved keys with the field map as the wire format expects.
    pub fn to_json(&self) -> serde_json::Value {
        let mut map = serde_json::Map::new();
        map.insert(KEY_ID.to_string(), serde_json::Value::String(self.id.clone()));
        map.insert(KEY_REV.to_string(), serde_json::Value::String(self.rev.clone()));
        map.insert(
            KEY_UPDATED_AT.to_string(),
            serde_json::Value::from(self.updated_at),
        );
        map.insert(KEY_DELETED.to_string(), serde_json::Value::Bool(self.deleted));
        for (k, v) in &self.fields {
            map.insert(k.clone(), v.to_json());
        }
        serde_json::Value::Object(map)
    }

    pub fn from_json(v: &serde_json::Value) -> Option<Document> {
        let obj = v.as_object()?;
        let id = obj.get(KEY_ID)?.as_str()?.to_string();
        let rev = obj
            .get(KEY_REV)
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        let updated_at = obj.get(KEY_UPDATED_AT).and_then(|v| v.as_i64()).unwrap_or(0);
        let deleted = obj
            .get(KEY_DELETED)
            .and_then(|v| v.as_bool())
            .unwrap_or(false);
        let mut fields = BTreeMap::new();
        for (k, val) in obj {
            if is_reserved(k) {
                continue;
            }
            fields.insert(k.clone(), Value::from_json(val));
        }
        Some(Document {
            id,
            rev,
            updated_at,
            deleted,
            fields,
        })
    }
}

/// Parses the strictly-increasing counter prefix of a revision string.
fn revision_counter(rev: &str) -> u64 {
    rev.split('-').next().and_then(|s| s.parse().ok()).unwrap_or(0)
}

fn revision_hash(rev: &str) -> &str {
    rev.splitn(2, '-').nth(1).unwrap_or("")
}

/// Produces the next revision string for a document body: a strictly
/// incrementing counter paired with a short digest of the canonical body,
/// used to break ties deterministically between revisions sharing a counter
/// (which should not occur locally but can arise across merged histories).
pub fn new_revision(prev_counter: u64, body_fields: &BTreeMap<String, Value>) -> String {
    let counter = prev_counter + 1;
    let digest = fnv1a_hex(body_fields);
    format!("{counter}-{digest}")
}

/// Compares two revision strings: counter first, then digest lexicographically.
pub fn compare_revisions(a: &str, b: &str) -> Ordering {
    match revision_counter(a).cmp(&revision_counter(b)) {
        Ordering::Equal => revision_hash(a).cmp(revision_hash(b)),
        other => other,
    }
}

/// FNV-1a over the canonical (sorted-key) JSON encoding of the fields,
/// truncated to 8 hex characters. Deterministic across platforms since the
/// field map is already a `BTreeMap`.
fn fnv1a_hex(fields: &BTreeMap<String, Value>) -> String {
    let canonical = serde_json::to_string(
        &fields
            .iter()
            .map(|(k, v)| (k.clone(), v.to_json()))
            .collect::<BTreeMap<_, _>>(),
    )
    .unwrap_or_default();

    let mut hash: u64 = 0xcbf29ce484222325;
    for byte in canonical.as_bytes() {
        hash ^= *byte as u64;
        hash = hash.wrapping_mul(0x100000001b3);
    }
    format!("{:08x}", hash & 0xffff_ffff)
}

/// The kind of write that produced a [`ChangeEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeOp {
    Insert,
    Update,
    Delete,
}

/// A single commit against a collection, assigned a strictly increasing
/// `seq` at commit time; this is the unit the change feed and replication
/// protocol exchange.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeEvent {
    pub op: ChangeOp,
    pub collection: CollectionName,
    pub doc_id: DocId,
    pub document: Option<Document>,
    pub previous_document: Option<Document>,
    pub from_sync: bool,
    pub timestamp: i64,
    pub seq: Seq,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn revisions_strictly_increase() {
        let mut fields = BTreeMap::new();
        fields.insert("a".to_string(), Value::Number(1.0));
        let r1 = new_revision(0, &fields);
        let r2 = new_revision(revision_counter(&r1), &fields);
        assert_eq!(compare_revisions(&r1, &r2), Ordering::Less);
    }

    #[test]
    fn ties_break_by_digest() {
        assert_eq!(compare_revisions("3-aaaa1111", "3-bbbb2222"), Ordering::Less);
        assert_eq!(compare_revisions("3-bbbb2222", "3-aaaa1111"), Ordering::Greater);
    }

    #[test]
    fn counter_dominates_digest() {
        assert_eq!(compare_revisions("2-zzzzzzzz", "3-aaaaaaaa"), Ordering::Less);
    }

    #[test]
    fn document_get_nested_path() {
        let mut inner = BTreeMap::new();
        inner.insert("city".to_string(), Value::String("Baku".into()));
        let mut fields = BTreeMap::new();
        fields.insert("address".to_string(), Value::Object(inner));
        let doc = Document::new("1", fields);
        assert_eq!(doc.get("address.city"), Some(&Value::String("Baku".into())));
        assert_eq!(doc.get("address.missing"), None);
    }

    #[test]
    fn json_roundtrip_separates_reserved_keys() {
        let mut fields = BTreeMap::new();
        fields.insert("name".to_string(), Value::String("Alice".into()));
        let mut doc = Document::new("u1", fields);
        doc.rev = "1-abcd1234".to_string();
        doc.updated_at = 1700000000000;

        let json = doc.to_json();
        let back = Document::from_json(&json).unwrap();
        assert_eq!(doc, back);
        assert!(!back.fields.contains_key(KEY_ID));
    }
}

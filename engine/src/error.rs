//! Error types for the Carry engine.

use crate::schema::ValidationError;
use crate::{CollectionName, DocId};
use thiserror::Error;

/// All possible errors from the Carry engine.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum Error {
    #[error("schema validation failed: {errors:?}")]
    SchemaError { errors: Vec<ValidationError> },

    #[error("unique constraint violated on index '{index}': {values:?}")]
    UniqueConstraint {
        index: String,
        values: Vec<serde_json::Value>,
    },

    #[error("document not found in '{collection}': {id}")]
    NotFound { collection: CollectionName, id: DocId },

    #[error("collection not found: {0}")]
    CollectionNotFound(CollectionName),

    #[error("position out of bounds")]
    OutOfBounds,

    #[error("text length exceeded maximum of {max}")]
    TextLengthExceeded { max: usize },

    #[error("conflict on document {doc_id}: server_rev={server_rev}, local_rev={local_rev}")]
    Conflict {
        doc_id: DocId,
        server_rev: String,
        local_rev: String,
    },

    #[error("transport error (retryable={retryable}): {cause}")]
    TransportError { retryable: bool, cause: String },

    #[error("operation cancelled")]
    Cancelled,

    #[error("internal invariant violation: {description}")]
    Internal { description: String },
}

impl Error {
    pub fn internal(description: impl Into<String>) -> Self {
        Error::Internal {
            description: description.into(),
        }
    }
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = Error::CollectionNotFound("users".into());
        assert_eq!(err.to_string(), "collection not found: users");

        let err = Error::Conflict {
            doc_id: "doc-1".into(),
            server_rev: "2-aa".into(),
            local_rev: "2-bb".into(),
        };
        assert!(err.to_string().contains("server_rev=2-aa"));
    }

    #[test]
    fn not_found_carries_collection_and_id() {
        let err = Error::NotFound {
            collection: "users".into(),
            id: "u1".into(),
        };
        assert!(matches!(err, Error::NotFound { .. }));
    }
}

//! Destination document store.
//!
//! A sink accepts a batch of documents with unordered semantics: every
//! document is attempted independently and duplicate-key failures are
//! reported separately from other failures.

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use crate::checksum::sha256_hex;
use crate::db::DatabaseError;

pub mod memory;
pub mod sqlite;

pub use memory::MemorySink;
pub use sqlite::SqliteDocumentSink;

/// A document as handed to the sink.
pub type Document = serde_json::Map<String, Value>;

/// Why a single document was not inserted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InsertFailureKind {
    DuplicateKey,
    Other(String),
}

/// Per-document failure within a batch; `index` is the position in the batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InsertFailure {
    pub index: usize,
    pub kind: InsertFailureKind,
}

/// Outcome of an unordered bulk insert.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BulkInsertReport {
    pub inserted: usize,
    pub failures: Vec<InsertFailure>,
}

impl BulkInsertReport {
    pub fn duplicates(&self) -> usize {
        self.failures
            .iter()
            .filter(|f| f.kind == InsertFailureKind::DuplicateKey)
            .count()
    }

    /// The first non-duplicate failure, if any.
    pub fn first_hard_failure(&self) -> Option<&InsertFailure> {
        self.failures
            .iter()
            .find(|f| matches!(f.kind, InsertFailureKind::Other(_)))
    }
}

/// Whole-batch sink errors.
#[derive(Error, Debug)]
pub enum SinkError {
    #[error("Destination database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Destination unavailable: {0}")]
    Unavailable(String),

    #[error("Insert task failed: {0}")]
    Task(String),
}

/// Destination store for migrated records.
#[async_trait]
pub trait DocumentSink: Send + Sync {
    /// Inserts every document independently.
    async fn insert_unordered(
        &self,
        collection: &str,
        documents: Vec<Document>,
    ) -> Result<BulkInsertReport, SinkError>;

    /// Number of documents stored in `collection`.
    async fn count(&self, collection: &str) -> Result<u64, SinkError>;
}

/// A document cannot be keyed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum KeyError {
    #[error("Missing key field '{0}'")]
    MissingField(String),
}

impl From<KeyError> for InsertFailureKind {
    fn from(err: KeyError) -> Self {
        InsertFailureKind::Other(err.to_string())
    }
}

/// Identity of a document for duplicate detection.
///
/// With key fields, the values of those fields joined by `\u{1f}`; a missing,
/// null or blank key field is an error. Without key fields, the SHA-256 of
/// the document's JSON.
pub fn document_key(document: &Document, key_fields: &[String]) -> Result<String, KeyError> {
    if key_fields.is_empty() {
        let body = Value::Object(document.clone()).to_string();
        return Ok(sha256_hex(&body));
    }
    let parts = key_fields
        .iter()
        .map(|field| {
            let value = match document.get(field) {
                Some(Value::String(s)) => s.clone(),
                Some(Value::Null) | None => String::new(),
                Some(other) => other.to_string(),
            };
            if value.trim().is_empty() {
                return Err(KeyError::MissingField(field.clone()));
            }
            Ok(value)
        })
        .collect::<Result<Vec<_>, _>>()?;
    Ok(parts.join("\u{1f}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(value: Value) -> Document {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_key_from_fields() {
        let d = doc(json!({"id": "7", "region": "eu", "name": "Ada"}));
        assert_eq!(
            document_key(&d, &["id".into(), "region".into()]).unwrap(),
            "7\u{1f}eu"
        );
    }

    #[test]
    fn test_missing_or_blank_key_field_is_an_error() {
        let blank = doc(json!({"id": "  ", "name": "Ada"}));
        let null = doc(json!({"id": null, "name": "Grace"}));
        let absent = doc(json!({"name": "Linus"}));

        for d in [&blank, &null, &absent] {
            assert_eq!(
                document_key(d, &["id".into()]),
                Err(KeyError::MissingField("id".into()))
            );
        }
        let partial = doc(json!({"id": "1", "region": ""}));
        assert!(document_key(&partial, &["id".into(), "region".into()]).is_err());
    }

    #[test]
    fn test_key_from_content() {
        let a = doc(json!({"id": "1", "name": "Ada"}));
        let b = doc(json!({"id": "1", "name": "Ada"}));
        let c = doc(json!({"id": "2", "name": "Ada"}));
        let key = |d: &Document| document_key(d, &[]).unwrap();
        assert_eq!(key(&a), key(&b));
        assert_ne!(key(&a), key(&c));
        assert_eq!(key(&a).len(), 64);
    }

    #[test]
    fn test_report_classification() {
        let report = BulkInsertReport {
            inserted: 1,
            failures: vec![
                InsertFailure {
                    index: 1,
                    kind: InsertFailureKind::DuplicateKey,
                },
                InsertFailure {
                    index: 2,
                    kind: InsertFailureKind::Other("disk full".into()),
                },
            ],
        };
        assert_eq!(report.duplicates(), 1);
        assert_eq!(report.first_hard_failure().unwrap().index, 2);
    }
}

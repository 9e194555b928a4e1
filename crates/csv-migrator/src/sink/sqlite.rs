//! SQLite-backed document sink.

use std::path::Path;

use async_trait::async_trait;
use rusqlite::params;

use crate::db::{now_timestamp, Database, DatabaseError};

use super::{
    document_key, BulkInsertReport, Document, DocumentSink, InsertFailure, InsertFailureKind,
    SinkError,
};

/// Stores documents as JSON rows keyed by `(collection, doc_key)`.
#[derive(Clone)]
pub struct SqliteDocumentSink {
    db: Database,
    key_fields: Vec<String>,
}

impl SqliteDocumentSink {
    pub fn open(path: &Path, key_fields: Vec<String>) -> Result<Self, SinkError> {
        Ok(Self::new(Database::open(path)?, key_fields))
    }

    pub fn new(db: Database, key_fields: Vec<String>) -> Self {
        Self { db, key_fields }
    }

    fn insert_blocking(
        db: &Database,
        key_fields: &[String],
        collection: &str,
        documents: &[Document],
    ) -> Result<BulkInsertReport, DatabaseError> {
        let now = now_timestamp();
        db.with_tx(|tx| {
            let mut stmt = tx.prepare(
                "INSERT INTO documents (collection, doc_key, body, inserted_at) VALUES (?1, ?2, ?3, ?4)",
            )?;
            let mut report = BulkInsertReport::default();

            for (index, document) in documents.iter().enumerate() {
                let key = match document_key(document, key_fields) {
                    Ok(key) => key,
                    Err(e) => {
                        report.failures.push(InsertFailure {
                            index,
                            kind: e.into(),
                        });
                        continue;
                    }
                };
                let body = serde_json::to_string(document)?;
                match stmt.execute(params![collection, key, body, now]) {
                    Ok(_) => report.inserted += 1,
                    Err(e) => {
                        let e = DatabaseError::from(e);
                        let kind = if e.is_unique_violation() {
                            InsertFailureKind::DuplicateKey
                        } else {
                            InsertFailureKind::Other(e.to_string())
                        };
                        report.failures.push(InsertFailure { index, kind });
                    }
                }
            }
            Ok(report)
        })
    }
}

#[async_trait]
impl DocumentSink for SqliteDocumentSink {
    async fn insert_unordered(
        &self,
        collection: &str,
        documents: Vec<Document>,
    ) -> Result<BulkInsertReport, SinkError> {
        let db = self.db.clone();
        let key_fields = self.key_fields.clone();
        let collection = collection.to_string();

        tokio::task::spawn_blocking(move || {
            Self::insert_blocking(&db, &key_fields, &collection, &documents)
        })
        .await
        .map_err(|e| SinkError::Task(e.to_string()))?
        .map_err(SinkError::from)
    }

    async fn count(&self, collection: &str) -> Result<u64, SinkError> {
        let count = self.db.with_conn(|conn| {
            Ok(conn.query_row(
                "SELECT COUNT(*) FROM documents WHERE collection = ?1",
                params![collection],
                |r| r.get::<_, u64>(0),
            )?)
        })?;
        Ok(count)
    }
}

//! In-process sink for tests and dry runs, with failure injection.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use super::{
    document_key, BulkInsertReport, Document, DocumentSink, InsertFailure, InsertFailureKind,
    SinkError,
};

type RecordPredicate = Arc<dyn Fn(&Document) -> bool + Send + Sync>;

#[derive(Default)]
struct Faults {
    /// Documents matching this fail with a non-duplicate error.
    reject: Option<(RecordPredicate, String)>,
    /// Remaining batches that fail as a whole.
    unavailable_batches: usize,
    delay: Option<Duration>,
}

/// Keeps documents in memory, keyed like [`super::SqliteDocumentSink`].
#[derive(Clone, Default)]
pub struct MemorySink {
    key_fields: Vec<String>,
    collections: Arc<Mutex<HashMap<String, HashMap<String, Document>>>>,
    faults: Arc<Mutex<Faults>>,
    batches: Arc<AtomicUsize>,
}

impl MemorySink {
    pub fn new(key_fields: Vec<String>) -> Self {
        Self {
            key_fields,
            ..Default::default()
        }
    }

    /// Makes every document matching `predicate` fail with `message`.
    pub fn reject_where<F>(&self, predicate: F, message: &str)
    where
        F: Fn(&Document) -> bool + Send + Sync + 'static,
    {
        if let Ok(mut faults) = self.faults.lock() {
            faults.reject = Some((Arc::new(predicate), message.to_string()));
        }
    }

    /// Makes the next `batches` calls fail as a whole.
    pub fn fail_next_batches(&self, batches: usize) {
        if let Ok(mut faults) = self.faults.lock() {
            faults.unavailable_batches = batches;
        }
    }

    /// Delays every batch, to simulate a slow destination.
    pub fn set_delay(&self, delay: Option<Duration>) {
        if let Ok(mut faults) = self.faults.lock() {
            faults.delay = delay;
        }
    }

    /// Removes all injected faults.
    pub fn heal(&self) {
        if let Ok(mut faults) = self.faults.lock() {
            *faults = Faults::default();
        }
    }

    /// Number of `insert_unordered` calls so far.
    pub fn batch_count(&self) -> usize {
        self.batches.load(Ordering::SeqCst)
    }

    /// Keys stored in `collection`.
    pub fn keys(&self, collection: &str) -> HashSet<String> {
        self.collections
            .lock()
            .ok()
            .and_then(|c| c.get(collection).map(|docs| docs.keys().cloned().collect()))
            .unwrap_or_default()
    }

    /// Copies of the documents stored in `collection`, in no particular order.
    pub fn documents(&self, collection: &str) -> Vec<Document> {
        self.collections
            .lock()
            .ok()
            .and_then(|c| c.get(collection).map(|docs| docs.values().cloned().collect()))
            .unwrap_or_default()
    }

    /// Pre-populates a collection, as if an earlier run had inserted these documents.
    pub fn seed(&self, collection: &str, documents: Vec<Document>) {
        if let Ok(mut collections) = self.collections.lock() {
            let stored = collections.entry(collection.to_string()).or_default();
            for document in documents {
                if let Ok(key) = document_key(&document, &self.key_fields) {
                    stored.insert(key, document);
                }
            }
        }
    }
}

#[async_trait]
impl DocumentSink for MemorySink {
    async fn insert_unordered(
        &self,
        collection: &str,
        documents: Vec<Document>,
    ) -> Result<BulkInsertReport, SinkError> {
        self.batches.fetch_add(1, Ordering::SeqCst);

        let (delay, reject) = {
            let mut faults = self
                .faults
                .lock()
                .map_err(|_| SinkError::Unavailable("fault state poisoned".into()))?;
            if faults.unavailable_batches > 0 {
                faults.unavailable_batches -= 1;
                return Err(SinkError::Unavailable("injected outage".into()));
            }
            (faults.delay, faults.reject.clone())
        };

        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut collections = self
            .collections
            .lock()
            .map_err(|_| SinkError::Unavailable("collection state poisoned".into()))?;
        let stored = collections.entry(collection.to_string()).or_default();
        let mut report = BulkInsertReport::default();

        for (index, document) in documents.into_iter().enumerate() {
            if let Some((ref predicate, ref message)) = reject {
                if predicate(&document) {
                    report.failures.push(InsertFailure {
                        index,
                        kind: InsertFailureKind::Other(message.clone()),
                    });
                    continue;
                }
            }

            let key = match document_key(&document, &self.key_fields) {
                Ok(key) => key,
                Err(e) => {
                    report.failures.push(InsertFailure {
                        index,
                        kind: e.into(),
                    });
                    continue;
                }
            };
            if stored.contains_key(&key) {
                report.failures.push(InsertFailure {
                    index,
                    kind: InsertFailureKind::DuplicateKey,
                });
            } else {
                stored.insert(key, document);
                report.inserted += 1;
            }
        }
        Ok(report)
    }

    async fn count(&self, collection: &str) -> Result<u64, SinkError> {
        Ok(self.keys(collection).len() as u64)
    }
}

//! Test harness for isolated test execution.
//!
//! `TestHarness` owns a temp directory holding the job database, an input
//! directory for scheduled imports and a processed directory, and wires a
//! [`Migrator`] to a [`MemorySink`] so tests can inject destination faults.

#![allow(dead_code)]

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde_json::{Map, Value};
use tempfile::TempDir;

use csv_migrator::config::{Config, ImportConfig};
use csv_migrator::db::Database;
use csv_migrator::queue::{AuditAction, AuditEntry, AuditLog, Job, JobQueue, JobStore};
use csv_migrator::sink::MemorySink;
use csv_migrator::Migrator;

pub const COLLECTION: &str = "people";

pub struct TestHarness {
    temp_dir: TempDir,
    pub input_dir: PathBuf,
    pub processed_dir: PathBuf,
    pub sink: MemorySink,
    pub migrator: Migrator,
}

impl TestHarness {
    pub fn new() -> Self {
        Self::with_config(|_| {})
    }

    /// Harness whose config is adjusted by `customize` before wiring.
    pub fn with_config<F: FnOnce(&mut Config)>(customize: F) -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let base = temp_dir.path();
        let input_dir = base.join("incoming");
        let processed_dir = base.join("processed");
        std::fs::create_dir_all(&input_dir).expect("Failed to create input dir");

        let mut config = Config {
            database_path: Some(base.join("migrator.db")),
            chunk_size: 1000,
            max_concurrency: 2,
            poll_interval_ms: 20,
            progress_poll_interval_ms: 20,
            import: Some(ImportConfig {
                input_directory: input_dir.clone(),
                processed_directory: processed_dir.clone(),
                scan_interval_secs: 1,
            }),
            ..Config::default()
        };
        config.destination.collection = COLLECTION.to_string();
        config.destination.key_fields = vec!["id".to_string()];
        customize(&mut config);

        let db = Database::open(&base.join("migrator.db")).expect("Failed to open database");
        let sink = MemorySink::new(config.destination.key_fields.clone());
        let migrator = Migrator::with_sink(config, db, Arc::new(sink.clone()));

        Self {
            temp_dir,
            input_dir,
            processed_dir,
            sink,
            migrator,
        }
    }

    pub fn temp_path(&self) -> &Path {
        self.temp_dir.path()
    }

    pub fn queue(&self) -> &JobQueue {
        self.migrator.queue()
    }

    pub fn store(&self) -> &JobStore {
        self.migrator.queue().store()
    }

    pub fn audit(&self) -> &AuditLog {
        self.migrator.queue().audit()
    }

    pub fn lane(&self) -> String {
        self.migrator.config().lane.clone()
    }

    /// Writes a people CSV with `rows` data rows outside the input directory.
    pub fn write_csv(&self, filename: &str, rows: usize) -> PathBuf {
        let path = self.temp_path().join(filename);
        write_people_csv(&path, 0..rows);
        path
    }

    /// Submits `path` through the upload intake.
    pub fn submit(&self, path: &Path) -> Job {
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("upload.csv");
        self.migrator
            .intake()
            .submit(path, name)
            .expect("Failed to submit file")
    }

    /// Runs one dispatch cycle with a fresh processor.
    pub async fn run_once(&self) -> bool {
        let processor = self.migrator.processor();
        self.queue()
            .run_once(&self.lane(), &processor)
            .await
            .expect("Dispatch cycle failed")
    }

    /// Dispatches until the queue is idle. Returns the number of cycles.
    pub async fn drain(&self) -> usize {
        let mut cycles = 0;
        while self.run_once().await {
            cycles += 1;
        }
        cycles
    }

    pub fn job(&self, id: &str) -> Job {
        self.store().get(id).expect("Job not found")
    }

    pub fn audit_entries(&self, job_id: &str) -> Vec<AuditEntry> {
        self.audit().for_job(job_id).expect("Failed to read audit log")
    }

    pub fn audit_actions(&self, job_id: &str) -> Vec<AuditAction> {
        self.audit_entries(job_id).iter().map(|e| e.action).collect()
    }

    pub fn count_actions(&self, job_id: &str, action: AuditAction) -> usize {
        self.audit_actions(job_id)
            .into_iter()
            .filter(|a| *a == action)
            .count()
    }

    /// Documents shaped like the CSV rows with the given ids.
    pub fn people_documents(ids: std::ops::Range<usize>) -> Vec<Map<String, Value>> {
        ids.map(|i| {
            let mut doc = Map::new();
            doc.insert("id".into(), Value::String(i.to_string()));
            doc.insert("name".into(), Value::String(format!("person-{}", i)));
            doc
        })
        .collect()
    }
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}

/// Writes `id,name,email` rows for every id in `ids`.
pub fn write_people_csv(path: &Path, ids: std::ops::Range<usize>) {
    let mut file = std::fs::File::create(path).expect("Failed to create CSV");
    writeln!(file, "id,name,email").expect("Failed to write header");
    for i in ids {
        writeln!(file, "{},person-{},p{}@example.com", i, i, i).expect("Failed to write row");
    }
}

/// Numeric `id` of a migrated document.
pub fn doc_id(doc: &Map<String, Value>) -> Option<usize> {
    doc.get("id")?.as_str()?.parse().ok()
}

//! Periodic import of CSV files dropped into an input directory.
//!
//! Each tick scans the input directory. New files are moved into the
//! processed directory under a job-id prefixed name and enqueued; files
//! whose checksum is already known go to `<processed>/duplicates`. If the
//! enqueue fails the move is rolled back so the next tick sees the file again.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use serde_json::json;
use tokio::sync::broadcast;

use crate::checksum::checksum_file;
use crate::error::WorkerError;
use crate::queue::{AuditAction, JobQueue, NewJobPayload};

use super::archive::{ensure_directory, job_file_name, move_file, resolve_conflict, safe_filename};
use super::scanner::DirectoryScanner;

const DUPLICATES_DIR: &str = "duplicates";

/// What a single import pass did.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ImportSummary {
    pub scheduled: Vec<String>,
    pub duplicates: usize,
    pub errors: usize,
}

enum FileOutcome {
    Scheduled(String),
    Duplicate,
}

struct ImportTask {
    queue: JobQueue,
    lane: String,
    scanner: DirectoryScanner,
    processed_directory: PathBuf,
}

impl ImportTask {
    fn run(&self) -> Result<ImportSummary, WorkerError> {
        let audit = self.queue.audit();
        let files = match self.scanner.scan() {
            Ok(files) => files,
            Err(e) => {
                log::error!("Scheduled import scan failed: {}", e);
                audit.record_best_effort(
                    AuditAction::ScheduledSystemError,
                    None,
                    json!({
                        "directory": self.scanner.input_directory().to_string_lossy(),
                        "error": e.to_string(),
                    }),
                );
                return Err(e);
            }
        };

        let mut summary = ImportSummary::default();
        for path in files {
            match self.import_file(&path) {
                Ok(FileOutcome::Scheduled(job_id)) => summary.scheduled.push(job_id),
                Ok(FileOutcome::Duplicate) => summary.duplicates += 1,
                Err(e) => {
                    summary.errors += 1;
                    log::warn!("Failed to import {}: {}", path.display(), e);
                    audit.record_best_effort(
                        AuditAction::ScheduledError,
                        None,
                        json!({
                            "filename": file_name(&path),
                            "reason": "import_failed",
                            "error": e.to_string(),
                        }),
                    );
                }
            }
        }

        if !summary.scheduled.is_empty() || summary.duplicates > 0 {
            log::info!(
                "Scheduled import: {} enqueued, {} duplicates, {} errors",
                summary.scheduled.len(),
                summary.duplicates,
                summary.errors
            );
        }
        Ok(summary)
    }

    fn import_file(&self, path: &Path) -> Result<FileOutcome, WorkerError> {
        let filename = file_name(path);
        let checksum = checksum_file(path)?;

        let existing = self
            .queue
            .store()
            .find_by_checksum(&checksum)
            .map_err(|e| WorkerError::Queue(e.into()))?;
        if let Some(existing) = existing {
            let duplicates = self.processed_directory.join(DUPLICATES_DIR);
            ensure_directory(&duplicates)?;
            let target = resolve_conflict(&duplicates, &filename)?;
            move_file(path, &target)?;

            log::info!("Skipping {}: same content as job {}", filename, existing.id);
            self.queue.audit().record_best_effort(
                AuditAction::ScheduledError,
                None,
                json!({
                    "filename": filename,
                    "reason": "duplicate",
                    "existingJobId": existing.id,
                    "movedTo": target.to_string_lossy(),
                }),
            );
            return Ok(FileOutcome::Duplicate);
        }

        let job_id = uuid::Uuid::new_v4().to_string();
        ensure_directory(&self.processed_directory)?;
        let target =
            resolve_conflict(&self.processed_directory, &job_file_name(&job_id, &filename))?;
        move_file(path, &target)?;

        let payload = NewJobPayload {
            job_id: Some(job_id),
            filename: filename.clone(),
            file_path: target.clone(),
            checksum,
        };
        let job = match self.queue.add(&self.lane, payload) {
            Ok(job) => job,
            Err(e) => {
                if let Err(rollback) = move_file(&target, path) {
                    log::error!(
                        "Failed to move {} back after enqueue error: {}",
                        target.display(),
                        rollback
                    );
                }
                return Err(e.into());
            }
        };

        self.queue.audit().record_best_effort(
            AuditAction::Scheduled,
            Some(&job.id),
            json!({
                "filename": filename,
                "archivedTo": target.to_string_lossy(),
            }),
        );
        Ok(FileOutcome::Scheduled(job.id))
    }
}

fn file_name(path: &Path) -> String {
    safe_filename(&path.file_name().map(|n| n.to_string_lossy()).unwrap_or_default())
}

/// Runs the import pass on an interval, or when triggered.
pub struct ImportScheduler {
    task: Arc<ImportTask>,
    interval: Duration,
    shutdown: Arc<AtomicBool>,
}

impl ImportScheduler {
    pub fn new(
        queue: JobQueue,
        lane: impl Into<String>,
        input_directory: impl AsRef<Path>,
        processed_directory: impl AsRef<Path>,
        interval: Duration,
    ) -> Self {
        Self {
            task: Arc::new(ImportTask {
                queue,
                lane: lane.into(),
                scanner: DirectoryScanner::new(input_directory),
                processed_directory: processed_directory.as_ref().to_path_buf(),
            }),
            interval,
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Runs one import pass on the calling thread.
    pub fn scan_once(&self) -> Result<ImportSummary, WorkerError> {
        self.task.run()
    }

    /// Starts the import loop on a background thread. A message on
    /// `trigger_rx` runs a pass immediately.
    pub fn start(
        &self,
        mut trigger_rx: broadcast::Receiver<()>,
    ) -> Result<JoinHandle<()>, WorkerError> {
        let task = Arc::clone(&self.task);
        let shutdown = Arc::clone(&self.shutdown);
        let interval = self.interval;

        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| WorkerError::SpawnFailed(e.to_string()))?;

        std::thread::Builder::new()
            .name("import-scheduler".to_string())
            .spawn(move || {
                rt.block_on(async {
                    let mut interval_timer = tokio::time::interval(interval);

                    loop {
                        if shutdown.load(Ordering::Acquire) {
                            break;
                        }

                        tokio::select! {
                            _ = interval_timer.tick() => {},
                            Ok(()) = trigger_rx.recv() => {
                                log::info!("Manual import triggered");
                            },
                        }

                        if shutdown.load(Ordering::Acquire) {
                            break;
                        }

                        let task = Arc::clone(&task);
                        match tokio::task::spawn_blocking(move || task.run()).await {
                            Ok(_) => {}
                            Err(e) => log::error!("Import pass panicked: {}", e),
                        }
                    }
                    log::info!("Import scheduler stopped");
                });
            })
            .map_err(|e| WorkerError::SpawnFailed(e.to_string()))
    }

    /// Signals the scheduler to stop after the current pass.
    pub fn stop(&self) {
        self.shutdown.store(true, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::queue::{AuditLog, JobStatus, JobStore, QueueConfig};
    use tempfile::TempDir;

    fn queue() -> JobQueue {
        let db = Database::open_in_memory().unwrap();
        JobQueue::new(
            JobStore::new(db.clone()),
            AuditLog::new(db),
            QueueConfig::default(),
        )
    }

    fn scheduler(queue: &JobQueue, dir: &TempDir) -> ImportScheduler {
        let input = dir.path().join("incoming");
        std::fs::create_dir_all(&input).unwrap();
        ImportScheduler::new(
            queue.clone(),
            "csv-migration",
            &input,
            dir.path().join("processed"),
            Duration::from_millis(50),
        )
    }

    #[test]
    fn test_import_moves_and_enqueues() {
        let dir = TempDir::new().unwrap();
        let queue = queue();
        let scheduler = scheduler(&queue, &dir);
        let source = dir.path().join("incoming").join("people.csv");
        std::fs::write(&source, "id,name\n1,Ada\n").unwrap();

        let summary = scheduler.scan_once().unwrap();
        assert_eq!(summary.scheduled.len(), 1);
        assert!(!source.exists());

        let job = queue.store().get(&summary.scheduled[0]).unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.filename, "people.csv");
        let expected = dir
            .path()
            .join("processed")
            .join(format!("{}_people.csv", &job.id[..8]));
        assert_eq!(job.file_path, expected);
        assert!(expected.exists());

        let scheduled = queue.audit().recent(AuditAction::Scheduled, 10).unwrap();
        assert_eq!(scheduled.len(), 1);
        assert_eq!(scheduled[0].job_id.as_deref(), Some(job.id.as_str()));
    }

    #[test]
    fn test_duplicate_goes_to_duplicates_dir() {
        let dir = TempDir::new().unwrap();
        let queue = queue();
        let scheduler = scheduler(&queue, &dir);
        let incoming = dir.path().join("incoming");

        std::fs::write(incoming.join("a.csv"), "id\n1\n").unwrap();
        scheduler.scan_once().unwrap();
        std::fs::write(incoming.join("a-copy.csv"), "id\n1\n").unwrap();

        let summary = scheduler.scan_once().unwrap();
        assert!(summary.scheduled.is_empty());
        assert_eq!(summary.duplicates, 1);
        assert!(dir.path().join("processed/duplicates/a-copy.csv").exists());

        let errors = queue.audit().recent(AuditAction::ScheduledError, 10).unwrap();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].meta["reason"], "duplicate");
        assert_eq!(queue.store().list_active().unwrap().len(), 1);
    }

    #[test]
    fn test_missing_input_records_system_error() {
        let dir = TempDir::new().unwrap();
        let queue = queue();
        let scheduler = ImportScheduler::new(
            queue.clone(),
            "csv-migration",
            dir.path().join("missing"),
            dir.path().join("processed"),
            Duration::from_millis(50),
        );

        assert!(scheduler.scan_once().is_err());
        let entries = queue
            .audit()
            .recent(AuditAction::ScheduledSystemError, 10)
            .unwrap();
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn test_scheduler_shutdown() {
        let dir = TempDir::new().unwrap();
        let queue = queue();
        let scheduler = scheduler(&queue, &dir);
        std::fs::write(dir.path().join("incoming").join("x.csv"), "id\n1\n").unwrap();

        let (trigger_tx, trigger_rx) = broadcast::channel(16);
        let handle = scheduler.start(trigger_rx).unwrap();

        std::thread::sleep(Duration::from_millis(200));
        scheduler.stop();
        let _ = trigger_tx.send(());

        handle.join().expect("scheduler thread panicked");
        assert_eq!(queue.store().list_active().unwrap().len(), 1);
    }
}

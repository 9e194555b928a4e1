//! Lane-based job queue with a serial polling dispatcher.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use thiserror::Error;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::Instrument;

use crate::broadcast::{JobProgressBroadcaster, ProgressEvent};
use crate::db::DatabaseError;

use super::audit::{AuditAction, AuditLog};
use super::job::{Job, JobFailure, JobOutcome, JobStatus, JobUpdate, NewJob, NewJobPayload};
use super::store::{JobStore, StoreError};

/// Claim attempts per `get_next_job` before reporting idle.
const CLAIM_ATTEMPTS: usize = 3;

/// Errors from queue operations.
#[derive(Error, Debug)]
pub enum QueueError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Audit log write failed: {0}")]
    Audit(#[from] DatabaseError),

    #[error("Job {id} is {actual}, expected {expected}")]
    InvalidTransition {
        id: String,
        actual: JobStatus,
        expected: JobStatus,
    },
}

/// Processes one claimed job. Implemented by the chunked batch processor.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn process(&self, job: Job) -> Result<JobOutcome, JobFailure>;
}

/// Queue settings.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub max_retries: u32,
    pub poll_interval: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            poll_interval: Duration::from_millis(1000),
        }
    }
}

struct QueueInner {
    store: JobStore,
    audit: AuditLog,
    config: QueueConfig,
    progress: Option<JobProgressBroadcaster>,
    /// Diagnostics only.
    processing: Mutex<HashSet<String>>,
    polling: AtomicBool,
    stopping: AtomicBool,
    wake: Notify,
    task: Mutex<Option<JoinHandle<()>>>,
}

/// Job queue. Cloning shares the same queue.
#[derive(Clone)]
pub struct JobQueue {
    inner: Arc<QueueInner>,
}

impl JobQueue {
    pub fn new(store: JobStore, audit: AuditLog, config: QueueConfig) -> Self {
        Self::build(store, audit, config, None)
    }

    /// Creates a queue that emits terminal progress events on failure.
    pub fn with_progress(
        store: JobStore,
        audit: AuditLog,
        config: QueueConfig,
        progress: JobProgressBroadcaster,
    ) -> Self {
        Self::build(store, audit, config, Some(progress))
    }

    fn build(
        store: JobStore,
        audit: AuditLog,
        config: QueueConfig,
        progress: Option<JobProgressBroadcaster>,
    ) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                store,
                audit,
                config,
                progress,
                processing: Mutex::new(HashSet::new()),
                polling: AtomicBool::new(false),
                stopping: AtomicBool::new(false),
                wake: Notify::new(),
                task: Mutex::new(None),
            }),
        }
    }

    pub fn store(&self) -> &JobStore {
        &self.inner.store
    }

    pub fn audit(&self) -> &AuditLog {
        &self.inner.audit
    }

    /// Creates a PENDING job on `lane` and records an UPLOAD entry.
    pub fn add(&self, lane: &str, payload: NewJobPayload) -> Result<Job, QueueError> {
        let new_job = NewJob {
            lane: lane.to_string(),
            filename: payload.filename,
            file_path: payload.file_path,
            checksum: payload.checksum,
            max_retries: self.inner.config.max_retries,
        };
        let job = self.inner.store.create(new_job, payload.job_id)?;

        self.inner.audit.record_best_effort(
            AuditAction::Upload,
            Some(&job.id),
            json!({
                "filename": job.filename,
                "checksum": job.checksum,
                "lane": job.lane,
            }),
        );
        log::info!("Enqueued job {} ({}) on lane {}", job.id, job.filename, lane);
        Ok(job)
    }

    /// Claims the oldest eligible job on `lane`. `None` means idle.
    pub fn get_next_job(&self, lane: &str) -> Result<Option<Job>, QueueError> {
        for _ in 0..CLAIM_ATTEMPTS {
            let Some(candidate) = self.inner.store.next_eligible(lane)? else {
                return Ok(None);
            };

            let Some(job) = self.inner.store.claim(&candidate.id, candidate.version)? else {
                log::debug!("Lost claim race for job {}, retrying", candidate.id);
                continue;
            };

            self.inner.audit.record_best_effort(
                AuditAction::Start,
                Some(&job.id),
                json!({
                    "retryCount": job.retry_count,
                    "resumeFromChunk": job.last_processed_chunk + 1,
                }),
            );
            self.track(&job.id);
            return Ok(Some(job));
        }
        Ok(None)
    }

    /// Marks a RUNNING job COMPLETED and records a COMPLETE entry.
    pub fn complete_job(&self, id: &str, outcome: &JobOutcome) -> Result<Job, QueueError> {
        let result = self.complete_job_inner(id, outcome);
        self.untrack(id);
        result
    }

    fn complete_job_inner(&self, id: &str, outcome: &JobOutcome) -> Result<Job, QueueError> {
        let update = JobUpdate {
            status: Some(JobStatus::Completed),
            error: Some(None),
            fill_processed_rows: true,
            mark_completed: true,
            ..Default::default()
        };
        let took = self.inner.store.update_if(
            id,
            &[JobStatus::Running, JobStatus::Completed],
            update,
        )?;
        let job = self.inner.store.get(id)?;
        if !took {
            return Err(QueueError::InvalidTransition {
                id: id.to_string(),
                actual: job.status,
                expected: JobStatus::Running,
            });
        }

        self.inner.audit.record_best_effort(
            AuditAction::Complete,
            Some(id),
            serde_json::to_value(outcome).unwrap_or_else(|_| json!({})),
        );
        log::info!("Job {} completed ({} rows)", id, job.processed_rows);
        Ok(job)
    }

    /// Records a failed attempt.
    ///
    /// Retries remain: back to PENDING with `retry_count + 1` and a RETRY
    /// entry. Budget exhausted or fatal: FAILED with `retry_count =
    /// max_retries` and a FAILED entry. The entry is written before the
    /// status changes.
    pub fn fail_job(&self, id: &str, failure: &JobFailure) -> Result<Job, QueueError> {
        let result = self.fail_job_inner(id, failure);
        self.untrack(id);
        result
    }

    fn fail_job_inner(&self, id: &str, failure: &JobFailure) -> Result<Job, QueueError> {
        let job = self.inner.store.get(id)?;
        let next_retry = job.retry_count.saturating_add(1);

        let (update, status) = if failure.fatal || next_retry >= job.max_retries {
            // A FAILED job always has an exhausted budget.
            let retry_count = job.max_retries;
            self.inner.audit.record(
                AuditAction::Failed,
                Some(id),
                json!({
                    "error": failure.message,
                    "retryCount": retry_count,
                    "fatal": failure.fatal,
                }),
            )?;
            let update = JobUpdate {
                status: Some(JobStatus::Failed),
                retry_count: Some(retry_count),
                error: Some(Some(failure.message.clone())),
                ..Default::default()
            };
            (update, JobStatus::Failed)
        } else {
            self.inner.audit.record(
                AuditAction::Retry,
                Some(id),
                json!({
                    "error": failure.message,
                    "retryCount": next_retry,
                }),
            )?;
            let update = JobUpdate {
                status: Some(JobStatus::Pending),
                retry_count: Some(next_retry),
                error: Some(Some(failure.message.clone())),
                ..Default::default()
            };
            (update, JobStatus::Pending)
        };

        let took = self.inner.store.update_if(
            id,
            &[JobStatus::Running, JobStatus::Pending],
            update,
        )?;
        let job = self.inner.store.get(id)?;
        if !took {
            log::warn!(
                "Job {} changed to {} before its failure could be recorded",
                id,
                job.status
            );
            return Ok(job);
        }

        if status == JobStatus::Failed {
            log::error!("Job {} failed: {}", id, failure.message);
        } else {
            log::warn!(
                "Job {} attempt failed (retry {}/{}): {}",
                id,
                job.retry_count,
                job.max_retries,
                failure.message
            );
        }
        if let Some(ref progress) = self.inner.progress {
            progress.emit(ProgressEvent::failed(
                id,
                job.percentage(),
                status,
                &failure.message,
            ));
        }
        Ok(job)
    }

    /// PENDING -> PAUSED.
    pub fn pause(&self, id: &str) -> Result<Job, QueueError> {
        self.admin_transition(
            id,
            JobStatus::Pending,
            JobUpdate::status(JobStatus::Paused),
            AuditAction::Pause,
        )
    }

    /// PAUSED -> PENDING.
    pub fn resume(&self, id: &str) -> Result<Job, QueueError> {
        self.admin_transition(
            id,
            JobStatus::Paused,
            JobUpdate::status(JobStatus::Pending),
            AuditAction::Resume,
        )
    }

    /// FAILED -> PENDING with a fresh retry budget. Committed chunks stay committed.
    pub fn requeue(&self, id: &str) -> Result<Job, QueueError> {
        self.admin_transition(
            id,
            JobStatus::Failed,
            JobUpdate {
                status: Some(JobStatus::Pending),
                retry_count: Some(0),
                error: Some(None),
                ..Default::default()
            },
            AuditAction::Requeue,
        )
    }

    fn admin_transition(
        &self,
        id: &str,
        expected: JobStatus,
        update: JobUpdate,
        action: AuditAction,
    ) -> Result<Job, QueueError> {
        let before = self.inner.store.get(id)?;
        if before.status != expected {
            return Err(QueueError::InvalidTransition {
                id: id.to_string(),
                actual: before.status,
                expected,
            });
        }

        self.inner.audit.record(
            action,
            Some(id),
            json!({ "from": before.status, "retryCount": before.retry_count }),
        )?;
        if !self.inner.store.update_if(id, &[expected], update)? {
            let actual = self.inner.store.get(id)?.status;
            return Err(QueueError::InvalidTransition {
                id: id.to_string(),
                actual,
                expected,
            });
        }
        log::info!("Job {}: {}", id, action);
        Ok(self.inner.store.get(id)?)
    }

    /// Ids currently being processed by this queue. Diagnostics only.
    pub fn processing_jobs(&self) -> Vec<String> {
        match self.inner.processing.lock() {
            Ok(set) => set.iter().cloned().collect(),
            Err(poisoned) => poisoned.into_inner().iter().cloned().collect(),
        }
    }

    fn track(&self, id: &str) {
        if let Ok(mut set) = self.inner.processing.lock() {
            set.insert(id.to_string());
        }
    }

    fn untrack(&self, id: &str) {
        if let Ok(mut set) = self.inner.processing.lock() {
            set.remove(id);
        }
    }

    /// Runs one dispatch cycle: claim, process, then complete or fail.
    ///
    /// Returns whether a job was dispatched.
    pub async fn run_once(&self, lane: &str, handler: &dyn JobHandler) -> Result<bool, QueueError> {
        let Some(job) = self.get_next_job(lane)? else {
            return Ok(false);
        };
        let id = job.id.clone();
        let span = tracing::info_span!("job", job_id = %id, lane = %lane, attempt = job.retry_count + 1);

        match handler.process(job).instrument(span).await {
            Ok(outcome) => {
                self.complete_job(&id, &outcome)?;
            }
            Err(failure) => {
                self.fail_job(&id, &failure)?;
            }
        }
        Ok(true)
    }

    /// Starts the polling loop on the current tokio runtime.
    ///
    /// Returns `false` without doing anything if the queue is already polling.
    pub fn start_polling(&self, lane: &str, handler: Arc<dyn JobHandler>) -> bool {
        if self.inner.polling.swap(true, Ordering::AcqRel) {
            log::warn!("Queue is already polling, ignoring start request for lane {}", lane);
            return false;
        }
        self.inner.stopping.store(false, Ordering::Release);

        let queue = self.clone();
        let lane = lane.to_string();
        let handle = tokio::spawn(async move {
            queue.poll_loop(&lane, handler).await;
        });

        match self.inner.task.lock() {
            Ok(mut task) => *task = Some(handle),
            Err(poisoned) => *poisoned.into_inner() = Some(handle),
        }
        log::info!("Started polling (interval {:?})", self.inner.config.poll_interval);
        true
    }

    /// Stops the polling loop after the in-flight job, if any, finishes.
    pub async fn stop_polling(&self) {
        self.inner.stopping.store(true, Ordering::Release);
        self.inner.wake.notify_one();

        let handle = match self.inner.task.lock() {
            Ok(mut task) => task.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                log::error!("Polling task ended abnormally: {}", e);
            }
        }
        self.inner.polling.store(false, Ordering::Release);
        log::info!("Stopped polling");
    }

    pub fn is_polling(&self) -> bool {
        self.inner.polling.load(Ordering::Acquire)
    }

    async fn poll_loop(&self, lane: &str, handler: Arc<dyn JobHandler>) {
        loop {
            if self.inner.stopping.load(Ordering::Acquire) {
                break;
            }

            if let Err(e) = self.run_once(lane, handler.as_ref()).await {
                log::error!("Dispatch cycle on lane {} failed: {}", lane, e);
            }

            if self.inner.stopping.load(Ordering::Acquire) {
                break;
            }

            tokio::select! {
                _ = tokio::time::sleep(self.inner.config.poll_interval) => {},
                _ = self.inner.wake.notified() => {},
            }
        }
        log::debug!("Polling loop for lane {} exited", lane);
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use std::sync::atomic::AtomicUsize;

    use super::*;
    use crate::db::Database;

    const LANE: &str = "csv-migration";

    fn queue() -> JobQueue {
        let db = Database::open_in_memory().unwrap();
        JobQueue::new(
            JobStore::new(db.clone()),
            AuditLog::new(db),
            QueueConfig {
                max_retries: 3,
                poll_interval: Duration::from_millis(10),
            },
        )
    }

    fn payload(checksum: &str) -> NewJobPayload {
        NewJobPayload {
            job_id: None,
            filename: format!("{}.csv", checksum),
            file_path: PathBuf::from(format!("/data/{}.csv", checksum)),
            checksum: checksum.to_string(),
        }
    }

    fn actions(queue: &JobQueue, id: &str) -> Vec<AuditAction> {
        queue
            .audit()
            .for_job(id)
            .unwrap()
            .into_iter()
            .map(|e| e.action)
            .collect()
    }

    struct CountingHandler {
        calls: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl JobHandler for CountingHandler {
        async fn process(&self, _job: Job) -> Result<JobOutcome, JobFailure> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(JobFailure::retryable("boom"))
            } else {
                Ok(JobOutcome::default())
            }
        }
    }

    #[test]
    fn test_add_records_upload() {
        let queue = queue();
        let job = queue.add(LANE, payload("a")).unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(actions(&queue, &job.id), vec![AuditAction::Upload]);
    }

    #[test]
    fn test_get_next_job_fifo_and_idle() {
        let queue = queue();
        assert!(queue.get_next_job(LANE).unwrap().is_none());

        let first = queue.add(LANE, payload("a")).unwrap();
        let _second = queue.add(LANE, payload("b")).unwrap();

        let claimed = queue.get_next_job(LANE).unwrap().unwrap();
        assert_eq!(claimed.id, first.id);
        assert_eq!(claimed.status, JobStatus::Running);
        assert_eq!(queue.processing_jobs(), vec![first.id.clone()]);
        assert_eq!(
            actions(&queue, &first.id),
            vec![AuditAction::Upload, AuditAction::Start]
        );
    }

    #[test]
    fn test_fail_job_retries_then_fails() {
        let queue = queue();
        let job = queue.add(LANE, payload("a")).unwrap();
        let failure = JobFailure::retryable("insert failed");

        let mut statuses = Vec::new();
        for _ in 0..3 {
            let claimed = queue.get_next_job(LANE).unwrap().unwrap();
            statuses.push(claimed.status);
            statuses.push(queue.fail_job(&job.id, &failure).unwrap().status);
        }

        assert_eq!(
            statuses,
            vec![
                JobStatus::Running,
                JobStatus::Pending,
                JobStatus::Running,
                JobStatus::Pending,
                JobStatus::Running,
                JobStatus::Failed,
            ]
        );
        let failed = queue.store().get(&job.id).unwrap();
        assert_eq!(failed.retry_count, failed.max_retries);
        assert_eq!(failed.error.as_deref(), Some("insert failed"));
        assert!(queue.get_next_job(LANE).unwrap().is_none());
        assert!(queue.processing_jobs().is_empty());

        let log = actions(&queue, &job.id);
        assert_eq!(log.iter().filter(|a| **a == AuditAction::Retry).count(), 2);
        assert_eq!(log.last(), Some(&AuditAction::Failed));
    }

    #[test]
    fn test_fatal_failure_fails_on_first_attempt() {
        let queue = queue();
        let job = queue.add(LANE, payload("a")).unwrap();
        queue.get_next_job(LANE).unwrap().unwrap();

        let failed = queue
            .fail_job(&job.id, &JobFailure::fatal("source file missing"))
            .unwrap();
        assert_eq!(failed.status, JobStatus::Failed);
        assert_eq!(failed.retry_count, failed.max_retries);

        let log = actions(&queue, &job.id);
        assert!(!log.contains(&AuditAction::Retry));
        assert_eq!(log.last(), Some(&AuditAction::Failed));
    }

    #[test]
    fn test_complete_job_clears_error() {
        let queue = queue();
        let job = queue.add(LANE, payload("a")).unwrap();
        queue.get_next_job(LANE).unwrap();
        queue
            .fail_job(&job.id, &JobFailure::retryable("transient"))
            .unwrap();
        queue.get_next_job(LANE).unwrap();

        let done = queue.complete_job(&job.id, &JobOutcome::default()).unwrap();
        assert_eq!(done.status, JobStatus::Completed);
        assert!(done.error.is_none());
        assert!(done.completed_at.is_some());
        assert!(queue.processing_jobs().is_empty());
    }

    #[test]
    fn test_admin_transitions() {
        let queue = queue();
        let job = queue.add(LANE, payload("a")).unwrap();

        assert_eq!(queue.pause(&job.id).unwrap().status, JobStatus::Paused);
        assert!(queue.get_next_job(LANE).unwrap().is_none());
        assert!(matches!(
            queue.pause(&job.id),
            Err(QueueError::InvalidTransition { .. })
        ));
        assert_eq!(queue.resume(&job.id).unwrap().status, JobStatus::Pending);

        assert!(matches!(
            queue.requeue(&job.id),
            Err(QueueError::InvalidTransition { actual: JobStatus::Pending, .. })
        ));
        queue.get_next_job(LANE).unwrap();
        queue.fail_job(&job.id, &JobFailure::fatal("gone")).unwrap();

        let requeued = queue.requeue(&job.id).unwrap();
        assert_eq!(requeued.status, JobStatus::Pending);
        assert_eq!(requeued.retry_count, 0);
        assert!(requeued.error.is_none());
        assert!(actions(&queue, &job.id).contains(&AuditAction::Requeue));
    }

    #[tokio::test]
    async fn test_run_once_dispatches_serially() {
        let queue = queue();
        queue.add(LANE, payload("a")).unwrap();
        let handler = CountingHandler {
            calls: AtomicUsize::new(0),
            fail: false,
        };

        assert!(queue.run_once(LANE, &handler).await.unwrap());
        assert!(!queue.run_once(LANE, &handler).await.unwrap());
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
        assert_eq!(queue.store().count_by_status(JobStatus::Completed).unwrap(), 1);
    }

    #[tokio::test]
    async fn test_polling_start_twice_and_stop() {
        let queue = queue();
        let job = queue.add(LANE, payload("a")).unwrap();
        let handler = Arc::new(CountingHandler {
            calls: AtomicUsize::new(0),
            fail: true,
        });

        assert!(queue.start_polling(LANE, handler.clone()));
        assert!(!queue.start_polling(LANE, handler.clone()));

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while queue.store().get(&job.id).unwrap().status != JobStatus::Failed {
            assert!(tokio::time::Instant::now() < deadline, "job never failed");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        queue.stop_polling().await;
        assert!(!queue.is_polling());
        assert_eq!(handler.calls.load(Ordering::SeqCst), 3);
    }
}

//! Persistent job store backed by rusqlite.
//!
//! Every state change goes through a conditional update: callers name the
//! statuses they expect and learn from the return value whether the update
//! took effect. A mismatch is never an error.

use thiserror::Error;

use crate::db::job_repo::{self, JobFilter, JobRow};
use crate::db::{now_timestamp, Database, DatabaseError};

use super::job::{ChunkCommit, ChunkOutcome, Job, JobStatus, JobUpdate, NewJob};

/// Errors from the job store.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("A job with checksum {checksum} already exists")]
    DuplicateChecksum { checksum: String },

    #[error("Job not found: {0}")]
    NotFound(String),

    #[error(transparent)]
    Database(#[from] DatabaseError),
}

/// Thin typed layer over [`job_repo`]. Cloning shares the same database.
#[derive(Clone)]
pub struct JobStore {
    db: Database,
}

impl JobStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Creates a PENDING job. `id` is generated when not supplied.
    pub fn create(&self, new_job: NewJob, id: Option<String>) -> Result<Job, StoreError> {
        let now = now_timestamp();
        let row = JobRow {
            id: id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            lane: new_job.lane,
            filename: new_job.filename,
            file_path: new_job.file_path.to_string_lossy().into_owned(),
            checksum: new_job.checksum,
            status: JobStatus::Pending.as_str().to_string(),
            total_rows: None,
            processed_rows: 0,
            total_chunks: None,
            processed_chunks: 0,
            last_processed_chunk: -1,
            retry_count: 0,
            max_retries: i64::from(new_job.max_retries),
            error: None,
            created_at: now.clone(),
            updated_at: now,
            started_at: None,
            completed_at: None,
            version: 0,
        };

        match job_repo::insert(&self.db, &row) {
            Ok(()) => Ok(Job::try_from(row)?),
            Err(e) if e.is_unique_violation() => {
                // The id is random, so a collision here is the checksum index.
                Err(StoreError::DuplicateChecksum {
                    checksum: row.checksum,
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn find_by_id(&self, id: &str) -> Result<Option<Job>, StoreError> {
        job_repo::find_by_id(&self.db, id)?
            .map(Job::try_from)
            .transpose()
            .map_err(Into::into)
    }

    /// Like [`Self::find_by_id`] but a missing job is an error.
    pub fn get(&self, id: &str) -> Result<Job, StoreError> {
        self.find_by_id(id)?
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    pub fn find_by_checksum(&self, checksum: &str) -> Result<Option<Job>, StoreError> {
        job_repo::find_by_checksum(&self.db, checksum)?
            .map(Job::try_from)
            .transpose()
            .map_err(Into::into)
    }

    /// Applies `update` only if the job's current status is in `expected`.
    pub fn update_if(
        &self,
        id: &str,
        expected: &[JobStatus],
        update: JobUpdate,
    ) -> Result<bool, StoreError> {
        let expected: Vec<&str> = expected.iter().map(JobStatus::as_str).collect();
        Ok(job_repo::update_if_status(
            &self.db,
            id,
            &expected,
            &update.into_patch(),
        )?)
    }

    /// Claims a job read at `expected_version`. Returns the claimed job, or
    /// `None` if someone else changed it first.
    pub fn claim(&self, id: &str, expected_version: i64) -> Result<Option<Job>, StoreError> {
        if !job_repo::claim(&self.db, id, expected_version)? {
            return Ok(None);
        }
        self.find_by_id(id)
    }

    /// Oldest claimable job on the lane.
    pub fn next_eligible(&self, lane: &str) -> Result<Option<Job>, StoreError> {
        job_repo::next_eligible(&self.db, lane)?
            .map(Job::try_from)
            .transpose()
            .map_err(Into::into)
    }

    /// Persists row and chunk totals while the job is RUNNING.
    pub fn set_totals(
        &self,
        id: &str,
        total_rows: u64,
        total_chunks: Option<u64>,
    ) -> Result<bool, StoreError> {
        self.update_if(
            id,
            &[JobStatus::Pending, JobStatus::Running],
            JobUpdate {
                status: Some(JobStatus::Running),
                total_rows: Some(total_rows),
                total_chunks,
                ..Default::default()
            },
        )
    }

    pub fn commit_chunk(
        &self,
        id: &str,
        chunk_index: u64,
        row_count: u64,
        outcome: ChunkOutcome,
    ) -> Result<ChunkCommit, StoreError> {
        let row = job_repo::commit_chunk(
            &self.db,
            id,
            chunk_index as i64,
            row_count as i64,
            outcome.as_str(),
        )?;
        Ok(row.into())
    }

    pub fn is_chunk_committed(&self, id: &str, chunk_index: u64) -> Result<bool, StoreError> {
        Ok(job_repo::is_chunk_committed(
            &self.db,
            id,
            chunk_index as i64,
        )?)
    }

    /// Committed chunk indices greater than `watermark`.
    pub fn committed_chunks_above(
        &self,
        id: &str,
        watermark: i64,
    ) -> Result<Vec<u64>, StoreError> {
        Ok(job_repo::committed_chunks_above(&self.db, id, watermark)?
            .into_iter()
            .filter_map(|i| u64::try_from(i).ok())
            .collect())
    }

    /// RUNNING -> COMPLETED with `processed_rows = total_rows`.
    pub fn finalize_rows(&self, id: &str) -> Result<bool, StoreError> {
        self.update_if(
            id,
            &[JobStatus::Running],
            JobUpdate {
                status: Some(JobStatus::Completed),
                error: Some(None),
                fill_processed_rows: true,
                mark_completed: true,
                ..Default::default()
            },
        )
    }

    /// Jobs matching the filter, newest first, plus the unpaged total.
    pub fn list(&self, filter: &JobFilter) -> Result<(Vec<Job>, u64), StoreError> {
        let (rows, total) = job_repo::query(&self.db, filter)?;
        let jobs = rows
            .into_iter()
            .map(Job::try_from)
            .collect::<Result<Vec<_>, _>>()?;
        Ok((jobs, total))
    }

    pub fn count_by_status(&self, status: JobStatus) -> Result<u64, StoreError> {
        Ok(job_repo::count_by_status(&self.db, status.as_str())?)
    }

    /// Jobs that are not COMPLETED or FAILED, oldest first.
    pub fn list_active(&self) -> Result<Vec<Job>, StoreError> {
        let statuses = [
            JobStatus::Pending.as_str(),
            JobStatus::Running.as_str(),
            JobStatus::Paused.as_str(),
        ];
        job_repo::list_by_statuses(&self.db, &statuses)?
            .into_iter()
            .map(Job::try_from)
            .collect::<Result<Vec<_>, _>>()
            .map_err(Into::into)
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;

    fn store() -> JobStore {
        JobStore::new(Database::open_in_memory().unwrap())
    }

    fn new_job(checksum: &str) -> NewJob {
        NewJob {
            lane: "csv-migration".to_string(),
            filename: "people.csv".to_string(),
            file_path: PathBuf::from("/data/people.csv"),
            checksum: checksum.to_string(),
            max_retries: 3,
        }
    }

    #[test]
    fn test_create_defaults() {
        let store = store();
        let job = store.create(new_job("abc"), None).unwrap();

        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.last_processed_chunk, -1);
        assert_eq!(job.retry_count, 0);
        assert!(job.started_at.is_none());
        assert!(uuid::Uuid::parse_str(&job.id).is_ok());
        assert_eq!(store.get(&job.id).unwrap(), job);
    }

    #[test]
    fn test_duplicate_checksum_rejected() {
        let store = store();
        store.create(new_job("abc123"), None).unwrap();

        let err = store.create(new_job("abc123"), None).unwrap_err();
        assert!(matches!(err, StoreError::DuplicateChecksum { ref checksum } if checksum == "abc123"));
        let (_, total) = store.list(&JobFilter::default()).unwrap();
        assert_eq!(total, 1);
    }

    #[test]
    fn test_update_if_reports_mismatch() {
        let store = store();
        let job = store.create(new_job("a"), None).unwrap();

        let took = store
            .update_if(&job.id, &[JobStatus::Running], JobUpdate::status(JobStatus::Completed))
            .unwrap();
        assert!(!took);
        assert_eq!(store.get(&job.id).unwrap().status, JobStatus::Pending);
    }

    #[test]
    fn test_claim_and_reclaim_running() {
        let store = store();
        let job = store.create(new_job("a"), None).unwrap();

        let claimed = store.claim(&job.id, job.version).unwrap().unwrap();
        assert_eq!(claimed.status, JobStatus::Running);
        let started = claimed.started_at;
        assert!(started.is_some());

        // A crashed worker leaves the job RUNNING; it is still eligible.
        let next = store.next_eligible("csv-migration").unwrap().unwrap();
        assert_eq!(next.id, job.id);
        let reclaimed = store.claim(&next.id, next.version).unwrap().unwrap();
        assert_eq!(reclaimed.started_at, started);

        assert!(store.claim(&job.id, job.version).unwrap().is_none());
    }

    #[test]
    fn test_finalize_fills_rows() {
        let store = store();
        let job = store.create(new_job("a"), None).unwrap();
        store.claim(&job.id, job.version).unwrap();
        store.set_totals(&job.id, 10, Some(1)).unwrap();
        store
            .commit_chunk(&job.id, 0, 7, ChunkOutcome::Inserted)
            .unwrap();

        assert!(store.finalize_rows(&job.id).unwrap());
        let done = store.get(&job.id).unwrap();
        assert_eq!(done.status, JobStatus::Completed);
        assert_eq!(done.processed_rows, 10);
        assert!(done.completed_at.is_some());

        // Already completed: no second transition.
        assert!(!store.finalize_rows(&job.id).unwrap());
    }

    #[test]
    fn test_list_active_excludes_terminal() {
        let store = store();
        let a = store.create(new_job("a"), None).unwrap();
        let b = store.create(new_job("b"), None).unwrap();
        store
            .update_if(&b.id, &[JobStatus::Pending], JobUpdate::status(JobStatus::Failed))
            .unwrap();

        let active = store.list_active().unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, a.id);
        assert_eq!(store.count_by_status(JobStatus::Failed).unwrap(), 1);
    }
}

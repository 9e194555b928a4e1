//! Job domain types.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::db::job_repo::{ChunkCommitRow, JobPatch, JobRow};
use crate::db::DatabaseError;

/// Lifecycle state of a migration job.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Paused,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "PENDING",
            JobStatus::Running => "RUNNING",
            JobStatus::Completed => "COMPLETED",
            JobStatus::Failed => "FAILED",
            JobStatus::Paused => "PAUSED",
        }
    }

    /// COMPLETED and FAILED never change without administrative action.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobStatus {
    type Err = DatabaseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(JobStatus::Pending),
            "RUNNING" => Ok(JobStatus::Running),
            "COMPLETED" => Ok(JobStatus::Completed),
            "FAILED" => Ok(JobStatus::Failed),
            "PAUSED" => Ok(JobStatus::Paused),
            other => Err(DatabaseError::InvalidValue {
                column: "status",
                value: other.to_string(),
            }),
        }
    }
}

/// A persisted migration job.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: String,
    pub lane: String,
    pub filename: String,
    pub file_path: PathBuf,
    pub checksum: String,
    pub status: JobStatus,
    pub total_rows: Option<u64>,
    pub processed_rows: u64,
    pub total_chunks: Option<u64>,
    pub processed_chunks: u64,
    /// Highest contiguous committed chunk index, `-1` when none.
    pub last_processed_chunk: i64,
    pub retry_count: u32,
    pub max_retries: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    pub version: i64,
}

impl Job {
    /// Progress derived from the durable counters. A completed job is at 100
    /// even when the file had no rows.
    pub fn percentage(&self) -> u8 {
        if self.status == JobStatus::Completed {
            return 100;
        }
        percentage(self.processed_rows, self.total_rows.unwrap_or(0))
    }
}

impl TryFrom<JobRow> for Job {
    type Error = DatabaseError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        Ok(Self {
            status: row.status.parse()?,
            created_at: parse_timestamp("created_at", &row.created_at)?,
            updated_at: parse_timestamp("updated_at", &row.updated_at)?,
            started_at: row
                .started_at
                .as_deref()
                .map(|s| parse_timestamp("started_at", s))
                .transpose()?,
            completed_at: row
                .completed_at
                .as_deref()
                .map(|s| parse_timestamp("completed_at", s))
                .transpose()?,
            total_rows: row.total_rows.map(to_u64),
            processed_rows: to_u64(row.processed_rows),
            total_chunks: row.total_chunks.map(to_u64),
            processed_chunks: to_u64(row.processed_chunks),
            retry_count: row.retry_count.clamp(0, u32::MAX as i64) as u32,
            max_retries: row.max_retries.clamp(0, u32::MAX as i64) as u32,
            last_processed_chunk: row.last_processed_chunk,
            file_path: PathBuf::from(row.file_path),
            id: row.id,
            lane: row.lane,
            filename: row.filename,
            checksum: row.checksum,
            error: row.error,
            version: row.version,
        })
    }
}

fn to_u64(value: i64) -> u64 {
    value.max(0) as u64
}

fn parse_timestamp(column: &'static str, value: &str) -> Result<DateTime<Utc>, DatabaseError> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| DatabaseError::InvalidValue {
            column,
            value: value.to_string(),
        })
}

/// `min(100, round(100 * processed / total))`, and 0 when `total` is 0.
pub fn percentage(processed: u64, total: u64) -> u8 {
    if total == 0 {
        return 0;
    }
    let pct = ((processed as f64 * 100.0) / total as f64).round();
    pct.clamp(0.0, 100.0) as u8
}

/// Fields for a job about to be created.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub lane: String,
    pub filename: String,
    pub file_path: PathBuf,
    pub checksum: String,
    pub max_retries: u32,
}

/// What producers hand to [`crate::queue::JobQueue::add`].
#[derive(Debug, Clone)]
pub struct NewJobPayload {
    /// Pre-generated id, so producers can name archived files after the job.
    pub job_id: Option<String>,
    pub filename: String,
    pub file_path: PathBuf,
    pub checksum: String,
}

/// Changes applied by a conditional update. `None` leaves a field as is.
#[derive(Debug, Default, Clone)]
pub struct JobUpdate {
    pub status: Option<JobStatus>,
    pub total_rows: Option<u64>,
    pub total_chunks: Option<u64>,
    pub retry_count: Option<u32>,
    pub error: Option<Option<String>>,
    pub fill_processed_rows: bool,
    pub mark_completed: bool,
}

impl JobUpdate {
    pub fn status(status: JobStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub(crate) fn into_patch(self) -> JobPatch {
        JobPatch {
            status: self.status.map(|s| s.as_str().to_string()),
            total_rows: self.total_rows.map(|v| v as i64),
            total_chunks: self.total_chunks.map(|v| v as i64),
            retry_count: self.retry_count.map(i64::from),
            error: self.error,
            fill_processed_rows: self.fill_processed_rows,
            mark_completed: self.mark_completed,
        }
    }
}

/// How a chunk came to be committed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChunkOutcome {
    /// At least one record was newly inserted.
    Inserted,
    /// Every record was a duplicate key.
    AllDuplicate,
    /// Already applied by an earlier attempt; counted, not re-inserted.
    Resumed,
}

impl ChunkOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChunkOutcome::Inserted => "INSERTED",
            ChunkOutcome::AllDuplicate => "ALL_DUPLICATE",
            ChunkOutcome::Resumed => "RESUMED",
        }
    }
}

/// Counters after a chunk commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkCommit {
    pub newly_committed: bool,
    pub processed_rows: u64,
    pub processed_chunks: u64,
    pub last_processed_chunk: i64,
    pub total_rows: Option<u64>,
}

impl ChunkCommit {
    pub fn percentage(&self) -> u8 {
        percentage(self.processed_rows, self.total_rows.unwrap_or(0))
    }
}

impl From<ChunkCommitRow> for ChunkCommit {
    fn from(row: ChunkCommitRow) -> Self {
        Self {
            newly_committed: row.newly_committed,
            processed_rows: to_u64(row.processed_rows),
            processed_chunks: to_u64(row.processed_chunks),
            last_processed_chunk: row.last_processed_chunk,
            total_rows: row.total_rows.map(to_u64),
        }
    }
}

/// Result a handler reports for a successfully processed job.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobOutcome {
    pub total_rows: u64,
    pub inserted_rows: u64,
    pub duplicate_rows: u64,
    pub dropped_rows: u64,
    pub chunks: u64,
    pub skipped_chunks: u64,
}

/// Why a handler gave up on a job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobFailure {
    pub message: String,
    /// Fatal failures go straight to FAILED without another attempt.
    pub fatal: bool,
}

impl JobFailure {
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            fatal: false,
        }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            fatal: true,
        }
    }
}

impl std::fmt::Display for JobFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_percentage_bounds() {
        assert_eq!(percentage(0, 0), 0);
        assert_eq!(percentage(10, 0), 0);
        assert_eq!(percentage(0, 2500), 0);
        assert_eq!(percentage(1000, 2500), 40);
        assert_eq!(percentage(2500, 2500), 100);
        assert_eq!(percentage(3000, 2500), 100);
        assert_eq!(percentage(1, 3), 33);
        assert_eq!(percentage(2, 3), 67);
    }

    #[test]
    fn test_status_round_trip_strings() {
        for status in [
            JobStatus::Pending,
            JobStatus::Running,
            JobStatus::Completed,
            JobStatus::Failed,
            JobStatus::Paused,
        ] {
            assert_eq!(status.as_str().parse::<JobStatus>().unwrap(), status);
        }
        assert!("DONE".parse::<JobStatus>().is_err());
    }

    #[test]
    fn test_status_serializes_upper_case() {
        let json = serde_json::to_string(&JobStatus::Running).unwrap();
        assert_eq!(json, "\"RUNNING\"");
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(!JobStatus::Paused.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
    }

    #[test]
    fn test_job_from_row_rejects_bad_timestamp() {
        let row = JobRow {
            id: "j".into(),
            lane: "l".into(),
            filename: "f.csv".into(),
            file_path: "/tmp/f.csv".into(),
            checksum: "c".into(),
            status: "PENDING".into(),
            total_rows: None,
            processed_rows: 0,
            total_chunks: None,
            processed_chunks: 0,
            last_processed_chunk: -1,
            retry_count: 0,
            max_retries: 3,
            error: None,
            created_at: "yesterday".into(),
            updated_at: "2026-01-01T00:00:00.000000Z".into(),
            started_at: None,
            completed_at: None,
            version: 0,
        };
        assert!(Job::try_from(row).is_err());
    }
}

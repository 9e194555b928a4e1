//! Job repository: SQL operations for the `jobs` and `chunk_commits` tables.
//!
//! Status values are stored as the upper-case strings used by
//! [`crate::queue::JobStatus`]; this layer treats them as opaque text.

use rusqlite::{params, OptionalExtension, Row};

use super::{now_timestamp, Database, DatabaseError};

/// A raw job row from the database.
#[derive(Debug, Clone)]
pub struct JobRow {
    pub id: String,
    pub lane: String,
    pub filename: String,
    pub file_path: String,
    pub checksum: String,
    pub status: String,
    pub total_rows: Option<i64>,
    pub processed_rows: i64,
    pub total_chunks: Option<i64>,
    pub processed_chunks: i64,
    pub last_processed_chunk: i64,
    pub retry_count: i64,
    pub max_retries: i64,
    pub error: Option<String>,
    pub created_at: String,
    pub updated_at: String,
    pub started_at: Option<String>,
    pub completed_at: Option<String>,
    pub version: i64,
}

impl JobRow {
    fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            id: row.get("id")?,
            lane: row.get("lane")?,
            filename: row.get("filename")?,
            file_path: row.get("file_path")?,
            checksum: row.get("checksum")?,
            status: row.get("status")?,
            total_rows: row.get("total_rows")?,
            processed_rows: row.get("processed_rows")?,
            total_chunks: row.get("total_chunks")?,
            processed_chunks: row.get("processed_chunks")?,
            last_processed_chunk: row.get("last_processed_chunk")?,
            retry_count: row.get("retry_count")?,
            max_retries: row.get("max_retries")?,
            error: row.get("error")?,
            created_at: row.get("created_at")?,
            updated_at: row.get("updated_at")?,
            started_at: row.get("started_at")?,
            completed_at: row.get("completed_at")?,
            version: row.get("version")?,
        })
    }
}

/// Field changes applied by [`update_if_status`]. `None` leaves a column untouched.
#[derive(Debug, Default, Clone)]
pub struct JobPatch {
    pub status: Option<String>,
    pub total_rows: Option<i64>,
    pub total_chunks: Option<i64>,
    pub retry_count: Option<i64>,
    /// `Some(None)` clears the error column.
    pub error: Option<Option<String>>,
    /// Sets `processed_rows = total_rows`.
    pub fill_processed_rows: bool,
    /// Sets `completed_at` to now unless it is already set.
    pub mark_completed: bool,
}

/// Query filter parameters for job listing.
#[derive(Debug, Default, Clone)]
pub struct JobFilter {
    pub lane: Option<String>,
    pub status: Option<String>,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
}

/// State of the chunk counters after [`commit_chunk`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkCommitRow {
    /// False when the chunk had already been committed earlier.
    pub newly_committed: bool,
    pub processed_rows: i64,
    pub processed_chunks: i64,
    pub last_processed_chunk: i64,
    pub total_rows: Option<i64>,
}

/// Inserts a new job row.
pub fn insert(db: &Database, job: &JobRow) -> Result<(), DatabaseError> {
    db.with_conn(|conn| {
        conn.execute(
            "INSERT INTO jobs (id, lane, filename, file_path, checksum, status, total_rows,
             processed_rows, total_chunks, processed_chunks, last_processed_chunk, retry_count,
             max_retries, error, created_at, updated_at, started_at, completed_at, version)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19)",
            params![
                job.id,
                job.lane,
                job.filename,
                job.file_path,
                job.checksum,
                job.status,
                job.total_rows,
                job.processed_rows,
                job.total_chunks,
                job.processed_chunks,
                job.last_processed_chunk,
                job.retry_count,
                job.max_retries,
                job.error,
                job.created_at,
                job.updated_at,
                job.started_at,
                job.completed_at,
                job.version,
            ],
        )?;
        Ok(())
    })
}

/// Finds a job by its ID.
pub fn find_by_id(db: &Database, id: &str) -> Result<Option<JobRow>, DatabaseError> {
    db.with_conn(|conn| {
        Ok(conn
            .query_row("SELECT * FROM jobs WHERE id = ?1", params![id], JobRow::from_row)
            .optional()?)
    })
}

/// Finds the job that owns a content checksum.
pub fn find_by_checksum(db: &Database, checksum: &str) -> Result<Option<JobRow>, DatabaseError> {
    db.with_conn(|conn| {
        Ok(conn
            .query_row(
                "SELECT * FROM jobs WHERE checksum = ?1",
                params![checksum],
                JobRow::from_row,
            )
            .optional()?)
    })
}

/// Oldest job on `lane` that may be claimed: status PENDING or RUNNING and
/// retry budget not exhausted. Ties on `created_at` fall back to insertion order.
pub fn next_eligible(db: &Database, lane: &str) -> Result<Option<JobRow>, DatabaseError> {
    db.with_conn(|conn| {
        Ok(conn
            .query_row(
                "SELECT * FROM jobs
                 WHERE lane = ?1 AND status IN ('PENDING', 'RUNNING') AND retry_count < max_retries
                 ORDER BY created_at ASC, rowid ASC
                 LIMIT 1",
                params![lane],
                JobRow::from_row,
            )
            .optional()?)
    })
}

/// Applies `patch` only if the job's status is one of `expected`.
///
/// Returns whether a row was updated; a status mismatch is not an error.
pub fn update_if_status(
    db: &Database,
    id: &str,
    expected: &[&str],
    patch: &JobPatch,
) -> Result<bool, DatabaseError> {
    if expected.is_empty() {
        return Ok(false);
    }

    let now = now_timestamp();
    let mut sets: Vec<String> = vec!["updated_at = ?1".to_string()];
    let mut values: Vec<Box<dyn rusqlite::types::ToSql>> = vec![Box::new(now.clone())];

    let mut push = |column: &str, value: Box<dyn rusqlite::types::ToSql>| {
        values.push(value);
        sets.push(format!("{} = ?{}", column, values.len()));
    };

    if let Some(ref status) = patch.status {
        push("status", Box::new(status.clone()));
    }
    if let Some(total_rows) = patch.total_rows {
        push("total_rows", Box::new(total_rows));
    }
    if let Some(total_chunks) = patch.total_chunks {
        push("total_chunks", Box::new(total_chunks));
    }
    if let Some(retry_count) = patch.retry_count {
        push("retry_count", Box::new(retry_count));
    }
    if let Some(ref error) = patch.error {
        push("error", Box::new(error.clone()));
    }
    if patch.mark_completed {
        sets.push("completed_at = COALESCE(completed_at, ?1)".to_string());
    }

    // Keep processed_rows <= total_rows whenever total_rows changes.
    if patch.fill_processed_rows {
        sets.push("processed_rows = COALESCE(total_rows, processed_rows)".to_string());
    } else if let Some(total_rows) = patch.total_rows {
        values.push(Box::new(total_rows));
        sets.push(format!("processed_rows = MIN(processed_rows, ?{})", values.len()));
    }

    values.push(Box::new(id.to_string()));
    let id_param = values.len();
    let placeholders: Vec<String> = expected
        .iter()
        .map(|status| {
            values.push(Box::new(status.to_string()));
            format!("?{}", values.len())
        })
        .collect();

    let sql = format!(
        "UPDATE jobs SET {} WHERE id = ?{} AND status IN ({})",
        sets.join(", "),
        id_param,
        placeholders.join(", ")
    );

    db.with_conn(|conn| {
        let params_ref: Vec<&dyn rusqlite::types::ToSql> =
            values.iter().map(|p| p.as_ref()).collect();
        let changed = conn.execute(&sql, params_ref.as_slice())?;
        Ok(changed > 0)
    })
}

/// Claims a job for processing: `{PENDING, RUNNING} -> RUNNING`, guarded by
/// the version the caller read. Sets `started_at` only on the first claim.
pub fn claim(db: &Database, id: &str, expected_version: i64) -> Result<bool, DatabaseError> {
    let now = now_timestamp();
    db.with_conn(|conn| {
        let changed = conn.execute(
            "UPDATE jobs
             SET status = 'RUNNING', version = version + 1, updated_at = ?1,
                 started_at = COALESCE(started_at, ?1)
             WHERE id = ?2 AND version = ?3 AND status IN ('PENDING', 'RUNNING')
               AND retry_count < max_retries",
            params![now, id, expected_version],
        )?;
        Ok(changed > 0)
    })
}

/// Records a durably applied chunk and advances the job's counters.
///
/// Idempotent per `(job_id, chunk_index)`: a second commit of the same chunk
/// leaves every counter untouched. `last_processed_chunk` only moves across a
/// contiguous run of committed chunks.
pub fn commit_chunk(
    db: &Database,
    job_id: &str,
    chunk_index: i64,
    row_count: i64,
    outcome: &str,
) -> Result<ChunkCommitRow, DatabaseError> {
    let now = now_timestamp();
    db.with_tx(|tx| {
        let inserted = tx.execute(
            "INSERT OR IGNORE INTO chunk_commits (job_id, chunk_index, row_count, outcome, committed_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![job_id, chunk_index, row_count, outcome, now],
        )?;

        if inserted > 0 {
            tx.execute(
                "UPDATE jobs
                 SET processed_chunks = processed_chunks + 1,
                     processed_rows = CASE
                         WHEN total_rows IS NULL THEN processed_rows + ?2
                         ELSE MIN(total_rows, processed_rows + ?2)
                     END,
                     updated_at = ?3
                 WHERE id = ?1",
                params![job_id, row_count, now],
            )?;
        }

        let mut watermark: i64 = tx.query_row(
            "SELECT last_processed_chunk FROM jobs WHERE id = ?1",
            params![job_id],
            |r| r.get(0),
        )?;
        loop {
            let next_committed: bool = tx.query_row(
                "SELECT EXISTS(SELECT 1 FROM chunk_commits WHERE job_id = ?1 AND chunk_index = ?2)",
                params![job_id, watermark + 1],
                |r| r.get(0),
            )?;
            if !next_committed {
                break;
            }
            watermark += 1;
        }
        tx.execute(
            "UPDATE jobs SET last_processed_chunk = MAX(last_processed_chunk, ?2) WHERE id = ?1",
            params![job_id, watermark],
        )?;

        let (processed_rows, processed_chunks, last_processed_chunk, total_rows) = tx.query_row(
            "SELECT processed_rows, processed_chunks, last_processed_chunk, total_rows
             FROM jobs WHERE id = ?1",
            params![job_id],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?)),
        )?;

        Ok(ChunkCommitRow {
            newly_committed: inserted > 0,
            processed_rows,
            processed_chunks,
            last_processed_chunk,
            total_rows,
        })
    })
}

/// Whether a chunk has a commit record.
pub fn is_chunk_committed(
    db: &Database,
    job_id: &str,
    chunk_index: i64,
) -> Result<bool, DatabaseError> {
    db.with_conn(|conn| {
        Ok(conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM chunk_commits WHERE job_id = ?1 AND chunk_index = ?2)",
            params![job_id, chunk_index],
            |r| r.get(0),
        )?)
    })
}

/// Committed chunk indices above `watermark`, ascending.
pub fn committed_chunks_above(
    db: &Database,
    job_id: &str,
    watermark: i64,
) -> Result<Vec<i64>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt = conn.prepare(
            "SELECT chunk_index FROM chunk_commits
             WHERE job_id = ?1 AND chunk_index > ?2 ORDER BY chunk_index ASC",
        )?;
        let rows = stmt
            .query_map(params![job_id, watermark], |r| r.get(0))?
            .collect::<Result<Vec<i64>, _>>()?;
        Ok(rows)
    })
}

/// Queries jobs with filters, returning (rows, total_count). Newest first.
pub fn query(db: &Database, filter: &JobFilter) -> Result<(Vec<JobRow>, u64), DatabaseError> {
    db.with_conn(|conn| {
        let mut conditions = Vec::new();
        let mut param_values: Vec<Box<dyn rusqlite::types::ToSql>> = Vec::new();

        if let Some(ref lane) = filter.lane {
            param_values.push(Box::new(lane.clone()));
            conditions.push(format!("lane = ?{}", param_values.len()));
        }
        if let Some(ref status) = filter.status {
            param_values.push(Box::new(status.clone()));
            conditions.push(format!("status = ?{}", param_values.len()));
        }

        let where_clause = if conditions.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", conditions.join(" AND "))
        };

        let count_sql = format!("SELECT COUNT(*) FROM jobs {}", where_clause);
        let params_ref: Vec<&dyn rusqlite::types::ToSql> =
            param_values.iter().map(|p| p.as_ref()).collect();
        let total: u64 = conn.query_row(&count_sql, params_ref.as_slice(), |r| r.get(0))?;

        let limit = filter.limit.unwrap_or(100) as i64;
        let offset = filter.offset.unwrap_or(0) as i64;
        param_values.push(Box::new(limit));
        param_values.push(Box::new(offset));
        let query_sql = format!(
            "SELECT * FROM jobs {} ORDER BY created_at DESC, rowid DESC LIMIT ?{} OFFSET ?{}",
            where_clause,
            param_values.len() - 1,
            param_values.len()
        );

        let params_ref: Vec<&dyn rusqlite::types::ToSql> =
            param_values.iter().map(|p| p.as_ref()).collect();
        let mut stmt = conn.prepare(&query_sql)?;
        let rows: Vec<JobRow> = stmt
            .query_map(params_ref.as_slice(), JobRow::from_row)?
            .collect::<Result<Vec<_>, _>>()?;

        Ok((rows, total))
    })
}

/// All jobs whose status is one of `statuses`, oldest first.
pub fn list_by_statuses(db: &Database, statuses: &[&str]) -> Result<Vec<JobRow>, DatabaseError> {
    if statuses.is_empty() {
        return Ok(Vec::new());
    }
    let placeholders: Vec<String> = (1..=statuses.len()).map(|i| format!("?{}", i)).collect();
    let sql = format!(
        "SELECT * FROM jobs WHERE status IN ({}) ORDER BY created_at ASC, rowid ASC",
        placeholders.join(", ")
    );
    db.with_conn(|conn| {
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(rusqlite::params_from_iter(statuses.iter()), JobRow::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    })
}

/// Counts jobs with the given status.
pub fn count_by_status(db: &Database, status: &str) -> Result<u64, DatabaseError> {
    db.with_conn(|conn| {
        let count: u64 = conn.query_row(
            "SELECT COUNT(*) FROM jobs WHERE status = ?1",
            params![status],
            |r| r.get(0),
        )?;
        Ok(count)
    })
}

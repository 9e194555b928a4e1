//! Chunked batch processor.
//!
//! Drives one claimed job from its CSV file to fully committed chunks:
//! count rows, then read the file in waves of `max_concurrency` chunks,
//! processing every chunk of a wave concurrently and starting the next wave
//! only once the whole wave has resolved.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::future::join_all;
use serde_json::json;
use tracing::{debug, info_span, warn, Instrument};

use crate::broadcast::ProgressEvent;
use crate::filter::{self, FilterHandle, FilterSnapshot};
use crate::queue::{
    AuditAction, AuditLog, ChunkOutcome, Job, JobFailure, JobHandler, JobOutcome, JobStatus,
    JobStore,
};
use crate::sanitize;
use crate::sink::{BulkInsertReport, Document, DocumentSink, InsertFailureKind};

use super::chunker::{chunk_count, count_rows, Chunk, ChunkReader};
use super::config::ProcessorConfig;
use super::error::ProcessError;
use super::progress::ProgressReporter;

/// What happened to one chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkReport {
    pub index: u64,
    pub rows: u64,
    pub outcome: ChunkOutcome,
    pub inserted: u64,
    pub duplicates: u64,
    pub dropped: u64,
}

struct AppliedChunks {
    watermark: i64,
    committed: HashSet<u64>,
}

impl AppliedChunks {
    fn contains(&self, index: u64) -> bool {
        i64::try_from(index).is_ok_and(|i| i <= self.watermark) || self.committed.contains(&index)
    }
}

pub struct ChunkedProcessor {
    store: JobStore,
    audit: AuditLog,
    sink: Arc<dyn DocumentSink>,
    filter: FilterHandle,
    progress: Arc<dyn ProgressReporter>,
    config: ProcessorConfig,
}

impl ChunkedProcessor {
    pub fn new(
        store: JobStore,
        audit: AuditLog,
        sink: Arc<dyn DocumentSink>,
        filter: FilterHandle,
        progress: Arc<dyn ProgressReporter>,
        config: ProcessorConfig,
    ) -> Self {
        Self {
            store,
            audit,
            sink,
            filter,
            progress,
            config,
        }
    }

    /// Processes a claimed job to completion.
    pub async fn run(&self, job: &Job) -> Result<JobOutcome, ProcessError> {
        let path = job.file_path.clone();
        if !path.is_file() {
            return Err(ProcessError::SourceMissing { path });
        }

        // Row count pass
        let total_rows = {
            let path = path.clone();
            tokio::task::spawn_blocking(move || count_rows(&path))
                .await
                .map_err(|e| ProcessError::Task(e.to_string()))??
        };
        let total_chunks = chunk_count(total_rows, self.config.chunk_size);
        if !self
            .store
            .set_totals(&job.id, total_rows, Some(total_chunks))?
        {
            return Err(self.not_running(&job.id)?);
        }
        debug!(total_rows, total_chunks, "row count complete");

        let counted = self.store.get(&job.id)?;
        self.progress.report(ProgressEvent::new(
            &job.id,
            counted.percentage(),
            JobStatus::Running,
            format!("Counted {} rows in {} chunks", total_rows, total_chunks),
        ));

        let mut outcome = JobOutcome {
            total_rows,
            chunks: total_chunks,
            ..Default::default()
        };

        // Chunk passes
        let width = self.config.max_concurrency.max(1);
        let mut reader = {
            let path = path.clone();
            let chunk_size = self.config.chunk_size;
            tokio::task::spawn_blocking(move || ChunkReader::open(&path, chunk_size))
                .await
                .map_err(|e| ProcessError::Task(e.to_string()))??
        };

        loop {
            let snapshot = self.filter.snapshot();
            let applied = self.applied_chunks(&job.id)?;

            let (returned, wave) = tokio::task::spawn_blocking(move || {
                let wave = reader.next_wave(width, |index| applied.contains(index));
                (reader, wave)
            })
            .await
            .map_err(|e| ProcessError::Task(e.to_string()))?;
            reader = returned;
            let wave = wave?;

            let Some(first_chunk) = wave.first().map(|c| c.index) else {
                break;
            };

            for report in self.run_wave(&job.id, first_chunk, wave, &snapshot).await? {
                outcome.inserted_rows += report.inserted;
                outcome.duplicate_rows += report.duplicates;
                outcome.dropped_rows += report.dropped;
                if report.outcome == ChunkOutcome::Resumed {
                    outcome.skipped_chunks += 1;
                }
            }
        }

        // Finalize
        if !self.store.finalize_rows(&job.id)? {
            return Err(self.not_running(&job.id)?);
        }
        self.progress.report(ProgressEvent::new(
            &job.id,
            100,
            JobStatus::Completed,
            format!("Migrated {} rows", total_rows),
        ));
        Ok(outcome)
    }

    /// Chunks a previous attempt already applied.
    fn applied_chunks(&self, job_id: &str) -> Result<AppliedChunks, ProcessError> {
        let job = self.store.get(job_id)?;
        let committed = self
            .store
            .committed_chunks_above(job_id, job.last_processed_chunk)?
            .into_iter()
            .collect();
        Ok(AppliedChunks {
            watermark: job.last_processed_chunk,
            committed,
        })
    }

    async fn run_wave(
        &self,
        job_id: &str,
        first_chunk: u64,
        wave: Vec<Chunk>,
        snapshot: &FilterSnapshot,
    ) -> Result<Vec<ChunkReport>, ProcessError> {
        let span = info_span!("wave", first_chunk, width = wave.len(), filter_version = snapshot.version);
        let chunks = wave.into_iter().map(|chunk| {
            let span = info_span!("chunk", index = chunk.index, rows = chunk.row_count);
            self.process_chunk(job_id, chunk, snapshot).instrument(span)
        });

        let results = match self.config.wave_timeout {
            Some(timeout) => tokio::time::timeout(timeout, join_all(chunks))
                .instrument(span)
                .await
                .map_err(|_| ProcessError::WaveTimeout {
                    first_chunk,
                    timeout,
                })?,
            None => join_all(chunks).instrument(span).await,
        };

        // Every chunk of the wave has resolved; surface the first failure.
        let mut reports = Vec::with_capacity(results.len());
        let mut first_error = None;
        for result in results {
            match result {
                Ok(report) => reports.push(report),
                Err(e) => {
                    warn!("{}", e);
                    first_error.get_or_insert(e);
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(reports),
        }
    }

    async fn process_chunk(
        &self,
        job_id: &str,
        chunk: Chunk,
        snapshot: &FilterSnapshot,
    ) -> Result<ChunkReport, ProcessError> {
        let Chunk {
            index,
            row_count,
            records,
            hollow,
        } = chunk;

        let job = self.store.get(job_id)?;
        let already_applied = hollow
            || i64::try_from(index).is_ok_and(|i| i <= job.last_processed_chunk)
            || self.store.is_chunk_committed(job_id, index)?;

        if already_applied {
            self.commit(job_id, index, row_count, ChunkOutcome::Resumed)?;
            debug!("chunk already applied, skipped");
            return Ok(ChunkReport {
                index,
                rows: row_count,
                outcome: ChunkOutcome::Resumed,
                inserted: 0,
                duplicates: 0,
                dropped: 0,
            });
        }

        let mut documents: Vec<Document> = Vec::with_capacity(records.len());
        let mut dropped = 0u64;
        for record in records {
            match filter::apply(snapshot.transform.as_ref(), record) {
                Ok(Some(document)) => documents.push(document),
                Ok(None) => dropped += 1,
                Err(source) => return Err(ProcessError::Validation { chunk: index, source }),
            }
        }

        let report = if documents.is_empty() {
            BulkInsertReport::default()
        } else {
            self.sink
                .insert_unordered(&self.config.collection, documents)
                .await
                .map_err(|source| ProcessError::Sink {
                    chunk: index,
                    source,
                })?
        };

        // Any non-duplicate failure fails the chunk; nothing is committed.
        if let Some(failure) = report.first_hard_failure() {
            let message = match &failure.kind {
                InsertFailureKind::Other(m) => m.clone(),
                InsertFailureKind::DuplicateKey => "duplicate key".to_string(),
            };
            return Err(ProcessError::InsertFailed {
                chunk: index,
                index: failure.index,
                message,
            });
        }

        let inserted = report.inserted as u64;
        let duplicates = report.duplicates() as u64;
        let (outcome, action) = if inserted == 0 && duplicates > 0 {
            (ChunkOutcome::AllDuplicate, AuditAction::Skip)
        } else {
            (ChunkOutcome::Inserted, AuditAction::Insert)
        };

        self.audit.record(
            action,
            Some(job_id),
            json!({
                "chunk": index,
                "rows": row_count,
                "inserted": inserted,
                "duplicates": duplicates,
                "dropped": dropped,
            }),
        )?;
        self.commit(job_id, index, row_count, outcome)?;

        Ok(ChunkReport {
            index,
            rows: row_count,
            outcome,
            inserted,
            duplicates,
            dropped,
        })
    }

    fn commit(
        &self,
        job_id: &str,
        index: u64,
        row_count: u64,
        outcome: ChunkOutcome,
    ) -> Result<(), ProcessError> {
        let commit = self
            .store
            .commit_chunk(job_id, index, row_count, outcome)?;
        let verb = match outcome {
            ChunkOutcome::Inserted => "inserted",
            ChunkOutcome::AllDuplicate => "skipped as duplicate",
            ChunkOutcome::Resumed => "already applied",
        };
        self.progress.report(ProgressEvent::new(
            job_id,
            commit.percentage(),
            JobStatus::Running,
            format!(
                "Chunk {} {} ({}/{} rows)",
                index,
                verb,
                commit.processed_rows,
                commit.total_rows.unwrap_or(0)
            ),
        ));
        Ok(())
    }

    fn not_running(&self, job_id: &str) -> Result<ProcessError, ProcessError> {
        let job = self.store.get(job_id)?;
        Ok(ProcessError::NotRunning {
            id: job_id.to_string(),
            status: job.status,
        })
    }
}

#[async_trait]
impl JobHandler for ChunkedProcessor {
    async fn process(&self, job: Job) -> Result<JobOutcome, JobFailure> {
        let filename = sanitize::redact_path(&job.file_path);
        let span = info_span!(
            "process_job",
            job_id = %job.id,
            filename = %filename,
            path_hash = %sanitize::hash_path(&job.file_path),
        );

        self.run(&job).instrument(span).await.map_err(|e| {
            if e.is_fatal() {
                JobFailure::fatal(e.to_string())
            } else {
                JobFailure::retryable(e.to_string())
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;
    use std::path::{Path, PathBuf};
    use std::time::Duration;

    use super::*;
    use crate::db::Database;
    use crate::filter::FieldFilter;
    use crate::pipeline::progress::{NoopProgress, RecordingProgress};
    use crate::queue::NewJob;
    use crate::sink::MemorySink;

    struct Fixture {
        _dir: tempfile::TempDir,
        store: JobStore,
        audit: AuditLog,
        sink: MemorySink,
        path: PathBuf,
    }

    fn fixture(rows: usize) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("people.csv");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "id,name,email").unwrap();
        for i in 0..rows {
            let email = if i % 10 == 0 { String::new() } else { format!("p{}@example.com", i) };
            writeln!(file, "{},person-{},{}", i, i, email).unwrap();
        }
        let db = Database::open_in_memory().unwrap();
        Fixture {
            _dir: dir,
            store: JobStore::new(db.clone()),
            audit: AuditLog::new(db),
            sink: MemorySink::new(vec!["id".into()]),
            path,
        }
    }

    fn claimed_job(f: &Fixture, path: &Path) -> Job {
        let job = f
            .store
            .create(
                NewJob {
                    lane: "csv-migration".into(),
                    filename: "people.csv".into(),
                    file_path: path.to_path_buf(),
                    checksum: "abc".into(),
                    max_retries: 3,
                },
                None,
            )
            .unwrap();
        f.store.claim(&job.id, job.version).unwrap().unwrap()
    }

    fn processor(f: &Fixture, filter: FilterHandle, progress: Arc<dyn ProgressReporter>, width: usize) -> ChunkedProcessor {
        ChunkedProcessor::new(
            f.store.clone(),
            f.audit.clone(),
            Arc::new(f.sink.clone()),
            filter,
            progress,
            ProcessorConfig {
                chunk_size: 10,
                max_concurrency: width,
                wave_timeout: None,
                collection: "people".into(),
            },
        )
    }

    #[tokio::test]
    async fn test_processes_all_chunks() {
        let f = fixture(25);
        let job = claimed_job(&f, &f.path);
        let progress = Arc::new(RecordingProgress::default());
        let p = processor(&f, FilterHandle::passthrough(), progress.clone(), 2);

        let outcome = p.run(&job).await.unwrap();
        assert_eq!(outcome.total_rows, 25);
        assert_eq!(outcome.inserted_rows, 25);
        assert_eq!(outcome.chunks, 3);

        let done = f.store.get(&job.id).unwrap();
        assert_eq!(done.status, JobStatus::Completed);
        assert_eq!(done.processed_rows, 25);
        assert_eq!(done.processed_chunks, 3);
        assert_eq!(done.last_processed_chunk, 2);
        assert_eq!(f.sink.count("people").await.unwrap(), 25);

        let percentages: Vec<u8> = progress.events().iter().map(|e| e.percentage).collect();
        assert!(percentages.iter().all(|p| *p <= 100));
        assert_eq!(percentages.last(), Some(&100));
    }

    #[tokio::test]
    async fn test_missing_file_is_fatal() {
        let f = fixture(1);
        let job = claimed_job(&f, Path::new("/nonexistent/people.csv"));
        let p = processor(&f, FilterHandle::passthrough(), Arc::new(NoopProgress), 2);

        let failure = p.process(job).await.unwrap_err();
        assert!(failure.fatal);
    }

    #[tokio::test]
    async fn test_filter_drops_and_renames() {
        let f = fixture(20);
        let job = claimed_job(&f, &f.path);
        let filter = FieldFilter::from_json(
            r#"{"required": ["email"], "rename": {"email": "contact"}}"#,
        )
        .unwrap();
        let p = processor(&f, FilterHandle::new(Arc::new(filter)), Arc::new(NoopProgress), 4);

        let outcome = p.run(&job).await.unwrap();
        assert_eq!(outcome.dropped_rows, 2);
        assert_eq!(outcome.inserted_rows, 18);
        // Dropped rows still count toward progress.
        assert_eq!(f.store.get(&job.id).unwrap().processed_rows, 20);
    }

    #[tokio::test]
    async fn test_validation_failure_aborts() {
        let f = fixture(20);
        let job = claimed_job(&f, &f.path);
        let filter =
            FieldFilter::from_json(r#"{"required": ["email"], "onMissingRequired": "fail"}"#).unwrap();
        let p = processor(&f, FilterHandle::new(Arc::new(filter)), Arc::new(NoopProgress), 1);

        let err = p.run(&job).await.unwrap_err();
        assert!(matches!(err, ProcessError::Validation { chunk: 0, .. }));
        assert!(!err.is_fatal());
    }

    #[tokio::test]
    async fn test_wave_timeout() {
        let f = fixture(5);
        let job = claimed_job(&f, &f.path);
        f.sink.set_delay(Some(Duration::from_secs(30)));
        let mut p = processor(&f, FilterHandle::passthrough(), Arc::new(NoopProgress), 1);
        p.config.wave_timeout = Some(Duration::from_millis(20));

        let err = p.run(&job).await.unwrap_err();
        assert!(matches!(err, ProcessError::WaveTimeout { first_chunk: 0, .. }));
        assert_eq!(f.store.get(&job.id).unwrap().processed_chunks, 0);
    }

    #[tokio::test]
    async fn test_undecodable_row_is_fatal() {
        let f = fixture(0);
        std::fs::write(&f.path, b"id,name\n1,Ada\n2,\xff\xfe\n").unwrap();
        let job = claimed_job(&f, &f.path);
        let p = processor(&f, FilterHandle::passthrough(), Arc::new(NoopProgress), 1);

        let err = p.run(&job).await.unwrap_err();
        assert!(matches!(err, ProcessError::Csv { .. }));
        assert!(err.is_fatal());
        assert_eq!(f.store.get(&job.id).unwrap().total_rows, Some(2));
        assert_eq!(f.sink.batch_count(), 0);
    }

    #[tokio::test]
    async fn test_sink_outage_is_retryable() {
        let f = fixture(5);
        let job = claimed_job(&f, &f.path);
        f.sink.fail_next_batches(1);
        let p = processor(&f, FilterHandle::passthrough(), Arc::new(NoopProgress), 1);

        let failure = p.process(job).await.unwrap_err();
        assert!(!failure.fatal);
        assert!(failure.message.contains("Destination unavailable"));
    }
}

//! Upload intake: the producer side used by the CLI `submit` command.

use std::path::{Path, PathBuf};

use crate::checksum::checksum_file;
use crate::error::IntakeError;
use crate::queue::{Job, JobQueue, NewJobPayload, QueueError, StoreError};

use super::archive::{ensure_directory, job_file_name, safe_filename};

pub struct Intake {
    queue: JobQueue,
    lane: String,
    upload_directory: Option<PathBuf>,
}

impl Intake {
    pub fn new(queue: JobQueue, lane: impl Into<String>) -> Self {
        Self {
            queue,
            lane: lane.into(),
            upload_directory: None,
        }
    }

    /// Copies every accepted upload into `dir` before enqueueing it.
    pub fn with_upload_directory(mut self, dir: impl AsRef<Path>) -> Self {
        self.upload_directory = Some(dir.as_ref().to_path_buf());
        self
    }

    /// Enqueues the CSV at `path` unless a job with the same content exists.
    /// `filename` is the display name; any directory part is dropped.
    pub fn submit(&self, path: &Path, filename: &str) -> Result<Job, IntakeError> {
        let filename = safe_filename(filename);
        let checksum = checksum_file(path)?;

        if let Some(existing) = self
            .queue
            .store()
            .find_by_checksum(&checksum)
            .map_err(QueueError::from)?
        {
            log::info!("Rejected upload {}: duplicate of job {}", filename, existing.id);
            return Err(IntakeError::DuplicateFile {
                existing_job_id: existing.id,
            });
        }

        let job_id = uuid::Uuid::new_v4().to_string();
        let (file_path, copied) = match &self.upload_directory {
            Some(dir) => {
                ensure_directory(dir)?;
                let target = dir.join(job_file_name(&job_id, &filename));
                std::fs::copy(path, &target).map_err(|e| IntakeError::Store {
                    path: target.clone(),
                    source: e,
                })?;
                (target, true)
            }
            None => (path.to_path_buf(), false),
        };

        let payload = NewJobPayload {
            job_id: Some(job_id),
            filename,
            file_path: file_path.clone(),
            checksum: checksum.clone(),
        };
        match self.queue.add(&self.lane, payload) {
            Ok(job) => Ok(job),
            Err(e) => {
                if copied {
                    let _ = std::fs::remove_file(&file_path);
                }
                Err(self.classify_add_error(e, &checksum))
            }
        }
    }

    /// A concurrent upload of the same content loses on the unique index.
    fn classify_add_error(&self, error: QueueError, checksum: &str) -> IntakeError {
        if let QueueError::Store(StoreError::DuplicateChecksum { .. }) = error {
            if let Ok(Some(existing)) = self.queue.store().find_by_checksum(checksum) {
                return IntakeError::DuplicateFile {
                    existing_job_id: existing.id,
                };
            }
        }
        IntakeError::Queue(error)
    }
}

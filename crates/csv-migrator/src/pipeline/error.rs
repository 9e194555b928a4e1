use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::filter::TransformError;
use crate::queue::{JobStatus, StoreError};
use crate::sink::SinkError;

#[derive(Error, Debug)]
pub enum ProcessError {
    #[error("Source file not found: {}", path.display())]
    SourceMissing { path: PathBuf },

    #[error("Failed to open '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse CSV '{path}': {source}")]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },

    #[error("Job store error: {0}")]
    Store(#[from] StoreError),

    #[error("Audit log write failed: {0}")]
    Audit(#[from] crate::db::DatabaseError),

    #[error("Chunk {chunk}: destination error: {source}")]
    Sink {
        chunk: u64,
        #[source]
        source: SinkError,
    },

    #[error("Chunk {chunk}: record {index} failed to insert: {message}")]
    InsertFailed {
        chunk: u64,
        index: usize,
        message: String,
    },

    #[error("Chunk {chunk}: {source}")]
    Validation {
        chunk: u64,
        #[source]
        source: TransformError,
    },

    #[error("Wave starting at chunk {first_chunk} did not finish within {timeout:?}")]
    WaveTimeout { first_chunk: u64, timeout: Duration },

    #[error("Job {id} is {status}, no longer running")]
    NotRunning { id: String, status: JobStatus },

    #[error("Background task failed: {0}")]
    Task(String),
}

impl ProcessError {
    /// Fatal errors fail the job on the first attempt. A CSV error is fatal
    /// unless it came from the underlying reader.
    pub fn is_fatal(&self) -> bool {
        match self {
            ProcessError::SourceMissing { .. } => true,
            ProcessError::Csv { source, .. } => {
                !matches!(source.kind(), csv::ErrorKind::Io(_))
            }
            _ => false,
        }
    }
}

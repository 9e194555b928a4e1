use std::path::PathBuf;
use thiserror::Error;

use crate::checksum::ChecksumError;
use crate::pipeline::ProcessError;
use crate::queue::{QueueError, StoreError};

#[derive(Error, Debug)]
pub enum MigratorError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Processing error: {0}")]
    Process(#[from] ProcessError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Job store error: {0}")]
    Store(#[from] StoreError),

    #[error("Worker error: {0}")]
    Worker(#[from] WorkerError),

    #[error("Upload rejected: {0}")]
    Intake(#[from] IntakeError),

    #[error("Database error: {0}")]
    Database(#[from] crate::db::DatabaseError),

    #[error("Field filter error: {0}")]
    Filter(#[from] crate::filter::FilterError),

    #[error("Destination error: {0}")]
    Sink(#[from] crate::sink::SinkError),

    #[error("Failed to encode output: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config JSON: {0}")]
    ParseJson(#[from] serde_json::Error),

    #[error("Config validation failed: {message}")]
    Validation { message: String },

    #[error("Schema validation failed: {errors}")]
    SchemaValidation { errors: String },
}

#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("Failed to spawn worker: {0}")]
    SpawnFailed(String),

    #[error("Directory scan failed for '{path}': {source}")]
    ScanFailed {
        path: PathBuf,
        #[source]
        source: walkdir::Error,
    },

    #[error("Failed to create directory '{path}': {source}")]
    CreateDirectory {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to move file from '{from}' to '{to}': {source}")]
    MoveFile {
        from: PathBuf,
        to: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("File already exists: {0}")]
    FileExists(PathBuf),

    #[error(transparent)]
    Checksum(#[from] ChecksumError),

    #[error("Failed to enqueue job: {0}")]
    Queue(#[from] QueueError),
}

#[derive(Error, Debug)]
pub enum IntakeError {
    #[error("File already uploaded as job {existing_job_id}")]
    DuplicateFile { existing_job_id: String },

    #[error(transparent)]
    Checksum(#[from] ChecksumError),

    #[error("Failed to store upload at '{path}': {source}")]
    Store {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Worker(#[from] WorkerError),

    #[error("Failed to enqueue job: {0}")]
    Queue(#[from] QueueError),
}

impl IntakeError {
    /// Duplicate uploads are the caller's fault, everything else is ours.
    pub fn is_duplicate(&self) -> bool {
        matches!(self, IntakeError::DuplicateFile { .. })
    }
}

pub type Result<T> = std::result::Result<T, MigratorError>;

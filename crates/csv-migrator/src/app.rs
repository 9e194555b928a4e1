//! Wires the queue, processor and background workers from a [`Config`].

use std::path::PathBuf;
use std::sync::Arc;

use crate::broadcast::{JobProgressBroadcaster, ProgressPoller};
use crate::config::Config;
use crate::db::{default_database_path, Database};
use crate::error::{ConfigError, MigratorError};
use crate::filter::{FilterHandle, FilterReloader};
use crate::pipeline::{ChunkedProcessor, ProcessorConfig};
use crate::queue::{AuditLog, JobQueue, JobStore, QueueConfig};
use crate::sink::{DocumentSink, SqliteDocumentSink};
use crate::worker::{ImportScheduler, Intake};

pub struct Migrator {
    config: Config,
    queue: JobQueue,
    progress: JobProgressBroadcaster,
    filter: FilterHandle,
    sink: Arc<dyn DocumentSink>,
}

impl Migrator {
    /// Opens the databases named by `config`.
    pub fn open(config: Config) -> Result<Self, MigratorError> {
        let db = Database::open(&resolve_database_path(&config)?)?;
        let sink: Arc<dyn DocumentSink> = match &config.destination.database_path {
            Some(path) => Arc::new(SqliteDocumentSink::open(
                path,
                config.destination.key_fields.clone(),
            )?),
            None => Arc::new(SqliteDocumentSink::new(
                db.clone(),
                config.destination.key_fields.clone(),
            )),
        };
        Ok(Self::with_sink(config, db, sink))
    }

    pub fn with_sink(config: Config, db: Database, sink: Arc<dyn DocumentSink>) -> Self {
        let progress = JobProgressBroadcaster::default();
        let queue = JobQueue::with_progress(
            JobStore::new(db.clone()),
            AuditLog::new(db),
            QueueConfig {
                max_retries: config.max_retries,
                poll_interval: config.poll_interval(),
            },
            progress.clone(),
        );
        Self {
            config,
            queue,
            progress,
            filter: FilterHandle::passthrough(),
            sink,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn queue(&self) -> &JobQueue {
        &self.queue
    }

    pub fn progress(&self) -> &JobProgressBroadcaster {
        &self.progress
    }

    pub fn filter(&self) -> &FilterHandle {
        &self.filter
    }

    pub fn processor(&self) -> ChunkedProcessor {
        ChunkedProcessor::new(
            self.queue.store().clone(),
            self.queue.audit().clone(),
            Arc::clone(&self.sink),
            self.filter.clone(),
            Arc::new(self.progress.clone()),
            ProcessorConfig::from_config(&self.config),
        )
    }

    pub fn intake(&self) -> Intake {
        let intake = Intake::new(self.queue.clone(), self.config.lane.clone());
        match &self.config.upload_directory {
            Some(dir) => intake.with_upload_directory(dir),
            None => intake,
        }
    }

    /// `None` when no import directories are configured.
    pub fn scheduler(&self) -> Option<ImportScheduler> {
        self.config.import.as_ref().map(|import| {
            ImportScheduler::new(
                self.queue.clone(),
                self.config.lane.clone(),
                &import.input_directory,
                &import.processed_directory,
                import.scan_interval(),
            )
        })
    }

    pub fn progress_poller(&self) -> ProgressPoller {
        ProgressPoller::new(
            self.queue.store().clone(),
            self.progress.clone(),
            self.config.progress_poll_interval(),
        )
    }

    /// Loads the configured field filter and returns its reloader. A filter
    /// that fails to load at startup is an error.
    pub fn filter_reloader(&self) -> Result<Option<FilterReloader>, MigratorError> {
        let Some(settings) = &self.config.field_filter else {
            return Ok(None);
        };
        let mut reloader = FilterReloader::new(
            &settings.path,
            self.filter.clone(),
            settings.reload_interval(),
        );
        reloader.reload_if_changed()?;
        Ok(Some(reloader))
    }
}

fn resolve_database_path(config: &Config) -> Result<PathBuf, ConfigError> {
    config
        .database_path
        .clone()
        .or_else(default_database_path)
        .ok_or_else(|| ConfigError::Validation {
            message: "database_path is not set and no home directory was found".to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FieldFilterSettings;
    use crate::sink::MemorySink;
    use tempfile::TempDir;

    fn migrator(config: Config) -> Migrator {
        Migrator::with_sink(
            config,
            Database::open_in_memory().unwrap(),
            Arc::new(MemorySink::default()),
        )
    }

    #[test]
    fn test_open_creates_database() {
        let dir = TempDir::new().unwrap();
        let config = Config {
            database_path: Some(dir.path().join("data").join("jobs.db")),
            ..Config::default()
        };

        let migrator = Migrator::open(config).unwrap();
        assert!(dir.path().join("data").join("jobs.db").exists());
        assert!(migrator.scheduler().is_none());
    }

    #[test]
    fn test_filter_reloader_loads_initial_filter() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("filter.json");
        std::fs::write(&path, r#"{"include": ["id"]}"#).unwrap();
        let config = Config {
            field_filter: Some(FieldFilterSettings {
                path,
                reload_interval_secs: 1,
            }),
            ..Config::default()
        };
        let migrator = migrator(config);
        let before = migrator.filter().snapshot().version;

        assert!(migrator.filter_reloader().unwrap().is_some());
        assert!(migrator.filter().snapshot().version > before);
    }

    #[test]
    fn test_broken_filter_fails_startup() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("filter.json");
        std::fs::write(&path, "{not json").unwrap();
        let config = Config {
            field_filter: Some(FieldFilterSettings {
                path,
                reload_interval_secs: 1,
            }),
            ..Config::default()
        };

        assert!(matches!(
            migrator(config).filter_reloader(),
            Err(MigratorError::Filter(_))
        ));
    }
}

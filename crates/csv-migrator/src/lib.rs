pub mod app;
pub mod broadcast;
pub mod checksum;
pub mod config;
pub mod db;
pub mod error;
pub mod filter;
pub mod pipeline;
pub mod queue;
pub mod sanitize;
pub mod sink;
pub mod telemetry;
pub mod worker;

pub use app::Migrator;
pub use broadcast::{JobProgressBroadcaster, ProgressEvent, ProgressPoller};
pub use config::{load_config, Config};
pub use error::{ConfigError, IntakeError, MigratorError, Result, WorkerError};
pub use pipeline::{ChunkedProcessor, ProcessError, ProcessorConfig};
pub use queue::{Job, JobQueue, JobStatus, JobStore, QueueError};
pub use worker::{ImportScheduler, Intake};

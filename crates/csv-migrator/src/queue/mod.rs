//! Durable job queue: job model, store, audit log and dispatcher.

pub mod audit;
pub mod dispatcher;
pub mod job;
pub mod store;

pub use audit::{AuditAction, AuditEntry, AuditLog};
pub use dispatcher::{JobHandler, JobQueue, QueueConfig, QueueError};
pub use job::{
    percentage, ChunkCommit, ChunkOutcome, Job, JobFailure, JobOutcome, JobStatus, JobUpdate,
    NewJob, NewJobPayload,
};
pub use store::{JobStore, StoreError};

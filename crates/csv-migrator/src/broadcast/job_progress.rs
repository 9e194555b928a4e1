//! Job progress broadcaster for real-time job status streaming.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::queue::{Job, JobStatus};

/// Progress event for a job.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProgressEvent {
    /// Unique job identifier.
    pub job_id: String,
    /// Integer in `0..=100`.
    pub percentage: u8,
    /// Human-readable message describing current activity.
    pub message: String,
    /// Job status at the time of the event.
    pub status: JobStatus,
    /// Timestamp of this event.
    pub timestamp: DateTime<Utc>,
    /// Error message (set on failure).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ProgressEvent {
    /// Creates a new progress event.
    pub fn new(job_id: &str, percentage: u8, status: JobStatus, message: impl Into<String>) -> Self {
        Self {
            job_id: job_id.to_string(),
            percentage: percentage.min(100),
            message: message.into(),
            status,
            timestamp: Utc::now(),
            error: None,
        }
    }

    /// Snapshot of a job's durable counters.
    pub fn from_job(job: &Job) -> Self {
        let message = match (job.status, job.total_rows) {
            (JobStatus::Completed, _) => "Migration completed".to_string(),
            (JobStatus::Failed, _) => "Migration failed".to_string(),
            (JobStatus::Paused, _) => "Paused".to_string(),
            (_, Some(total)) => format!("Processed {}/{} rows", job.processed_rows, total),
            (_, None) => "Waiting to start".to_string(),
        };
        let mut event = Self::new(&job.id, job.percentage(), job.status, message);
        event.error = job.error.clone();
        event
    }

    /// Creates a failure event.
    pub fn failed(job_id: &str, percentage: u8, status: JobStatus, error: &str) -> Self {
        let message = if status == JobStatus::Failed {
            "Migration failed"
        } else {
            "Attempt failed, will retry"
        };
        let mut event = Self::new(job_id, percentage, status, message);
        event.error = Some(error.to_string());
        event
    }
}

/// Broadcasts job progress events to every subscribed observer.
///
/// Each subscriber is an independent `Receiver`; dropping one never affects
/// the others and late subscribers see no replay. Percentages are kept
/// non-decreasing per job until the job reaches a terminal status.
#[derive(Clone)]
pub struct JobProgressBroadcaster {
    sender: Arc<broadcast::Sender<ProgressEvent>>,
    high_water: Arc<Mutex<HashMap<String, u8>>>,
}

impl JobProgressBroadcaster {
    /// Creates a new job progress broadcaster with the specified channel capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender: Arc::new(sender),
            high_water: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Sends a progress event to all subscribers. Never fails.
    pub fn emit(&self, mut event: ProgressEvent) {
        if let Ok(mut marks) = self.high_water.lock() {
            if event.status.is_terminal() {
                marks.remove(&event.job_id);
            } else {
                let mark = marks.entry(event.job_id.clone()).or_insert(0);
                if event.percentage < *mark {
                    event.percentage = *mark;
                } else {
                    *mark = event.percentage;
                }
            }
        }
        // Ignore errors - no active receivers is fine
        let _ = self.sender.send(event);
    }

    /// Creates a new subscriber for progress events.
    pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.sender.subscribe()
    }

    /// Number of currently connected observers.
    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for JobProgressBroadcaster {
    fn default() -> Self {
        Self::new(256)
    }
}

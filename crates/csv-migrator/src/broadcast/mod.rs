//! Broadcasting modules for real-time progress streaming.

pub mod job_progress;
pub mod poller;

pub use job_progress::{JobProgressBroadcaster, ProgressEvent};
pub use poller::ProgressPoller;

//! Periodic progress re-emission from durable job state.
//!
//! Observers that missed push events converge on current progress at the
//! next tick.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::queue::{JobStore, StoreError};

use super::job_progress::{JobProgressBroadcaster, ProgressEvent};

/// Re-emits progress for every non-terminal job on a fixed interval.
pub struct ProgressPoller {
    store: JobStore,
    broadcaster: JobProgressBroadcaster,
    interval: Duration,
    shutdown: Arc<AtomicBool>,
    wake: Arc<Notify>,
}

impl ProgressPoller {
    pub fn new(store: JobStore, broadcaster: JobProgressBroadcaster, interval: Duration) -> Self {
        Self {
            store,
            broadcaster,
            interval,
            shutdown: Arc::new(AtomicBool::new(false)),
            wake: Arc::new(Notify::new()),
        }
    }

    /// Emits one snapshot per non-terminal job, paused ones included.
    /// Returns how many were emitted.
    pub fn poll_once(&self) -> Result<usize, StoreError> {
        let jobs = self.store.list_active()?;
        for job in &jobs {
            self.broadcaster.emit(ProgressEvent::from_job(job));
        }
        Ok(jobs.len())
    }

    /// Starts the poll loop on the current tokio runtime.
    pub fn start(&self) -> JoinHandle<()> {
        let poller = Self {
            store: self.store.clone(),
            broadcaster: self.broadcaster.clone(),
            interval: self.interval,
            shutdown: Arc::clone(&self.shutdown),
            wake: Arc::clone(&self.wake),
        };

        tokio::spawn(async move {
            let mut interval_timer = tokio::time::interval(poller.interval);
            interval_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = interval_timer.tick() => {},
                    _ = poller.wake.notified() => {},
                }

                if poller.shutdown.load(Ordering::Acquire) {
                    break;
                }

                // Skip the tick entirely when nobody is listening.
                if poller.broadcaster.receiver_count() == 0 {
                    continue;
                }

                match poller.poll_once() {
                    Ok(n) if n > 0 => log::trace!("Re-emitted progress for {} jobs", n),
                    Err(e) => log::error!("Progress poll failed: {}", e),
                    _ => {}
                }
            }
            log::debug!("Progress poller stopped");
        })
    }

    /// Signals the poll loop to stop.
    pub fn stop(&self) {
        self.shutdown.store(true, Ordering::Release);
        self.wake.notify_one();
    }
}

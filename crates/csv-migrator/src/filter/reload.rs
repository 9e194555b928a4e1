//! Versioned, swappable filter with file-based hot reload.
//!
//! Readers take an `Arc<FilterSnapshot>` and keep using it for as long as
//! they like; a reload only affects snapshots taken afterwards.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::JoinHandle;

use super::rules::FieldFilter;
use super::{FilterError, Passthrough, RecordTransform};

/// An immutable filter version.
pub struct FilterSnapshot {
    pub version: u64,
    pub transform: Arc<dyn RecordTransform>,
}

/// Shared handle to the current filter.
#[derive(Clone)]
pub struct FilterHandle {
    current: Arc<RwLock<Arc<FilterSnapshot>>>,
}

impl FilterHandle {
    pub fn new(transform: Arc<dyn RecordTransform>) -> Self {
        Self {
            current: Arc::new(RwLock::new(Arc::new(FilterSnapshot {
                version: 1,
                transform,
            }))),
        }
    }

    /// A handle whose filter passes every record through unchanged.
    pub fn passthrough() -> Self {
        Self::new(Arc::new(Passthrough))
    }

    pub fn snapshot(&self) -> Arc<FilterSnapshot> {
        match self.current.read() {
            Ok(guard) => Arc::clone(&guard),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }

    /// Installs a new filter and returns its version.
    pub fn replace(&self, transform: Arc<dyn RecordTransform>) -> u64 {
        let mut guard = match self.current.write() {
            Ok(g) => g,
            Err(poisoned) => {
                log::warn!("Filter lock was poisoned, recovering");
                poisoned.into_inner()
            }
        };
        let version = guard.version + 1;
        *guard = Arc::new(FilterSnapshot { version, transform });
        version
    }
}

impl Default for FilterHandle {
    fn default() -> Self {
        Self::passthrough()
    }
}

/// Re-reads a filter file on an interval and swaps it in when it changed.
pub struct FilterReloader {
    path: PathBuf,
    handle: FilterHandle,
    interval: Duration,
    last_content: Option<String>,
    shutdown: Arc<AtomicBool>,
    wake: Arc<Notify>,
}

impl FilterReloader {
    pub fn new(path: &Path, handle: FilterHandle, interval: Duration) -> Self {
        Self {
            path: path.to_path_buf(),
            handle,
            interval,
            last_content: None,
            shutdown: Arc::new(AtomicBool::new(false)),
            wake: Arc::new(Notify::new()),
        }
    }

    /// Loads the file if its content differs from the last load.
    ///
    /// Returns whether a new filter was installed. On error the current
    /// filter stays in place.
    pub fn reload_if_changed(&mut self) -> Result<bool, FilterError> {
        let content = std::fs::read_to_string(&self.path).map_err(|source| FilterError::Read {
            path: self.path.clone(),
            source,
        })?;
        if self.last_content.as_deref() == Some(content.as_str()) {
            return Ok(false);
        }

        let filter = FieldFilter::from_json(&content)?;
        let version = self.handle.replace(Arc::new(filter));
        self.last_content = Some(content);
        log::info!(
            "Loaded field filter from {} (version {})",
            self.path.display(),
            version
        );
        Ok(true)
    }

    /// Returns a stop signal for the task started by [`Self::spawn`].
    pub fn stopper(&self) -> FilterReloadStop {
        FilterReloadStop {
            shutdown: Arc::clone(&self.shutdown),
            wake: Arc::clone(&self.wake),
        }
    }

    /// Runs the reload loop on the current tokio runtime.
    pub fn spawn(mut self) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval_timer = tokio::time::interval(self.interval);
            interval_timer.tick().await; // skip immediate first tick

            loop {
                tokio::select! {
                    _ = interval_timer.tick() => {},
                    _ = self.wake.notified() => {},
                }
                if self.shutdown.load(Ordering::Acquire) {
                    break;
                }
                if let Err(e) = self.reload_if_changed() {
                    log::warn!("Field filter reload failed, keeping previous version: {}", e);
                }
            }
        })
    }
}

/// Stops a running [`FilterReloader`].
#[derive(Clone)]
pub struct FilterReloadStop {
    shutdown: Arc<AtomicBool>,
    wake: Arc<Notify>,
}

impl FilterReloadStop {
    pub fn stop(&self) {
        self.shutdown.store(true, Ordering::Release);
        self.wake.notify_one();
    }
}

//! Row-level filtering and transformation applied before insertion.

use std::path::PathBuf;

use thiserror::Error;

pub mod reload;
pub mod rules;

pub use reload::{FilterHandle, FilterReloadStop, FilterReloader, FilterSnapshot};
pub use rules::{FieldFilter, FieldFilterConfig, MatchRule, MissingFieldPolicy};

/// A CSV row keyed by header name.
pub type Record = serde_json::Map<String, serde_json::Value>;

/// A record failed validation and the policy says to fail.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransformError {
    #[error("Required field '{field}' is missing or empty")]
    MissingRequiredField { field: String },
}

/// Errors loading a filter definition.
#[derive(Error, Debug)]
pub enum FilterError {
    #[error("Failed to read filter file '{path}': {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse filter definition: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid regex for field '{field}': {source}")]
    InvalidRegex {
        field: String,
        #[source]
        source: regex::Error,
    },
}

/// Pure per-record policy.
pub trait RecordTransform: Send + Sync {
    /// Gate applied before [`Self::transform`]. `false` drops the record.
    fn filter(&self, _record: &Record) -> bool {
        true
    }

    /// `Ok(None)` drops the record; `Err` is a validation failure.
    fn transform(&self, record: Record) -> Result<Option<Record>, TransformError>;
}

/// Leaves every record untouched.
#[derive(Debug, Clone, Copy, Default)]
pub struct Passthrough;

impl RecordTransform for Passthrough {
    fn transform(&self, record: Record) -> Result<Option<Record>, TransformError> {
        Ok(Some(record))
    }
}

/// Runs the gate and the transform in order.
pub fn apply(
    transform: &dyn RecordTransform,
    record: Record,
) -> Result<Option<Record>, TransformError> {
    if !transform.filter(&record) {
        return Ok(None);
    }
    transform.transform(record)
}

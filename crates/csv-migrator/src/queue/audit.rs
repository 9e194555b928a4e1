//! Append-only audit trail of job lifecycle events.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::db::audit_repo::{self, AuditRow};
use crate::db::{Database, DatabaseError};

/// Every kind of entry the audit log records.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditAction {
    Upload,
    Start,
    Insert,
    Skip,
    Complete,
    Failed,
    Retry,
    Scheduled,
    ScheduledError,
    ScheduledSystemError,
    Pause,
    Resume,
    Requeue,
}

impl AuditAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditAction::Upload => "UPLOAD",
            AuditAction::Start => "START",
            AuditAction::Insert => "INSERT",
            AuditAction::Skip => "SKIP",
            AuditAction::Complete => "COMPLETE",
            AuditAction::Failed => "FAILED",
            AuditAction::Retry => "RETRY",
            AuditAction::Scheduled => "SCHEDULED",
            AuditAction::ScheduledError => "SCHEDULED_ERROR",
            AuditAction::ScheduledSystemError => "SCHEDULED_SYSTEM_ERROR",
            AuditAction::Pause => "PAUSE",
            AuditAction::Resume => "RESUME",
            AuditAction::Requeue => "REQUEUE",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        let action = match s {
            "UPLOAD" => AuditAction::Upload,
            "START" => AuditAction::Start,
            "INSERT" => AuditAction::Insert,
            "SKIP" => AuditAction::Skip,
            "COMPLETE" => AuditAction::Complete,
            "FAILED" => AuditAction::Failed,
            "RETRY" => AuditAction::Retry,
            "SCHEDULED" => AuditAction::Scheduled,
            "SCHEDULED_ERROR" => AuditAction::ScheduledError,
            "SCHEDULED_SYSTEM_ERROR" => AuditAction::ScheduledSystemError,
            "PAUSE" => AuditAction::Pause,
            "RESUME" => AuditAction::Resume,
            "REQUEUE" => AuditAction::Requeue,
            _ => return None,
        };
        Some(action)
    }
}

impl std::fmt::Display for AuditAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One audit log entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEntry {
    pub id: i64,
    pub action: AuditAction,
    pub job_id: Option<String>,
    pub meta: Value,
    pub timestamp: DateTime<Utc>,
}

impl TryFrom<AuditRow> for AuditEntry {
    type Error = DatabaseError;

    fn try_from(row: AuditRow) -> Result<Self, Self::Error> {
        let action = AuditAction::parse(&row.action).ok_or_else(|| DatabaseError::InvalidValue {
            column: "action",
            value: row.action.clone(),
        })?;
        let timestamp = DateTime::parse_from_rfc3339(&row.timestamp)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|_| DatabaseError::InvalidValue {
                column: "timestamp",
                value: row.timestamp.clone(),
            })?;
        Ok(Self {
            id: row.id,
            action,
            job_id: row.job_id,
            meta: serde_json::from_str(&row.meta)?,
            timestamp,
        })
    }
}

/// Write side of the audit log, plus the read helpers used by the CLI.
#[derive(Clone)]
pub struct AuditLog {
    db: Database,
}

impl AuditLog {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Appends an entry.
    pub fn record(
        &self,
        action: AuditAction,
        job_id: Option<&str>,
        meta: Value,
    ) -> Result<(), DatabaseError> {
        audit_repo::append(&self.db, action.as_str(), job_id, &meta)?;
        log::debug!(
            "audit {} job={}",
            action,
            job_id.unwrap_or("-")
        );
        Ok(())
    }

    /// Appends an entry, logging instead of returning a failure.
    ///
    /// Used for entries that follow a transition which already happened.
    pub fn record_best_effort(&self, action: AuditAction, job_id: Option<&str>, meta: Value) {
        if let Err(e) = self.record(action, job_id, meta) {
            log::error!(
                "Failed to write {} audit entry for job {}: {}",
                action,
                job_id.unwrap_or("-"),
                e
            );
        }
    }

    pub fn for_job(&self, job_id: &str) -> Result<Vec<AuditEntry>, DatabaseError> {
        audit_repo::list_for_job(&self.db, job_id)?
            .into_iter()
            .map(AuditEntry::try_from)
            .collect()
    }

    pub fn recent(&self, action: AuditAction, limit: u64) -> Result<Vec<AuditEntry>, DatabaseError> {
        audit_repo::list_by_action(&self.db, action.as_str(), limit)?
            .into_iter()
            .map(AuditEntry::try_from)
            .collect()
    }
}

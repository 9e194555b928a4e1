//! Audit log repository. Rows are only ever inserted.

use rusqlite::{params, Row};

use super::{now_timestamp, Database, DatabaseError};

/// A raw audit row from the database. `meta` is the JSON text as stored.
#[derive(Debug, Clone)]
pub struct AuditRow {
    pub id: i64,
    pub action: String,
    pub job_id: Option<String>,
    pub meta: String,
    pub timestamp: String,
}

impl AuditRow {
    fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            id: row.get("id")?,
            action: row.get("action")?,
            job_id: row.get("job_id")?,
            meta: row.get("meta")?,
            timestamp: row.get("timestamp")?,
        })
    }
}

/// Appends an entry and returns its row id.
pub fn append(
    db: &Database,
    action: &str,
    job_id: Option<&str>,
    meta: &serde_json::Value,
) -> Result<i64, DatabaseError> {
    let meta = serde_json::to_string(meta)?;
    let timestamp = now_timestamp();
    db.with_conn(|conn| {
        conn.execute(
            "INSERT INTO audit_log (action, job_id, meta, timestamp) VALUES (?1, ?2, ?3, ?4)",
            params![action, job_id, meta, timestamp],
        )?;
        Ok(conn.last_insert_rowid())
    })
}

/// Entries for one job in insertion order.
pub fn list_for_job(db: &Database, job_id: &str) -> Result<Vec<AuditRow>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt =
            conn.prepare("SELECT * FROM audit_log WHERE job_id = ?1 ORDER BY id ASC")?;
        let rows = stmt
            .query_map(params![job_id], AuditRow::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    })
}

/// Most recent entries with the given action, newest first.
pub fn list_by_action(
    db: &Database,
    action: &str,
    limit: u64,
) -> Result<Vec<AuditRow>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt = conn
            .prepare("SELECT * FROM audit_log WHERE action = ?1 ORDER BY id DESC LIMIT ?2")?;
        let rows = stmt
            .query_map(params![action, limit as i64], AuditRow::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_append_and_list() {
        let db = Database::open_in_memory().unwrap();
        append(&db, "UPLOAD", Some("job-1"), &json!({"filename": "a.csv"})).unwrap();
        append(&db, "START", Some("job-1"), &json!({})).unwrap();
        append(&db, "UPLOAD", Some("job-2"), &json!({})).unwrap();

        let rows = list_for_job(&db, "job-1").unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].action, "UPLOAD");
        assert_eq!(rows[1].action, "START");
        let meta: serde_json::Value = serde_json::from_str(&rows[0].meta).unwrap();
        assert_eq!(meta["filename"], "a.csv");
    }

    #[test]
    fn test_entries_without_job() {
        let db = Database::open_in_memory().unwrap();
        append(
            &db,
            "SCHEDULED_SYSTEM_ERROR",
            None,
            &json!({"error": "scan failed"}),
        )
        .unwrap();

        let rows = list_by_action(&db, "SCHEDULED_SYSTEM_ERROR", 10).unwrap();
        assert_eq!(rows.len(), 1);
        assert!(rows[0].job_id.is_none());
    }
}

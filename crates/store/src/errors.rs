//! Error journal; append, resolve, and spike analytics.

use rusqlite::params;

use crate::records::{ErrorEntry, Severity};
use crate::{Result, Store};

impl Store {
    pub fn log_error(&self, entry: &ErrorEntry) -> Result<i64> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO errors (severity, module, message, stack, context, resolved, ts)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    entry.severity.as_str(),
                    entry.module,
                    entry.message,
                    entry.stack,
                    entry.context,
                    entry.resolved as i64,
                    entry.ts,
                ],
            )?;
            Ok(conn.last_insert_rowid())
        })
    }

    pub fn mark_error_resolved(&self, id: i64) -> Result<bool> {
        self.with_conn(|conn| {
            let n = conn.execute("UPDATE errors SET resolved = 1 WHERE id = ?1", params![id])?;
            Ok(n > 0)
        })
    }

    pub fn unresolved_errors_since(&self, since_ms: i64) -> Result<Vec<ErrorEntry>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, severity, module, message, stack, context, resolved, ts
                 FROM errors WHERE resolved = 0 AND ts >= ?1 ORDER BY ts DESC",
            )?;
            let rows = stmt
                .query_map(params![since_ms], row_to_error)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    pub fn recent_errors(&self, limit: usize) -> Result<Vec<ErrorEntry>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, severity, module, message, stack, context, resolved, ts
                 FROM errors ORDER BY ts DESC LIMIT ?1",
            )?;
            let rows = stmt
                .query_map(params![limit as i64], row_to_error)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    /// Count of unresolved errors in the window, the error-spike detector's
    /// input.
    pub fn unresolved_error_count_since(&self, since_ms: i64) -> Result<i64> {
        self.with_conn(|conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM errors WHERE resolved = 0 AND ts >= ?1",
                params![since_ms],
                |row| row.get(0),
            )?;
            Ok(count)
        })
    }

    /// Per-module unresolved counts in the window, worst first.  Feeds the
    /// error-analytics prompt section.
    pub fn error_breakdown_since(&self, since_ms: i64) -> Result<Vec<(String, i64)>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT module, COUNT(*) AS n FROM errors
                 WHERE resolved = 0 AND ts >= ?1
                 GROUP BY module ORDER BY n DESC",
            )?;
            let rows = stmt
                .query_map(params![since_ms], |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }
}

fn row_to_error(row: &rusqlite::Row<'_>) -> rusqlite::Result<ErrorEntry> {
    let severity: String = row.get(1)?;
    Ok(ErrorEntry {
        id: row.get(0)?,
        severity: Severity::parse(&severity).unwrap_or(Severity::Error),
        module: row.get(2)?,
        message: row.get(3)?,
        stack: row.get(4)?,
        context: row.get(5)?,
        resolved: row.get::<_, i64>(6)? != 0,
        ts: row.get(7)?,
    })
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use crate::records::{ErrorEntry, Severity};
    use crate::test_store;

    fn entry(module: &str, ts: i64) -> ErrorEntry {
        ErrorEntry {
            id: 0,
            severity: Severity::Warning,
            module: module.into(),
            message: "boom".into(),
            stack: None,
            context: None,
            resolved: false,
            ts,
        }
    }

    #[test]
    fn resolve_removes_from_unresolved_count() {
        let store = test_store();
        let now = Utc::now().timestamp_millis();
        let id = store.log_error(&entry("llm", now)).unwrap();
        assert_eq!(store.unresolved_error_count_since(now - 1000).unwrap(), 1);

        assert!(store.mark_error_resolved(id).unwrap());
        assert_eq!(store.unresolved_error_count_since(now - 1000).unwrap(), 0);
    }

    #[test]
    fn breakdown_groups_by_module() {
        let store = test_store();
        let now = Utc::now().timestamp_millis();
        store.log_error(&entry("llm", now)).unwrap();
        store.log_error(&entry("llm", now)).unwrap();
        store.log_error(&entry("store", now)).unwrap();

        let breakdown = store.error_breakdown_since(now - 1000).unwrap();
        assert_eq!(breakdown[0], ("llm".to_string(), 2));
        assert_eq!(breakdown[1], ("store".to_string(), 1));
    }
}

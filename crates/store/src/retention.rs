//! Retention sweepers for the unbounded-growth tables.
//!
//! Driven by the weekly maintenance hook.  Each sweep is a size or age cap;
//! the caps are generous because the tables are cheap, but nothing is allowed
//! to grow forever.

use rusqlite::params;
use tracing::info;

use crate::{Result, Store};

const COSTS_MAX_AGE_DAYS: i64 = 90;
const ERRORS_RESOLVED_MAX_AGE_DAYS: i64 = 30;
const ERRORS_MAX_AGE_DAYS: i64 = 90;
const OUTCOMES_MAX_AGE_DAYS: i64 = 30;
const JOURNAL_MAX_ROWS: i64 = 200;
const MESSAGES_MAX_ROWS: i64 = 10_000;

#[derive(Debug, Default, Clone)]
pub struct RetentionReport {
    pub costs: usize,
    pub errors: usize,
    pub outcomes: usize,
    pub journal: usize,
    pub messages: usize,
}

impl RetentionReport {
    pub fn total(&self) -> usize {
        self.costs + self.errors + self.outcomes + self.journal + self.messages
    }
}

impl Store {
    pub fn run_retention(&self, now_ms: i64) -> Result<RetentionReport> {
        let day = 86_400_000;
        let mut report = RetentionReport::default();

        report.costs = self.with_conn(|conn| {
            Ok(conn.execute(
                "DELETE FROM costs WHERE ts < ?1",
                params![now_ms - COSTS_MAX_AGE_DAYS * day],
            )?)
        })?;

        report.errors = self.with_conn(|conn| {
            let resolved = conn.execute(
                "DELETE FROM errors WHERE resolved = 1 AND ts < ?1",
                params![now_ms - ERRORS_RESOLVED_MAX_AGE_DAYS * day],
            )?;
            let aged = conn.execute(
                "DELETE FROM errors WHERE ts < ?1",
                params![now_ms - ERRORS_MAX_AGE_DAYS * day],
            )?;
            Ok(resolved + aged)
        })?;

        report.outcomes = self.with_conn(|conn| {
            Ok(conn.execute(
                "DELETE FROM reply_outcomes WHERE ts < ?1",
                params![now_ms - OUTCOMES_MAX_AGE_DAYS * day],
            )?)
        })?;

        // Row-capped tables keep the newest rows.
        report.journal = self.with_conn(|conn| {
            Ok(conn.execute(
                "DELETE FROM reasoning_journal WHERE id NOT IN (
                     SELECT id FROM reasoning_journal ORDER BY ts DESC LIMIT ?1
                 )",
                params![JOURNAL_MAX_ROWS],
            )?)
        })?;

        report.messages = self.with_conn(|conn| {
            Ok(conn.execute(
                "DELETE FROM messages WHERE id NOT IN (
                     SELECT id FROM messages ORDER BY ts DESC LIMIT ?1
                 )",
                params![MESSAGES_MAX_ROWS],
            )?)
        })?;

        if report.total() > 0 {
            info!(
                costs = report.costs,
                errors = report.errors,
                outcomes = report.outcomes,
                journal = report.journal,
                messages = report.messages,
                "retention sweep complete"
            );
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use crate::records::{CostEntry, ReasoningEntry, ReasoningKind};
    use crate::test_store;

    #[test]
    fn old_costs_are_swept() {
        let store = test_store();
        let now = 200 * 86_400_000;
        store
            .insert_cost(&CostEntry {
                id: 0,
                kind: "proactive".into(),
                model: "cheap".into(),
                input_tokens: 0,
                output_tokens: 0,
                cache_read: 0,
                cost_usd: 1.0,
                duration_ms: 0,
                session_id: None,
                cron_id: None,
                ts: 10,
            })
            .unwrap();

        let report = store.run_retention(now).unwrap();
        assert_eq!(report.costs, 1);
        assert_eq!(store.costs_since(0).unwrap().len(), 0);
    }

    #[test]
    fn journal_keeps_newest_rows() {
        let store = test_store();
        for i in 0..250 {
            store
                .insert_reasoning(&ReasoningEntry {
                    id: format!("r{i}"),
                    kind: ReasoningKind::Evidence,
                    content: "x".into(),
                    confidence: 0.5,
                    status: "open".into(),
                    related_id: None,
                    ts: i,
                })
                .unwrap();
        }

        let report = store.run_retention(0).unwrap();
        assert_eq!(report.journal, 50);
    }
}

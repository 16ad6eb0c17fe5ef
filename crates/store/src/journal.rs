//! Reasoning journal; hypotheses, learned rules, evidence, and outcomes.

use rusqlite::params;

use crate::records::{ReasoningEntry, ReasoningKind};
use crate::{Result, Store};

impl Store {
    pub fn insert_reasoning(&self, entry: &ReasoningEntry) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO reasoning_journal (id, kind, content, confidence, status,
                                                related_id, ts)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    entry.id,
                    entry.kind.as_str(),
                    entry.content,
                    entry.confidence,
                    entry.status,
                    entry.related_id,
                    entry.ts,
                ],
            )?;
            Ok(())
        })
    }

    pub fn close_reasoning(&self, id: &str) -> Result<bool> {
        self.with_conn(|conn| {
            let n = conn.execute(
                "UPDATE reasoning_journal SET status = 'closed' WHERE id = ?1",
                params![id],
            )?;
            Ok(n > 0)
        })
    }

    /// Open hypotheses, newest first; the "what am I currently wondering"
    /// prompt section.
    pub fn open_hypotheses(&self, limit: usize) -> Result<Vec<ReasoningEntry>> {
        self.reasoning_query(
            "WHERE kind = 'hypothesis' AND status = 'open' ORDER BY ts DESC LIMIT ?1",
            limit,
        )
    }

    /// Highest-confidence learned rules; the learning-context prompt section.
    pub fn top_rules(&self, limit: usize) -> Result<Vec<ReasoningEntry>> {
        self.reasoning_query(
            "WHERE kind = 'rule' ORDER BY confidence DESC, ts DESC LIMIT ?1",
            limit,
        )
    }

    pub fn reasoning_for(&self, related_id: &str) -> Result<Vec<ReasoningEntry>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "{JOURNAL_SELECT} WHERE related_id = ?1 ORDER BY ts ASC"
            ))?;
            let rows = stmt
                .query_map(params![related_id], row_to_reasoning)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    fn reasoning_query(&self, tail: &str, limit: usize) -> Result<Vec<ReasoningEntry>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!("{JOURNAL_SELECT} {tail}"))?;
            let rows = stmt
                .query_map(params![limit as i64], row_to_reasoning)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }
}

const JOURNAL_SELECT: &str =
    "SELECT id, kind, content, confidence, status, related_id, ts FROM reasoning_journal";

fn row_to_reasoning(row: &rusqlite::Row<'_>) -> rusqlite::Result<ReasoningEntry> {
    let kind: String = row.get(1)?;
    Ok(ReasoningEntry {
        id: row.get(0)?,
        kind: ReasoningKind::parse(&kind).unwrap_or(ReasoningKind::Evidence),
        content: row.get(2)?,
        confidence: row.get(3)?,
        status: row.get(4)?,
        related_id: row.get(5)?,
        ts: row.get(6)?,
    })
}

#[cfg(test)]
mod tests {
    use crate::records::{ReasoningEntry, ReasoningKind};
    use crate::test_store;

    fn entry(id: &str, kind: ReasoningKind, confidence: f64) -> ReasoningEntry {
        ReasoningEntry {
            id: id.into(),
            kind,
            content: format!("entry {id}"),
            confidence,
            status: "open".into(),
            related_id: None,
            ts: 1_000,
        }
    }

    #[test]
    fn top_rules_sorted_by_confidence() {
        let store = test_store();
        store
            .insert_reasoning(&entry("r1", ReasoningKind::Rule, 0.4))
            .unwrap();
        store
            .insert_reasoning(&entry("r2", ReasoningKind::Rule, 0.9))
            .unwrap();
        store
            .insert_reasoning(&entry("h1", ReasoningKind::Hypothesis, 0.5))
            .unwrap();

        let rules = store.top_rules(5).unwrap();
        assert_eq!(rules.len(), 2);
        assert_eq!(rules[0].id, "r2");
    }

    #[test]
    fn closed_hypotheses_drop_out() {
        let store = test_store();
        store
            .insert_reasoning(&entry("h1", ReasoningKind::Hypothesis, 0.5))
            .unwrap();
        assert_eq!(store.open_hypotheses(5).unwrap().len(), 1);

        store.close_reasoning("h1").unwrap();
        assert!(store.open_hypotheses(5).unwrap().is_empty());
    }
}

//! Capability gaps; unmet requests accumulating toward a skill proposal.

use rusqlite::{OptionalExtension, params};

use crate::records::{CapabilityGap, GapStatus};
use crate::{Result, Store};

impl Store {
    /// Record one more occurrence of a gap on `topic`, creating the row on
    /// first sight.  Returns the row after the bump.
    pub fn bump_capability_gap(
        &self,
        id: &str,
        topic: &str,
        description: &str,
        now_ms: i64,
    ) -> Result<CapabilityGap> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO capability_gaps
                     (id, description, topic, occurrences, first_seen, last_seen, status)
                 VALUES (?1, ?2, ?3, 1, ?4, ?4, 'detected')
                 ON CONFLICT(id) DO UPDATE SET
                     occurrences = capability_gaps.occurrences + 1,
                     last_seen = ?4,
                     description = excluded.description",
                params![id, description, topic, now_ms],
            )?;
            Ok(())
        })?;
        self.get_capability_gap(id)?
            .ok_or_else(|| crate::StoreError::Policy(format!("gap {id} vanished after upsert")))
    }

    pub fn get_capability_gap(&self, id: &str) -> Result<Option<CapabilityGap>> {
        self.with_conn(|conn| {
            let gap = conn
                .query_row(&format!("{GAP_SELECT} WHERE id = ?1"), params![id], row_to_gap)
                .optional()?;
            Ok(gap)
        })
    }

    pub fn set_gap_status(
        &self,
        id: &str,
        status: GapStatus,
        skill_slug: Option<&str>,
    ) -> Result<bool> {
        self.with_conn(|conn| {
            let n = conn.execute(
                "UPDATE capability_gaps SET status = ?2, skill_slug = COALESCE(?3, skill_slug)
                 WHERE id = ?1",
                params![id, status.as_str(), skill_slug],
            )?;
            Ok(n > 0)
        })
    }

    /// Gaps ripe for promotion: still `detected` with occurrences at or past
    /// the threshold.
    pub fn promotable_gaps(&self, min_occurrences: i64) -> Result<Vec<CapabilityGap>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "{GAP_SELECT} WHERE status = 'detected' AND occurrences >= ?1
                 ORDER BY occurrences DESC"
            ))?;
            let rows = stmt
                .query_map(params![min_occurrences], row_to_gap)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }
}

const GAP_SELECT: &str =
    "SELECT id, description, topic, occurrences, first_seen, last_seen, status, skill_slug
     FROM capability_gaps";

fn row_to_gap(row: &rusqlite::Row<'_>) -> rusqlite::Result<CapabilityGap> {
    let status: String = row.get(6)?;
    Ok(CapabilityGap {
        id: row.get(0)?,
        description: row.get(1)?,
        topic: row.get(2)?,
        occurrences: row.get(3)?,
        first_seen: row.get(4)?,
        last_seen: row.get(5)?,
        status: GapStatus::parse(&status).unwrap_or(GapStatus::Detected),
        skill_slug: row.get(7)?,
    })
}

#[cfg(test)]
mod tests {
    use crate::records::GapStatus;
    use crate::test_store;

    #[test]
    fn three_bumps_make_a_gap_promotable() {
        let store = test_store();
        for i in 0..3 {
            store
                .bump_capability_gap("gap:crypto", "crypto prices", "asked for BTC price", i)
                .unwrap();
        }

        let ripe = store.promotable_gaps(3).unwrap();
        assert_eq!(ripe.len(), 1);
        assert_eq!(ripe[0].occurrences, 3);

        store
            .set_gap_status("gap:crypto", GapStatus::Proposed, Some("crypto-prices"))
            .unwrap();
        assert!(store.promotable_gaps(3).unwrap().is_empty());
    }
}

//! Cost bookkeeping queries.
//!
//! Day buckets come from the configured timezone's local day string; the
//! daily budget gate reads the sum since local midnight.

use std::collections::BTreeMap;

use chrono::{TimeZone, Utc};
use rusqlite::{OptionalExtension, params};

use crate::records::CostEntry;
use crate::{Result, Store};

impl Store {
    pub fn insert_cost(&self, entry: &CostEntry) -> Result<i64> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO costs (kind, model, input_tokens, output_tokens, cache_read,
                                    cost_usd, duration_ms, session_id, cron_id, ts)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    entry.kind,
                    entry.model,
                    entry.input_tokens,
                    entry.output_tokens,
                    entry.cache_read,
                    entry.cost_usd,
                    entry.duration_ms,
                    entry.session_id,
                    entry.cron_id,
                    entry.ts,
                ],
            )?;
            Ok(conn.last_insert_rowid())
        })
    }

    pub fn bulk_insert_costs(&self, entries: &[CostEntry]) -> Result<usize> {
        for entry in entries {
            self.insert_cost(entry)?;
        }
        Ok(entries.len())
    }

    pub fn costs_since(&self, since_ms: i64) -> Result<Vec<CostEntry>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, kind, model, input_tokens, output_tokens, cache_read,
                        cost_usd, duration_ms, session_id, cron_id, ts
                 FROM costs WHERE ts >= ?1 ORDER BY ts ASC",
            )?;
            let rows = stmt
                .query_map(params![since_ms], row_to_cost)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    pub fn total_cost_since(&self, since_ms: i64) -> Result<f64> {
        self.with_conn(|conn| {
            let total: f64 = conn.query_row(
                "SELECT COALESCE(SUM(cost_usd), 0) FROM costs WHERE ts >= ?1",
                params![since_ms],
                |row| row.get(0),
            )?;
            Ok(total)
        })
    }

    /// Total spend since local midnight in the configured timezone.
    pub fn cost_today(&self) -> Result<f64> {
        self.total_cost_since(self.start_of_local_day_ms())
    }

    /// Per-day totals for the trailing `days` window, keyed by the local day
    /// string.  Grouping happens on the formatted local day, never on a UTC
    /// truncation of the timestamp.
    pub fn cost_by_day(&self, days: i64) -> Result<BTreeMap<String, f64>> {
        let since = Utc::now().timestamp_millis() - days * 86_400_000;
        let entries = self.costs_since(since)?;
        let mut buckets = BTreeMap::new();
        for entry in entries {
            let Some(at) = Utc.timestamp_millis_opt(entry.ts).single() else {
                continue;
            };
            let day = self.clock().day_key(at);
            *buckets.entry(day).or_insert(0.0) += entry.cost_usd;
        }
        Ok(buckets)
    }

    /// Earliest recorded timestamp, for backfill bounds.
    pub fn earliest_cost_ts(&self) -> Result<Option<i64>> {
        self.with_conn(|conn| {
            let ts = conn
                .query_row("SELECT MIN(ts) FROM costs", [], |row| {
                    row.get::<_, Option<i64>>(0)
                })
                .optional()?
                .flatten();
            Ok(ts)
        })
    }

    pub(crate) fn start_of_local_day_ms(&self) -> i64 {
        let now = self.clock().now();
        now.date_naive()
            .and_hms_opt(0, 0, 0)
            .and_then(|midnight| self.clock().tz().from_local_datetime(&midnight).earliest())
            .map(|dt| dt.timestamp_millis())
            .unwrap_or_else(|| now.timestamp_millis())
    }
}

fn row_to_cost(row: &rusqlite::Row<'_>) -> rusqlite::Result<CostEntry> {
    Ok(CostEntry {
        id: row.get(0)?,
        kind: row.get(1)?,
        model: row.get(2)?,
        input_tokens: row.get(3)?,
        output_tokens: row.get(4)?,
        cache_read: row.get(5)?,
        cost_usd: row.get(6)?,
        duration_ms: row.get(7)?,
        session_id: row.get(8)?,
        cron_id: row.get(9)?,
        ts: row.get(10)?,
    })
}

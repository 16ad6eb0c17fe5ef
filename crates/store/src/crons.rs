//! Scheduled-job rows, read by the cron detectors.

use rusqlite::{OptionalExtension, params};

use crate::records::{CronJob, CronState};
use crate::{Result, Store};

impl Store {
    pub fn upsert_cron(&self, job: &CronJob) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO crons (id, name, enabled, schedule, tz, prompt, delivery, model,
                                    last_run, next_run, consecutive_errors)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
                 ON CONFLICT(id) DO UPDATE SET
                     name = excluded.name,
                     enabled = excluded.enabled,
                     schedule = excluded.schedule,
                     tz = excluded.tz,
                     prompt = excluded.prompt,
                     delivery = excluded.delivery,
                     model = excluded.model",
                params![
                    job.id,
                    job.name,
                    job.enabled as i64,
                    job.schedule,
                    job.tz,
                    job.prompt,
                    job.delivery,
                    job.model,
                    job.state.last_run,
                    job.state.next_run,
                    job.state.consecutive_errors,
                ],
            )?;
            Ok(())
        })
    }

    pub fn get_cron(&self, id: &str) -> Result<Option<CronJob>> {
        self.with_conn(|conn| {
            let job = conn
                .query_row(
                    &format!("{CRON_SELECT} WHERE id = ?1"),
                    params![id],
                    row_to_cron,
                )
                .optional()?;
            Ok(job)
        })
    }

    pub fn enabled_crons(&self) -> Result<Vec<CronJob>> {
        self.with_conn(|conn| {
            let mut stmt =
                conn.prepare(&format!("{CRON_SELECT} WHERE enabled = 1 ORDER BY id"))?;
            let rows = stmt
                .query_map([], row_to_cron)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    pub fn update_cron_state(&self, id: &str, state: &CronState) -> Result<bool> {
        self.with_conn(|conn| {
            let n = conn.execute(
                "UPDATE crons SET last_run = ?2, next_run = ?3, consecutive_errors = ?4
                 WHERE id = ?1",
                params![id, state.last_run, state.next_run, state.consecutive_errors],
            )?;
            Ok(n > 0)
        })
    }
}

const CRON_SELECT: &str = "SELECT id, name, enabled, schedule, tz, prompt, delivery, model,
                                  last_run, next_run, consecutive_errors
                           FROM crons";

fn row_to_cron(row: &rusqlite::Row<'_>) -> rusqlite::Result<CronJob> {
    Ok(CronJob {
        id: row.get(0)?,
        name: row.get(1)?,
        enabled: row.get::<_, i64>(2)? != 0,
        schedule: row.get(3)?,
        tz: row.get(4)?,
        prompt: row.get(5)?,
        delivery: row.get(6)?,
        model: row.get(7)?,
        state: CronState {
            last_run: row.get(8)?,
            next_run: row.get(9)?,
            consecutive_errors: row.get(10)?,
        },
    })
}

#[cfg(test)]
mod tests {
    use crate::records::{CronJob, CronState};
    use crate::test_store;

    #[test]
    fn upsert_preserves_state_on_definition_change() {
        let store = test_store();
        let mut job = CronJob {
            id: "daily-brief".into(),
            name: "Daily briefing".into(),
            enabled: true,
            schedule: "0 8 * * *".into(),
            tz: "UTC".into(),
            prompt: "summarize my day".into(),
            delivery: "message".into(),
            model: None,
            state: CronState::default(),
        };
        store.upsert_cron(&job).unwrap();
        store
            .update_cron_state(
                "daily-brief",
                &CronState {
                    last_run: Some(123),
                    next_run: Some(456),
                    consecutive_errors: 2,
                },
            )
            .unwrap();

        job.prompt = "summarize my week".into();
        store.upsert_cron(&job).unwrap();

        let loaded = store.get_cron("daily-brief").unwrap().unwrap();
        assert_eq!(loaded.prompt, "summarize my week");
        assert_eq!(loaded.state.consecutive_errors, 2);
        assert_eq!(loaded.state.last_run, Some(123));
    }
}

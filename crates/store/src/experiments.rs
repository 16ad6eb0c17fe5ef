//! Experiment rows.
//!
//! The store enforces the terminal-immutability invariant: once a row is
//! concluded or reverted, the only writable field is `conclusion`.

use rusqlite::{OptionalExtension, params};

use crate::records::{Experiment, ExperimentMetric, ExperimentStatus};
use crate::{Result, Store, StoreError};

impl Store {
    pub fn insert_experiment(&self, exp: &Experiment) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO experiments (id, name, hypothesis, metric, baseline_value,
                                          current_value, duration_hours, revert_threshold,
                                          status, change_description, revert_action, conclusion,
                                          reasoning_id, started_at, concluded_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
                params![
                    exp.id,
                    exp.name,
                    exp.hypothesis,
                    exp.metric.as_str(),
                    exp.baseline_value,
                    exp.current_value,
                    exp.duration_hours,
                    exp.revert_threshold,
                    exp.status.as_str(),
                    exp.change_description,
                    exp.revert_action,
                    exp.conclusion,
                    exp.reasoning_id,
                    exp.started_at,
                    exp.concluded_at,
                ],
            )?;
            Ok(())
        })
    }

    /// Full-row update, rejected once the stored row is terminal.
    pub fn update_experiment(&self, exp: &Experiment) -> Result<()> {
        let Some(existing) = self.get_experiment(&exp.id)? else {
            return Err(StoreError::Policy(format!("unknown experiment {}", exp.id)));
        };
        if existing.status.is_terminal() {
            return Err(StoreError::Policy(format!(
                "experiment {} is {} and immutable",
                exp.id,
                existing.status.as_str()
            )));
        }

        self.with_conn(|conn| {
            conn.execute(
                "UPDATE experiments SET name = ?2, hypothesis = ?3, metric = ?4,
                        baseline_value = ?5, current_value = ?6, duration_hours = ?7,
                        revert_threshold = ?8, status = ?9, change_description = ?10,
                        revert_action = ?11, conclusion = ?12, reasoning_id = ?13,
                        started_at = ?14, concluded_at = ?15
                 WHERE id = ?1",
                params![
                    exp.id,
                    exp.name,
                    exp.hypothesis,
                    exp.metric.as_str(),
                    exp.baseline_value,
                    exp.current_value,
                    exp.duration_hours,
                    exp.revert_threshold,
                    exp.status.as_str(),
                    exp.change_description,
                    exp.revert_action,
                    exp.conclusion,
                    exp.reasoning_id,
                    exp.started_at,
                    exp.concluded_at,
                ],
            )?;
            Ok(())
        })
    }

    /// The one write allowed on a terminal row.
    pub fn set_experiment_conclusion(&self, id: &str, conclusion: &str) -> Result<bool> {
        self.with_conn(|conn| {
            let n = conn.execute(
                "UPDATE experiments SET conclusion = ?2 WHERE id = ?1",
                params![id, conclusion],
            )?;
            Ok(n > 0)
        })
    }

    pub fn get_experiment(&self, id: &str) -> Result<Option<Experiment>> {
        self.with_conn(|conn| {
            let exp = conn
                .query_row(
                    &format!("{EXPERIMENT_SELECT} WHERE id = ?1"),
                    params![id],
                    row_to_experiment,
                )
                .optional()?;
            Ok(exp)
        })
    }

    pub fn experiments_with_status(&self, status: ExperimentStatus) -> Result<Vec<Experiment>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "{EXPERIMENT_SELECT} WHERE status = ?1 ORDER BY started_at ASC"
            ))?;
            let rows = stmt
                .query_map(params![status.as_str()], row_to_experiment)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    pub fn all_experiments(&self) -> Result<Vec<Experiment>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!("{EXPERIMENT_SELECT} ORDER BY id"))?;
            let rows = stmt
                .query_map([], row_to_experiment)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }
}

const EXPERIMENT_SELECT: &str =
    "SELECT id, name, hypothesis, metric, baseline_value, current_value, duration_hours,
            revert_threshold, status, change_description, revert_action, conclusion,
            reasoning_id, started_at, concluded_at
     FROM experiments";

fn row_to_experiment(row: &rusqlite::Row<'_>) -> rusqlite::Result<Experiment> {
    let metric: String = row.get(3)?;
    let status: String = row.get(8)?;
    Ok(Experiment {
        id: row.get(0)?,
        name: row.get(1)?,
        hypothesis: row.get(2)?,
        metric: ExperimentMetric::parse(&metric).unwrap_or(ExperimentMetric::PositiveRate),
        baseline_value: row.get(4)?,
        current_value: row.get(5)?,
        duration_hours: row.get(6)?,
        revert_threshold: row.get(7)?,
        status: ExperimentStatus::parse(&status).unwrap_or(ExperimentStatus::Pending),
        change_description: row.get(9)?,
        revert_action: row.get(10)?,
        conclusion: row.get(11)?,
        reasoning_id: row.get(12)?,
        started_at: row.get(13)?,
        concluded_at: row.get(14)?,
    })
}

#[cfg(test)]
mod tests {
    use crate::records::{Experiment, ExperimentMetric, ExperimentStatus};
    use crate::{StoreError, test_store};

    fn experiment(id: &str, status: ExperimentStatus) -> Experiment {
        Experiment {
            id: id.into(),
            name: "shorter briefings".into(),
            hypothesis: "shorter briefings get more positive replies".into(),
            metric: ExperimentMetric::PositiveRate,
            baseline_value: Some(0.6),
            current_value: None,
            duration_hours: 48.0,
            revert_threshold: 0.8,
            status,
            change_description: "cap briefings at 3 lines".into(),
            revert_action: Some("restore briefing length".into()),
            conclusion: None,
            reasoning_id: None,
            started_at: Some(1_000),
            concluded_at: None,
        }
    }

    #[test]
    fn terminal_row_rejects_updates() {
        let store = test_store();
        let mut exp = experiment("e1", ExperimentStatus::Concluded);
        store.insert_experiment(&exp).unwrap();

        exp.current_value = Some(0.9);
        let err = store.update_experiment(&exp).unwrap_err();
        assert!(matches!(err, StoreError::Policy(_)));

        // The conclusion column stays writable.
        assert!(store.set_experiment_conclusion("e1", "held up").unwrap());
        let loaded = store.get_experiment("e1").unwrap().unwrap();
        assert_eq!(loaded.conclusion.as_deref(), Some("held up"));
        assert_eq!(loaded.current_value, None);
    }

    #[test]
    fn running_row_accepts_updates() {
        let store = test_store();
        let mut exp = experiment("e2", ExperimentStatus::Running);
        store.insert_experiment(&exp).unwrap();

        exp.current_value = Some(0.55);
        store.update_experiment(&exp).unwrap();
        let loaded = store.get_experiment("e2").unwrap().unwrap();
        assert_eq!(loaded.current_value, Some(0.55));
    }

    #[test]
    fn status_filter_returns_matching_rows() {
        let store = test_store();
        store
            .insert_experiment(&experiment("e1", ExperimentStatus::Running))
            .unwrap();
        store
            .insert_experiment(&experiment("e2", ExperimentStatus::Pending))
            .unwrap();

        let running = store
            .experiments_with_status(ExperimentStatus::Running)
            .unwrap();
        assert_eq!(running.len(), 1);
        assert_eq!(running[0].id, "e1");
    }
}

//! Goal persistence.  Status DAG enforcement lives with the dispatcher; the
//! store is the dumb, durable side.

use rusqlite::{OptionalExtension, params};
use tracing::warn;

use crate::records::{Goal, GoalStatus, Milestone};
use crate::{Result, Store};

impl Store {
    pub fn insert_goal(&self, goal: &Goal) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO goals (id, title, description, status, priority, progress,
                                    milestones, log, linked_topics, category, parent_goal_id,
                                    created_at, updated_at, completed_at, deadline)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
                params![
                    goal.id,
                    goal.title,
                    goal.description,
                    goal.status.as_str(),
                    goal.priority,
                    goal.progress as i64,
                    encode_json(&goal.milestones),
                    encode_json(&goal.log),
                    encode_json(&goal.linked_topics),
                    goal.category,
                    goal.parent_goal_id,
                    goal.created_at,
                    goal.updated_at,
                    goal.completed_at,
                    goal.deadline,
                ],
            )?;
            Ok(())
        })
    }

    pub fn update_goal(&self, goal: &Goal) -> Result<bool> {
        self.with_conn(|conn| {
            let n = conn.execute(
                "UPDATE goals SET title = ?2, description = ?3, status = ?4, priority = ?5,
                                  progress = ?6, milestones = ?7, log = ?8, linked_topics = ?9,
                                  category = ?10, parent_goal_id = ?11, updated_at = ?12,
                                  completed_at = ?13, deadline = ?14
                 WHERE id = ?1",
                params![
                    goal.id,
                    goal.title,
                    goal.description,
                    goal.status.as_str(),
                    goal.priority,
                    goal.progress as i64,
                    encode_json(&goal.milestones),
                    encode_json(&goal.log),
                    encode_json(&goal.linked_topics),
                    goal.category,
                    goal.parent_goal_id,
                    goal.updated_at,
                    goal.completed_at,
                    goal.deadline,
                ],
            )?;
            Ok(n > 0)
        })
    }

    pub fn get_goal(&self, id: &str) -> Result<Option<Goal>> {
        self.with_conn(|conn| {
            let goal = conn
                .query_row(
                    &format!("{GOAL_SELECT} WHERE id = ?1"),
                    params![id],
                    row_to_goal,
                )
                .optional()?;
            Ok(goal)
        })
    }

    /// Goals that are candidates for cycle attention (active-ish statuses).
    pub fn active_goals(&self) -> Result<Vec<Goal>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "{GOAL_SELECT} WHERE status IN ('active', 'in_progress', 'blocked')
                 ORDER BY priority DESC, updated_at ASC"
            ))?;
            let rows = stmt
                .query_map([], row_to_goal)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    pub fn all_goals(&self) -> Result<Vec<Goal>> {
        self.with_conn(|conn| {
            let mut stmt =
                conn.prepare(&format!("{GOAL_SELECT} ORDER BY created_at ASC"))?;
            let rows = stmt
                .query_map([], row_to_goal)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }
}

const GOAL_SELECT: &str = "SELECT id, title, description, status, priority, progress, milestones,
                                  log, linked_topics, category, parent_goal_id, created_at,
                                  updated_at, completed_at, deadline
                           FROM goals";

fn encode_json<T: serde::Serialize>(value: &T) -> String {
    serde_json::to_string(value).unwrap_or_else(|_| "[]".to_string())
}

fn decode_json_list<T: serde::de::DeserializeOwned>(raw: &str, what: &str) -> Vec<T> {
    serde_json::from_str(raw).unwrap_or_else(|err| {
        warn!(%err, what, "undecodable goal column treated as empty");
        Vec::new()
    })
}

fn row_to_goal(row: &rusqlite::Row<'_>) -> rusqlite::Result<Goal> {
    let status: String = row.get(3)?;
    let milestones: String = row.get(6)?;
    let log: String = row.get(7)?;
    let linked: String = row.get(8)?;
    Ok(Goal {
        id: row.get(0)?,
        title: row.get(1)?,
        description: row.get(2)?,
        status: GoalStatus::parse(&status).unwrap_or(GoalStatus::Proposed),
        priority: row.get(4)?,
        progress: row.get::<_, i64>(5)?.clamp(0, 100) as u8,
        milestones: decode_json_list::<Milestone>(&milestones, "milestones"),
        log: decode_json_list::<String>(&log, "log"),
        linked_topics: decode_json_list::<String>(&linked, "linked_topics"),
        category: row.get(9)?,
        parent_goal_id: row.get(10)?,
        created_at: row.get(11)?,
        updated_at: row.get(12)?,
        completed_at: row.get(13)?,
        deadline: row.get(14)?,
    })
}

#[cfg(test)]
mod tests {
    use crate::records::{Goal, GoalStatus, Milestone, MilestoneStatus};
    use crate::test_store;

    #[test]
    fn goal_round_trips_with_milestones() {
        let store = test_store();
        let mut goal = Goal::new("g1", "ship the thing", 1_000);
        goal.status = GoalStatus::Active;
        goal.milestones = vec![
            Milestone {
                id: "m1".into(),
                title: "draft".into(),
                status: MilestoneStatus::Completed,
                evidence: Some("pr merged".into()),
            },
            Milestone {
                id: "m2".into(),
                title: "review".into(),
                status: MilestoneStatus::Pending,
                evidence: None,
            },
        ];
        goal.recompute_progress();
        store.insert_goal(&goal).unwrap();

        let loaded = store.get_goal("g1").unwrap().unwrap();
        assert_eq!(loaded.progress, 50);
        assert_eq!(loaded.milestones.len(), 2);
        assert_eq!(loaded.status, GoalStatus::Active);
    }

    #[test]
    fn active_goals_exclude_terminal_statuses() {
        let store = test_store();
        let mut active = Goal::new("g1", "alive", 0);
        active.status = GoalStatus::InProgress;
        let mut done = Goal::new("g2", "finished", 0);
        done.status = GoalStatus::Completed;
        store.insert_goal(&active).unwrap();
        store.insert_goal(&done).unwrap();

        let goals = store.active_goals().unwrap();
        assert_eq!(goals.len(), 1);
        assert_eq!(goals[0].id, "g1");
    }

    #[test]
    fn milestone_progress_rounds() {
        let mut goal = Goal::new("g", "thirds", 0);
        goal.milestones = (0..3)
            .map(|i| Milestone {
                id: format!("m{i}"),
                title: format!("step {i}"),
                status: if i == 0 {
                    MilestoneStatus::Completed
                } else {
                    MilestoneStatus::Pending
                },
                evidence: None,
            })
            .collect();
        goal.recompute_progress();
        assert_eq!(goal.progress, 33);
    }
}

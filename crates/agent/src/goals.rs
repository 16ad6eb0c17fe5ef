//! Goal transition rules and milestone completion.
//!
//! Transitions follow a fixed DAG; completed and abandoned are terminal.
//! Illegal requests are policy errors; the dispatcher logs and skips them,
//! nothing ever throws across the boundary.

use tracing::info;

use vigil_store::{Goal, GoalStatus, MilestoneStatus};

use crate::parser::{GoalUpdateTag, MilestoneTag};

/// The allowed edges.  Requesting the current status again is a no-op and
/// always allowed.
pub fn transition_allowed(from: GoalStatus, to: GoalStatus) -> bool {
    use GoalStatus::*;
    if from == to {
        return true;
    }
    match (from, to) {
        // Abandonment is reachable from any live status.
        (Proposed | Active | InProgress | Blocked, Abandoned) => true,
        (Proposed, Active) => true,
        (Active, InProgress) => true,
        (InProgress, Blocked) | (InProgress, Completed) => true,
        (Blocked, InProgress) => true,
        _ => false,
    }
}

/// Apply a `goal_update` tag.  Returns a policy-error description when the
/// update was (partly) refused; the goal is only mutated by legal parts.
pub fn apply_goal_update(
    goal: &mut Goal,
    tag: &GoalUpdateTag,
    now_ms: i64,
) -> Result<(), String> {
    if goal.status.is_terminal() {
        return Err(format!(
            "goal {} is {} and immutable",
            goal.id,
            goal.status.as_str()
        ));
    }

    if let Some(requested) = &tag.status {
        let Some(to) = GoalStatus::parse(requested) else {
            return Err(format!("unknown goal status \"{requested}\""));
        };
        if !transition_allowed(goal.status, to) {
            return Err(format!(
                "illegal transition {} → {} on goal {}",
                goal.status.as_str(),
                to.as_str(),
                goal.id
            ));
        }
        goal.status = to;
        if to == GoalStatus::Completed {
            goal.completed_at = Some(now_ms);
            goal.progress = 100;
        }
    }

    if let Some(progress) = tag.progress {
        // Milestone-backed progress is derived, never set by hand.
        if goal.milestones.is_empty() {
            goal.progress = progress.min(100);
        } else {
            info!(goal = %goal.id, "manual progress ignored on milestone-backed goal");
        }
    }

    if !tag.note.is_empty() {
        goal.log.push(tag.note.clone());
    }
    goal.updated_at = now_ms;
    Ok(())
}

/// Complete a milestone matched by exact id, falling back to a
/// case-insensitive substring of its title.  Recomputes progress and
/// auto-completes the goal when every milestone is done.
pub fn complete_milestone(
    goal: &mut Goal,
    tag: &MilestoneTag,
    now_ms: i64,
) -> Result<(), String> {
    if goal.status.is_terminal() {
        return Err(format!(
            "goal {} is {} and immutable",
            goal.id,
            goal.status.as_str()
        ));
    }

    let needle = tag.milestone.to_lowercase();
    let position = goal
        .milestones
        .iter()
        .position(|m| m.id == tag.milestone)
        .or_else(|| {
            goal.milestones
                .iter()
                .position(|m| m.title.to_lowercase().contains(&needle))
        });
    let Some(index) = position else {
        return Err(format!(
            "no milestone matching \"{}\" on goal {}",
            tag.milestone, goal.id
        ));
    };

    let milestone = &mut goal.milestones[index];
    milestone.status = MilestoneStatus::Completed;
    if !tag.evidence.is_empty() {
        milestone.evidence = Some(tag.evidence.clone());
    }

    goal.recompute_progress();
    goal.updated_at = now_ms;

    if goal.all_milestones_done() {
        goal.status = GoalStatus::Completed;
        goal.completed_at = Some(now_ms);
        info!(goal = %goal.id, "all milestones complete — goal auto-completed");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use vigil_store::Milestone;

    use super::*;

    fn goal_with_milestones(status: GoalStatus) -> Goal {
        let mut goal = Goal::new("g1", "write a book", 0);
        goal.status = status;
        goal.milestones = vec![
            Milestone {
                id: "m1".into(),
                title: "Outline the chapters".into(),
                status: MilestoneStatus::Completed,
                evidence: None,
            },
            Milestone {
                id: "m2".into(),
                title: "Draft chapter one".into(),
                status: MilestoneStatus::Pending,
                evidence: None,
            },
        ];
        goal.recompute_progress();
        goal
    }

    #[test]
    fn dag_edges() {
        use GoalStatus::*;
        assert!(transition_allowed(Proposed, Active));
        assert!(transition_allowed(Active, InProgress));
        assert!(transition_allowed(InProgress, Blocked));
        assert!(transition_allowed(Blocked, InProgress));
        assert!(transition_allowed(InProgress, Completed));
        assert!(transition_allowed(Active, Abandoned));

        assert!(!transition_allowed(Completed, Active));
        assert!(!transition_allowed(Abandoned, Active));
        assert!(!transition_allowed(Proposed, Completed));
        assert!(!transition_allowed(Blocked, Completed));
    }

    #[test]
    fn terminal_goal_rejects_everything() {
        let mut goal = Goal::new("g1", "done deal", 0);
        goal.status = GoalStatus::Completed;

        let status_update = GoalUpdateTag {
            id: "g1".into(),
            status: Some("active".into()),
            progress: None,
            note: String::new(),
        };
        assert!(apply_goal_update(&mut goal, &status_update, 1).is_err());

        let progress_update = GoalUpdateTag {
            id: "g1".into(),
            status: None,
            progress: Some(50),
            note: String::new(),
        };
        assert!(apply_goal_update(&mut goal, &progress_update, 2).is_err());
        assert_eq!(goal.status, GoalStatus::Completed);
    }

    #[test]
    fn manual_progress_only_without_milestones() {
        let mut plain = Goal::new("g1", "plain", 0);
        plain.status = GoalStatus::InProgress;
        let tag = GoalUpdateTag {
            id: "g1".into(),
            status: None,
            progress: Some(70),
            note: "moving".into(),
        };
        apply_goal_update(&mut plain, &tag, 1).unwrap();
        assert_eq!(plain.progress, 70);
        assert_eq!(plain.log, vec!["moving".to_string()]);

        let mut backed = goal_with_milestones(GoalStatus::InProgress);
        apply_goal_update(&mut backed, &tag, 1).unwrap();
        assert_eq!(backed.progress, 50);
    }

    #[test]
    fn milestone_matches_by_title_substring() {
        let mut goal = goal_with_milestones(GoalStatus::InProgress);
        let tag = MilestoneTag {
            goal: "g1".into(),
            milestone: "chapter ONE".into(),
            evidence: "draft committed".into(),
        };
        complete_milestone(&mut goal, &tag, 5).unwrap();

        assert_eq!(goal.progress, 100);
        assert_eq!(goal.status, GoalStatus::Completed);
        assert_eq!(goal.completed_at, Some(5));
        assert_eq!(
            goal.milestones[1].evidence.as_deref(),
            Some("draft committed")
        );
    }

    #[test]
    fn unknown_milestone_is_a_policy_error() {
        let mut goal = goal_with_milestones(GoalStatus::InProgress);
        let tag = MilestoneTag {
            goal: "g1".into(),
            milestone: "nope".into(),
            evidence: String::new(),
        };
        assert!(complete_milestone(&mut goal, &tag, 5).is_err());
        assert_eq!(goal.progress, 50);
    }
}

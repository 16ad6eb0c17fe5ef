//! Core detectors.
//!
//! Each detector reads local state and returns zero or more signals.  A
//! failing detector is logged and contributes nothing; detection never takes
//! the cycle down.

use chrono::{TimeZone, Utc};
use cron::Schedule;
use std::str::FromStr;
use tracing::warn;

use vigil_config::BudgetConfig;
use vigil_store::{ExperimentStatus, Store};

use crate::signal::{FOLLOWUPS_KEY, Followup, Signal, Urgency};

/// Shared read-only context for one detection pass.
pub struct DetectorCx<'a> {
    pub store: &'a Store,
    pub budget: &'a BudgetConfig,
    pub now_ms: i64,
}

const HOUR_MS: i64 = 3_600_000;
const DAY_MS: i64 = 86_400_000;

/// Goal untouched this long while active counts as stale.
const GOAL_STALE_MS: i64 = 7 * DAY_MS;
/// Unresolved errors in the last hour that count as a spike.
const ERROR_SPIKE_THRESHOLD: i64 = 5;
/// Occurrences before a capability gap asks for a skill proposal.
const GAP_PROPOSAL_THRESHOLD: i64 = 3;

/// Run every core detector in a fixed order.
pub fn run_core_detectors(cx: &DetectorCx<'_>) -> Vec<Signal> {
    let mut signals = Vec::new();
    signals.extend(detect_followups(cx));
    signals.extend(detect_stale_goals(cx));
    signals.extend(detect_crons(cx));
    signals.extend(detect_error_spike(cx));
    signals.extend(detect_cost_spike(cx));
    signals.extend(detect_capability_gaps(cx));
    signals.extend(detect_concluded_experiments(cx));
    signals
}

pub fn detect_followups(cx: &DetectorCx<'_>) -> Vec<Signal> {
    let followups: Vec<Followup> = match cx.store.kv_get(FOLLOWUPS_KEY) {
        Ok(list) => list.unwrap_or_default(),
        Err(err) => {
            warn!(%err, "followup detector failed to read pending list");
            return Vec::new();
        }
    };

    followups
        .into_iter()
        .map(|f| {
            Signal::new(
                "followup_due",
                Urgency::Low,
                format!("Follow up on: {}", f.topic),
            )
            .with_data("topic", f.topic)
            .with_created_at(f.created_at)
        })
        .collect()
}

pub fn detect_stale_goals(cx: &DetectorCx<'_>) -> Vec<Signal> {
    let goals = match cx.store.active_goals() {
        Ok(goals) => goals,
        Err(err) => {
            warn!(%err, "stale-goal detector failed to read goals");
            return Vec::new();
        }
    };

    goals
        .into_iter()
        .filter(|g| cx.now_ms - g.updated_at >= GOAL_STALE_MS)
        .map(|g| {
            Signal::new(
                "goal_stale",
                Urgency::Low,
                format!("Goal \"{}\" has had no movement", g.title),
            )
            .with_data("goal_id", g.id)
            .with_due_at(g.updated_at + GOAL_STALE_MS)
        })
        .collect()
}

pub fn detect_crons(cx: &DetectorCx<'_>) -> Vec<Signal> {
    let jobs = match cx.store.enabled_crons() {
        Ok(jobs) => jobs,
        Err(err) => {
            warn!(%err, "cron detector failed to read jobs");
            return Vec::new();
        }
    };

    let mut signals = Vec::new();
    for job in jobs {
        if job.state.consecutive_errors >= 3 {
            signals.push(
                Signal::new(
                    "cron_failure",
                    Urgency::High,
                    format!(
                        "Scheduled job \"{}\" failed {} times in a row",
                        job.name, job.state.consecutive_errors
                    ),
                )
                .with_data("cron_id", job.id.clone()),
            );
        }

        let due_at = job
            .state
            .next_run
            .or_else(|| next_run_after(&job.schedule, &job.tz, job.state.last_run.unwrap_or(cx.now_ms - DAY_MS)));
        if let Some(due) = due_at {
            if due <= cx.now_ms {
                signals.push(
                    Signal::new(
                        "cron_due",
                        Urgency::Medium,
                        format!("Scheduled job \"{}\" is due", job.name),
                    )
                    .with_data("cron_id", job.id)
                    .with_data("prompt", job.prompt)
                    .with_due_at(due),
                );
            }
        }
    }
    signals
}

/// Next occurrence of `schedule` (cron syntax) after `after_ms`, in the job's
/// timezone.  Returns `None` for unparseable schedules, which are logged once
/// per detection pass.
pub fn next_run_after(schedule: &str, tz: &str, after_ms: i64) -> Option<i64> {
    let schedule = match Schedule::from_str(schedule) {
        Ok(s) => s,
        Err(err) => {
            warn!(schedule, %err, "unparseable cron schedule");
            return None;
        }
    };
    let tz: chrono_tz::Tz = tz.parse().unwrap_or(chrono_tz::UTC);
    let after = Utc.timestamp_millis_opt(after_ms).single()?;
    schedule
        .after(&after.with_timezone(&tz))
        .next()
        .map(|dt| dt.timestamp_millis())
}

pub fn detect_error_spike(cx: &DetectorCx<'_>) -> Vec<Signal> {
    let count = match cx.store.unresolved_error_count_since(cx.now_ms - HOUR_MS) {
        Ok(count) => count,
        Err(err) => {
            warn!(%err, "error-spike detector failed");
            return Vec::new();
        }
    };
    if count < ERROR_SPIKE_THRESHOLD {
        return Vec::new();
    }
    let urgency = if count >= 2 * ERROR_SPIKE_THRESHOLD {
        Urgency::High
    } else {
        Urgency::Medium
    };
    vec![
        Signal::new(
            "error_spike",
            urgency,
            format!("{count} unresolved errors in the last hour"),
        )
        .with_data("count", count),
    ]
}

pub fn detect_cost_spike(cx: &DetectorCx<'_>) -> Vec<Signal> {
    if cx.budget.daily_usd <= 0.0 {
        return Vec::new();
    }
    let spent = match cx.store.cost_today() {
        Ok(spent) => spent,
        Err(err) => {
            warn!(%err, "cost-spike detector failed");
            return Vec::new();
        }
    };
    if spent < cx.budget.daily_usd * cx.budget.warn_fraction {
        return Vec::new();
    }
    vec![
        Signal::new(
            "cost_spike",
            Urgency::Medium,
            format!(
                "LLM spend today is ${spent:.2} of the ${:.2} budget",
                cx.budget.daily_usd
            ),
        )
        .with_data("spent_usd", spent)
        .with_data("budget_usd", cx.budget.daily_usd),
    ]
}

pub fn detect_capability_gaps(cx: &DetectorCx<'_>) -> Vec<Signal> {
    let gaps = match cx.store.promotable_gaps(GAP_PROPOSAL_THRESHOLD) {
        Ok(gaps) => gaps,
        Err(err) => {
            warn!(%err, "capability-gap detector failed");
            return Vec::new();
        }
    };
    gaps.into_iter()
        .map(|gap| {
            Signal::new(
                "capability_gap",
                Urgency::Medium,
                format!(
                    "Repeated unmet request ({}×): {}",
                    gap.occurrences, gap.description
                ),
            )
            .with_data("gap_id", gap.id)
            .with_data("topic", gap.topic)
            .with_created_at(gap.first_seen)
        })
        .collect()
}

/// KV key listing experiment ids whose conclusion was already surfaced.
pub const ANNOUNCED_EXPERIMENTS_KEY: &str = "announced-experiments";

pub fn detect_concluded_experiments(cx: &DetectorCx<'_>) -> Vec<Signal> {
    let announced: Vec<String> = match cx.store.kv_get(ANNOUNCED_EXPERIMENTS_KEY) {
        Ok(list) => list.unwrap_or_default(),
        Err(err) => {
            warn!(%err, "experiment detector failed to read announce list");
            return Vec::new();
        }
    };

    let mut signals = Vec::new();
    for status in [ExperimentStatus::Concluded, ExperimentStatus::Reverted] {
        let experiments = match cx.store.experiments_with_status(status) {
            Ok(experiments) => experiments,
            Err(err) => {
                warn!(%err, "experiment detector failed to read rows");
                continue;
            }
        };
        for exp in experiments {
            if announced.contains(&exp.id) {
                continue;
            }
            signals.push(
                Signal::new(
                    "experiment_concluded",
                    Urgency::Low,
                    format!("Experiment \"{}\" {}", exp.name, status.as_str()),
                )
                .with_data("experiment_id", exp.id)
                .with_data("status", status.as_str())
                .with_created_at(exp.concluded_at.unwrap_or(cx.now_ms)),
            );
        }
    }
    signals
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use vigil_clock::Clock;
    use vigil_config::BudgetConfig;
    use vigil_store::{CostEntry, Goal, GoalStatus, Store};

    use super::*;

    fn cx_store() -> (Store, i64) {
        let store = Store::open_in_memory(Clock::default()).unwrap();
        (store, Utc::now().timestamp_millis())
    }

    #[test]
    fn pending_followup_surfaces_as_signal() {
        let (store, now) = cx_store();
        store
            .kv_set(
                FOLLOWUPS_KEY,
                &vec![Followup {
                    topic: "dentist".into(),
                    created_at: now - DAY_MS,
                }],
            )
            .unwrap();
        let budget = BudgetConfig::default();
        let cx = DetectorCx {
            store: &store,
            budget: &budget,
            now_ms: now,
        };

        let signals = detect_followups(&cx);
        assert_eq!(signals.len(), 1);
        assert_eq!(signals[0].kind, "followup_due");
        assert_eq!(signals[0].key(), "followup_due:dentist");
    }

    #[test]
    fn quiet_state_produces_no_signals() {
        let (store, now) = cx_store();
        let budget = BudgetConfig::default();
        let cx = DetectorCx {
            store: &store,
            budget: &budget,
            now_ms: now,
        };
        assert!(run_core_detectors(&cx).is_empty());
    }

    #[test]
    fn stale_goal_detected_after_a_week() {
        let (store, now) = cx_store();
        let mut goal = Goal::new("g1", "learn rust", now - 8 * DAY_MS);
        goal.status = GoalStatus::Active;
        goal.updated_at = now - 8 * DAY_MS;
        store.insert_goal(&goal).unwrap();
        let budget = BudgetConfig::default();
        let cx = DetectorCx {
            store: &store,
            budget: &budget,
            now_ms: now,
        };

        let signals = detect_stale_goals(&cx);
        assert_eq!(signals.len(), 1);
        assert_eq!(signals[0].kind, "goal_stale");
    }

    #[test]
    fn budget_warn_fraction_raises_cost_spike() {
        let (store, now) = cx_store();
        store
            .insert_cost(&CostEntry {
                id: 0,
                kind: "proactive".into(),
                model: "cheap".into(),
                input_tokens: 0,
                output_tokens: 0,
                cache_read: 0,
                cost_usd: 4.2,
                duration_ms: 0,
                session_id: None,
                cron_id: None,
                ts: now,
            })
            .unwrap();
        let budget = BudgetConfig {
            daily_usd: 5.0,
            warn_fraction: 0.8,
        };
        let cx = DetectorCx {
            store: &store,
            budget: &budget,
            now_ms: now,
        };

        let signals = detect_cost_spike(&cx);
        assert_eq!(signals.len(), 1);
        assert_eq!(signals[0].kind, "cost_spike");
    }

    #[test]
    fn cron_next_run_is_computed_in_job_timezone() {
        // Every day at 08:00; seconds field first for the cron crate.
        let next = next_run_after("0 0 8 * * *", "UTC", 0).unwrap();
        assert!(next > 0);
        assert_eq!(next % 1000, 0);
    }
}

//! Experiment lifecycle: baseline capture, the half-hourly metric check,
//! auto-revert, and auto-conclude.

use tracing::{info, warn};
use uuid::Uuid;

use vigil_store::{
    Experiment, ExperimentMetric, ExperimentStatus, ReasoningEntry, ReasoningKind, Store,
};

const DAY_MS: i64 = 86_400_000;
/// Metric windows look back one week.
const METRIC_WINDOW_MS: i64 = 7 * DAY_MS;

/// What the checker decided for one experiment this pass.
#[derive(Debug, Clone, PartialEq)]
pub enum ExperimentEvent {
    MetricRecorded { id: String, value: f64 },
    Reverted { id: String, conclusion: String, revert_action: Option<String> },
    Concluded { id: String, conclusion: String },
    /// Metric had no data; the experiment was left untouched this tick.
    NoSignal { id: String },
}

/// Read the current value of a metric from the append tables.  `None` means
/// no data; distinct from a zero reading.
pub fn read_metric(store: &Store, metric: ExperimentMetric, now_ms: i64) -> Option<f64> {
    let since = now_ms - METRIC_WINDOW_MS;
    match metric {
        ExperimentMetric::PositiveRate => {
            let window = store.outcome_window_since(since).ok()?;
            window.positive_rate().map(|rate| rate * 100.0)
        }
        ExperimentMetric::ResponseTime => {
            let window = store.outcome_window_since(since).ok()?;
            window.avg_window_ms.map(|ms| ms / 1000.0)
        }
        ExperimentMetric::Cost => store.total_cost_since(since).ok(),
    }
}

/// Move a pending experiment to running, capturing the baseline reading.
pub fn start_experiment(store: &Store, id: &str, now_ms: i64) -> anyhow::Result<()> {
    let Some(mut exp) = store.get_experiment(id)? else {
        anyhow::bail!("unknown experiment {id}");
    };
    if exp.status != ExperimentStatus::Pending {
        anyhow::bail!("experiment {id} is {}, not pending", exp.status.as_str());
    }
    exp.baseline_value = read_metric(store, exp.metric, now_ms);
    exp.status = ExperimentStatus::Running;
    exp.started_at = Some(now_ms);
    store.update_experiment(&exp)?;
    info!(experiment = %id, baseline = ?exp.baseline_value, "experiment started");
    Ok(())
}

/// The half-hourly pass over running experiments.
pub fn run_experiment_checks(store: &Store, now_ms: i64) -> Vec<ExperimentEvent> {
    let running = match store.experiments_with_status(ExperimentStatus::Running) {
        Ok(running) => running,
        Err(err) => {
            warn!(%err, "experiment check failed to list running rows");
            return Vec::new();
        }
    };

    let mut events = Vec::new();
    for experiment in running {
        match check_one(store, experiment, now_ms) {
            Ok(event) => events.push(event),
            Err(err) => warn!(%err, "experiment check failed — row untouched"),
        }
    }
    events
}

fn check_one(
    store: &Store,
    mut exp: Experiment,
    now_ms: i64,
) -> anyhow::Result<ExperimentEvent> {
    let Some(current) = read_metric(store, exp.metric, now_ms) else {
        return Ok(ExperimentEvent::NoSignal { id: exp.id });
    };
    exp.current_value = Some(current);

    // Revert check: only meaningful with a captured baseline.
    if let Some(baseline) = exp.baseline_value {
        let floor = baseline * exp.revert_threshold;
        if current < floor {
            let conclusion = format!(
                "reverted: {} fell to {current:.1}, below the revert floor {floor:.1} \
                 ({baseline:.1} × {:.2})",
                exp.metric.as_str(),
                exp.revert_threshold,
            );
            let id = exp.id.clone();
            let revert_action = exp.revert_action.clone();
            exp.status = ExperimentStatus::Reverted;
            exp.conclusion = Some(conclusion.clone());
            exp.concluded_at = Some(now_ms);
            store.update_experiment(&exp)?;
            journal_outcome(store, &id, "reverted", &conclusion, now_ms);
            info!(experiment = %id, "experiment auto-reverted");
            return Ok(ExperimentEvent::Reverted {
                id,
                conclusion,
                revert_action,
            });
        }
    }

    // Duration check.
    let elapsed_hours = exp
        .started_at
        .map(|started| (now_ms - started) as f64 / 3_600_000.0)
        .unwrap_or(0.0);
    if elapsed_hours >= exp.duration_hours {
        let delta = exp
            .baseline_value
            .map(|baseline| current - baseline)
            .unwrap_or(0.0);
        let conclusion = format!(
            "concluded after {elapsed_hours:.1}h: {} at {current:.1} ({delta:+.1} vs baseline)",
            exp.metric.as_str(),
        );
        let id = exp.id.clone();
        exp.status = ExperimentStatus::Concluded;
        exp.conclusion = Some(conclusion.clone());
        exp.concluded_at = Some(now_ms);
        store.update_experiment(&exp)?;
        journal_outcome(store, &id, "concluded", &conclusion, now_ms);
        info!(experiment = %id, "experiment concluded");
        return Ok(ExperimentEvent::Concluded { id, conclusion });
    }

    // Neither gate tripped: persist the fresh reading only.
    let id = exp.id.clone();
    store.update_experiment(&exp)?;
    Ok(ExperimentEvent::MetricRecorded { id, value: current })
}

fn journal_outcome(store: &Store, experiment_id: &str, outcome: &str, detail: &str, now_ms: i64) {
    let entry = ReasoningEntry {
        id: Uuid::new_v4().to_string(),
        kind: ReasoningKind::Outcome,
        content: format!("experiment {experiment_id} {outcome}: {detail}"),
        confidence: 0.8,
        status: "closed".into(),
        related_id: Some(experiment_id.to_string()),
        ts: now_ms,
    };
    if let Err(err) = store.insert_reasoning(&entry) {
        warn!(%err, "failed to journal experiment outcome");
    }
}

#[cfg(test)]
mod tests {
    use vigil_clock::Clock;
    use vigil_store::{ReplyOutcome, Sentiment};

    use super::*;

    fn store() -> Store {
        Store::open_in_memory(Clock::default()).unwrap()
    }

    fn experiment(id: &str, baseline: Option<f64>) -> Experiment {
        Experiment {
            id: id.into(),
            name: "shorter briefings".into(),
            hypothesis: "short wins".into(),
            metric: ExperimentMetric::PositiveRate,
            baseline_value: baseline,
            current_value: None,
            duration_hours: 48.0,
            revert_threshold: 0.8,
            status: ExperimentStatus::Running,
            change_description: "cap at 3 lines".into(),
            revert_action: Some("restore briefing length".into()),
            conclusion: None,
            reasoning_id: None,
            started_at: Some(0),
            concluded_at: None,
        }
    }

    fn seed_outcomes(store: &Store, positives: usize, negatives: usize, now: i64) {
        for i in 0..(positives + negatives) {
            let sentiment = if i < positives {
                Sentiment::Positive
            } else {
                Sentiment::Negative
            };
            store
                .log_reply_outcome(&ReplyOutcome {
                    id: 0,
                    bot_msg_id: format!("m{i}"),
                    signal: None,
                    sentiment: Some(sentiment),
                    classification: None,
                    user_response: None,
                    window_ms: Some(3_000),
                    ts: now - 1_000,
                })
                .unwrap();
        }
    }

    #[test]
    fn metric_collapse_triggers_auto_revert() {
        let store = store();
        let now = 10 * DAY_MS;
        // positive_rate = 40% against a baseline of 60 and threshold 0.8.
        seed_outcomes(&store, 4, 6, now);
        store.insert_experiment(&experiment("e1", Some(60.0))).unwrap();

        let events = run_experiment_checks(&store, now);
        assert_eq!(events.len(), 1);
        let ExperimentEvent::Reverted { conclusion, revert_action, .. } = &events[0] else {
            panic!("expected revert, got {:?}", events[0]);
        };
        assert!(conclusion.contains("48.0"));
        assert!(conclusion.contains("40.0"));
        assert_eq!(revert_action.as_deref(), Some("restore briefing length"));

        let row = store.get_experiment("e1").unwrap().unwrap();
        assert_eq!(row.status, ExperimentStatus::Reverted);
        assert!(row.conclusion.is_some());

        // The learning journal picked up the outcome.
        let journal = store.reasoning_for("e1").unwrap();
        assert_eq!(journal.len(), 1);
        assert!(journal[0].content.contains("reverted"));
    }

    #[test]
    fn missing_data_leaves_the_row_untouched() {
        let store = store();
        store.insert_experiment(&experiment("e1", Some(60.0))).unwrap();

        let events = run_experiment_checks(&store, 10 * DAY_MS);
        assert_eq!(
            events,
            vec![ExperimentEvent::NoSignal { id: "e1".into() }]
        );
        let row = store.get_experiment("e1").unwrap().unwrap();
        assert_eq!(row.status, ExperimentStatus::Running);
        assert_eq!(row.current_value, None);
    }

    #[test]
    fn healthy_metric_past_duration_concludes() {
        let store = store();
        let now = 10 * DAY_MS;
        seed_outcomes(&store, 7, 3, now);
        store.insert_experiment(&experiment("e1", Some(60.0))).unwrap();

        let events = run_experiment_checks(&store, now);
        let ExperimentEvent::Concluded { conclusion, .. } = &events[0] else {
            panic!("expected conclude, got {:?}", events[0]);
        };
        assert!(conclusion.contains("+10.0"));
        let row = store.get_experiment("e1").unwrap().unwrap();
        assert_eq!(row.status, ExperimentStatus::Concluded);
    }

    #[test]
    fn mid_flight_check_just_records_the_metric() {
        let store = store();
        let now = 10 * DAY_MS;
        seed_outcomes(&store, 7, 3, now);
        let mut exp = experiment("e1", Some(60.0));
        exp.started_at = Some(now - 3_600_000);
        store.insert_experiment(&exp).unwrap();

        let events = run_experiment_checks(&store, now);
        assert!(matches!(events[0], ExperimentEvent::MetricRecorded { .. }));
        let row = store.get_experiment("e1").unwrap().unwrap();
        assert_eq!(row.status, ExperimentStatus::Running);
        assert_eq!(row.current_value, Some(70.0));
    }

    #[test]
    fn baseline_is_captured_on_start() {
        let store = store();
        let now = 10 * DAY_MS;
        seed_outcomes(&store, 1, 1, now);
        let mut exp = experiment("e1", None);
        exp.status = ExperimentStatus::Pending;
        exp.started_at = None;
        store.insert_experiment(&exp).unwrap();

        start_experiment(&store, "e1", now).unwrap();
        let row = store.get_experiment("e1").unwrap().unwrap();
        assert_eq!(row.status, ExperimentStatus::Running);
        assert_eq!(row.baseline_value, Some(50.0));
    }
}

//! The proactive driver and the periodic background tasks.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{RwLock, mpsc, watch};
use tracing::{info, warn};

use vigil_agent::{AgentCycle, run_experiment_checks};
use vigil_config::AppConfig;
use vigil_store::Store;
use vigil_transport::Transport;
use vigil_trust::{AutonomyLevel, TrustEngine};

use crate::ExitReason;

/// KV key stamping the last weekly maintenance run.
const MAINTENANCE_KEY: &str = "last-maintenance-at";
const WEEK_MS: i64 = 7 * 24 * 3_600_000;
const EXPERIMENT_CHECK_SECS: u64 = 30 * 60;

/// Status snapshot served by `GET /agent-loop`.
#[derive(Debug, Clone, Default, Serialize)]
pub struct LoopStatus {
    pub running: bool,
    pub cycle_count: u64,
    pub last_cycle_at: Option<i64>,
    pub last_model: Option<String>,
    pub last_picked: usize,
    pub last_error: Option<String>,
    pub memory_pct: Option<f64>,
    pub next_interval_secs: u64,
}

/// Forever-loop for the proactive side.  One cycle never overlaps with
/// itself: the loop is strictly serial, and an overrun is logged as a
/// skipped wake instead of a concurrent tick.
pub async fn run_proactive_driver(
    mut cycle: AgentCycle,
    status: Arc<RwLock<LoopStatus>>,
    mut trigger_rx: mpsc::Receiver<()>,
    mut shutdown: watch::Receiver<bool>,
) -> ExitReason {
    loop {
        {
            status.write().await.running = true;
        }
        let started = tokio::time::Instant::now();
        let report = cycle.run_cycle().await;
        let elapsed = started.elapsed();

        let state = cycle.state();
        {
            let mut s = status.write().await;
            s.running = false;
            s.cycle_count = state.cycle_count;
            s.last_cycle_at = state.last_cycle_at;
            s.last_model = report.model.clone();
            s.last_picked = report.picked;
            s.last_error = report.error.clone();
            s.memory_pct = cycle.guardian().last_pct();
            s.next_interval_secs = report.next_interval.as_secs();
        }

        if report.restart_recommended {
            cycle.shutdown().await;
            return ExitReason::MemoryRestart;
        }
        if state.consecutive_failures >= 3 {
            warn!(
                failures = state.consecutive_failures,
                "cycle failure loop — giving up"
            );
            cycle.shutdown().await;
            return ExitReason::CycleFailureLoop;
        }

        // Weekly maintenance piggybacks on the driver so it owns the trust
        // engine without sharing.
        maybe_run_maintenance(&mut cycle);

        if elapsed >= report.next_interval {
            warn!(
                elapsed_secs = elapsed.as_secs(),
                interval_secs = report.next_interval.as_secs(),
                "cycle overran its interval — next wake skipped"
            );
            continue;
        }

        tokio::select! {
            _ = tokio::time::sleep(report.next_interval - elapsed) => {}
            triggered = trigger_rx.recv() => {
                if triggered.is_some() {
                    info!("operator trigger — running a cycle now");
                }
            }
            changed = shutdown.changed() => {
                if changed.is_ok() && *shutdown.borrow() {
                    cycle.shutdown().await;
                    return ExitReason::Clean;
                }
            }
        }

        if *shutdown.borrow() {
            cycle.shutdown().await;
            return ExitReason::Clean;
        }
    }
}

fn maybe_run_maintenance(cycle: &mut AgentCycle) {
    let store = cycle.store();
    let now_ms = store.now_ms();
    let last: Option<i64> = store.kv_get(MAINTENANCE_KEY).ok().flatten();
    if last.is_some_and(|at| now_ms - at < WEEK_MS) {
        return;
    }
    info!("weekly maintenance hook running");
    cycle.run_maintenance(now_ms);
    if let Err(err) = store.kv_set(MAINTENANCE_KEY, &now_ms) {
        warn!(%err, "failed to stamp maintenance run");
    }
}

/// Half-hourly experiment checks.  Revert actions are trust-gated: rollback
/// is a destructive class capped at "propose and wait", so the action is
/// proposed to the user instead of fired silently.
pub fn spawn_periodic_tasks(
    store: Arc<Store>,
    transport: Arc<dyn Transport>,
    config: AppConfig,
    shutdown: watch::Receiver<bool>,
) {
    let mut check_shutdown = shutdown;
    tokio::spawn(async move {
        let interval = Duration::from_secs(EXPERIMENT_CHECK_SECS);
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                changed = check_shutdown.changed() => {
                    if changed.is_ok() && *check_shutdown.borrow() { break; }
                    continue;
                }
            }

            let now_ms = store.now_ms();
            let events = run_experiment_checks(&store, now_ms);
            for event in events {
                if let vigil_agent::ExperimentEvent::Reverted {
                    id,
                    conclusion,
                    revert_action,
                } = event
                {
                    let trust = TrustEngine::load(&store);
                    let level = trust.autonomy_level("rollback", now_ms);
                    let text = match (&revert_action, level) {
                        (Some(action), level) if level >= AutonomyLevel::ExecuteAndInform => {
                            format!("Experiment {id} auto-reverted ({conclusion}). Applying: {action}")
                        }
                        (Some(action), _) => format!(
                            "Experiment {id} auto-reverted ({conclusion}). Proposed next step: {action} — say the word and I'll do it."
                        ),
                        (None, _) => format!("Experiment {id} auto-reverted ({conclusion})."),
                    };
                    let bot_msg_id = uuid::Uuid::new_v4().to_string()[..8].to_string();
                    if let Err(err) = transport
                        .send(&config.agent.chat_id, &bot_msg_id, &text)
                        .await
                    {
                        warn!(%err, "failed to deliver experiment revert notice");
                    }
                }
            }
        }
    });
}

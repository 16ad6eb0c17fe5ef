//! Side-effect dispatch for parsed tags, plus the writeback that closes each
//! cycle: recent-actions ring, module state stamps, learning linkage, and the
//! operator event ring.
//!
//! Tags apply in a fixed order; every tag failure is isolated; logged,
//! recorded, never fatal to the rest of the dispatch.

use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use vigil_modules::ModuleRegistry;
use vigil_signals::{FOLLOWUPS_KEY, Followup, Signal};
use vigil_store::{
    ErrorEntry, Goal, GoalStatus, MessageDirection, MessageRow, Severity, Store,
};
use vigil_transport::Transport;
use vigil_trust::TrustEngine;

use crate::goals::{apply_goal_update, complete_milestone};
use crate::parser::ParsedActions;

/// KV key of the actions-taken ring (24 h TTL, 50 cap).
pub const RECENT_ACTIONS_KEY: &str = "recent-actions";
/// KV key of the operator event ring.
pub const EVENT_RING_KEY: &str = "event-ring";

const RECENT_ACTIONS_CAP: usize = 50;
const RECENT_ACTIONS_TTL_MS: i64 = 24 * 3_600_000;
const EVENT_RING_CAP: usize = 200;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecentAction {
    pub text: String,
    pub ts: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEntry {
    pub ts: i64,
    pub kind: String,
    pub detail: String,
}

/// What one dispatch pass actually did.
#[derive(Debug, Clone, Default)]
pub struct DispatchReport {
    pub actions_logged: usize,
    pub goals_created: Vec<String>,
    pub goals_updated: usize,
    pub milestones_completed: usize,
    pub followups_added: usize,
    pub messages_sent: Vec<String>,
    pub next_cycle_minutes: Option<u32>,
    /// Per-tag policy failures, for the report only; dispatch never aborts.
    pub skipped: Vec<String>,
}

pub struct Dispatcher<'a> {
    pub store: &'a Store,
    pub modules: &'a ModuleRegistry,
    pub transport: &'a dyn Transport,
    pub trust: &'a mut TrustEngine,
    pub chat_id: &'a str,
}

impl Dispatcher<'_> {
    /// Apply every parsed tag in the fixed order, then run writeback for the
    /// picked signals that produced this reply.
    pub async fn dispatch(
        &mut self,
        actions: &ParsedActions,
        picked: &[Signal],
        now_ms: i64,
    ) -> DispatchReport {
        let mut report = DispatchReport::default();

        // 1. actions taken; pure journal entries.
        for action in &actions.actions_taken {
            report.actions_logged += 1;
            self.push_event(now_ms, "action_taken", action);
        }

        // 2. goal creates.
        for create in &actions.goal_creates {
            let id = short_id();
            let mut goal = Goal::new(id.clone(), create.title.clone(), now_ms);
            goal.description = create.description.clone();
            goal.status = GoalStatus::Proposed;
            match self.store.insert_goal(&goal) {
                Ok(()) => {
                    info!(goal = %id, title = %create.title, "goal created");
                    self.trust.record_outcome("goal_create", true, now_ms);
                    self.push_event(now_ms, "goals:updated", &create.title);
                    report.goals_created.push(id);
                }
                Err(err) => {
                    self.soft_fail(&mut report, now_ms, "goal_create", &err.to_string());
                }
            }
        }

        // 3. goal updates; the DAG is enforced here; illegal moves skip.
        for update in &actions.goal_updates {
            let loaded = match self.store.get_goal(&update.id) {
                Ok(Some(goal)) => goal,
                Ok(None) => {
                    self.soft_fail(
                        &mut report,
                        now_ms,
                        "goal_update",
                        &format!("unknown goal {}", update.id),
                    );
                    continue;
                }
                Err(err) => {
                    self.soft_fail(&mut report, now_ms, "goal_update", &err.to_string());
                    continue;
                }
            };
            let mut goal = loaded;
            match apply_goal_update(&mut goal, update, now_ms) {
                Ok(()) => {
                    if let Err(err) = self.store.update_goal(&goal) {
                        self.soft_fail(&mut report, now_ms, "goal_update", &err.to_string());
                        continue;
                    }
                    report.goals_updated += 1;
                    self.trust.record_outcome("goal_update", true, now_ms);
                    self.push_event(now_ms, "goals:updated", &goal.id);
                }
                Err(policy) => self.soft_fail(&mut report, now_ms, "goal_update", &policy),
            }
        }

        // 4. milestone completes.
        for milestone in &actions.milestone_completes {
            let loaded = match self.store.get_goal(&milestone.goal) {
                Ok(Some(goal)) => goal,
                Ok(None) => {
                    self.soft_fail(
                        &mut report,
                        now_ms,
                        "milestone_complete",
                        &format!("unknown goal {}", milestone.goal),
                    );
                    continue;
                }
                Err(err) => {
                    self.soft_fail(&mut report, now_ms, "milestone_complete", &err.to_string());
                    continue;
                }
            };
            let mut goal = loaded;
            match complete_milestone(&mut goal, milestone, now_ms) {
                Ok(()) => {
                    if let Err(err) = self.store.update_goal(&goal) {
                        self.soft_fail(&mut report, now_ms, "milestone_complete", &err.to_string());
                        continue;
                    }
                    report.milestones_completed += 1;
                    self.push_event(now_ms, "goals:updated", &goal.id);
                }
                Err(policy) => self.soft_fail(&mut report, now_ms, "milestone_complete", &policy),
            }
        }

        // 5. followups; onto the pending list, surfacing in a later cycle.
        if !actions.followups.is_empty() {
            let mut pending: Vec<Followup> = self
                .store
                .kv_get(FOLLOWUPS_KEY)
                .ok()
                .flatten()
                .unwrap_or_default();
            for topic in &actions.followups {
                if pending.iter().any(|f| f.topic == *topic) {
                    continue;
                }
                pending.push(Followup {
                    topic: topic.clone(),
                    created_at: now_ms,
                });
                report.followups_added += 1;
            }
            if let Err(err) = self.store.kv_set(FOLLOWUPS_KEY, &pending) {
                self.soft_fail(&mut report, now_ms, "followup", &err.to_string());
            }
        }

        // 6. outbound messages; transport owns delivery, chunking, retries.
        for message in &actions.wa_messages {
            let bot_msg_id = short_id();
            match self.transport.send(self.chat_id, &bot_msg_id, message).await {
                Ok(()) => {
                    let row = MessageRow {
                        id: 0,
                        direction: MessageDirection::Out,
                        chat_id: self.chat_id.to_string(),
                        body: message.clone(),
                        bot_msg_id: Some(bot_msg_id.clone()),
                        ts: now_ms,
                    };
                    if let Err(err) = self.store.log_message(&row) {
                        warn!(%err, "failed to log outbound message");
                    }
                    self.trust.record_outcome("send_message", true, now_ms);
                    report.messages_sent.push(bot_msg_id);
                }
                Err(err) => {
                    self.trust.record_outcome("send_message", false, now_ms);
                    self.soft_fail(&mut report, now_ms, "wa_message", &err.to_string());
                }
            }
        }

        // 7. next-cycle override; this schedule only, never the default.
        report.next_cycle_minutes = actions.next_cycle_minutes;

        self.writeback(actions, picked, now_ms);
        report
    }

    /// Post-dispatch bookkeeping: actions ring, followup consumption, module
    /// state stamps, and experiment announcements.
    fn writeback(&mut self, actions: &ParsedActions, picked: &[Signal], now_ms: i64) {
        if !actions.actions_taken.is_empty() {
            self.append_recent_actions(&actions.actions_taken, now_ms);
        }

        // A picked followup signal consumes its pending entry exactly once.
        let consumed_topics: Vec<&str> = picked
            .iter()
            .filter(|s| s.kind == "followup_due")
            .filter_map(|s| s.data.get("topic").and_then(|v| v.as_str()))
            .collect();
        if !consumed_topics.is_empty() {
            let mut pending: Vec<Followup> = self
                .store
                .kv_get(FOLLOWUPS_KEY)
                .ok()
                .flatten()
                .unwrap_or_default();
            pending.retain(|f| !consumed_topics.contains(&f.topic.as_str()));
            if let Err(err) = self.store.kv_set(FOLLOWUPS_KEY, &pending) {
                warn!(%err, "failed to consume followups");
            }
        }

        // Module "last handled at" stamps per the state-key maps.
        for signal in picked {
            for (state_key, field) in self.modules.writeback_targets(signal) {
                let mut blob: serde_json::Map<String, serde_json::Value> = self
                    .store
                    .kv_get(&state_key)
                    .ok()
                    .flatten()
                    .unwrap_or_default();
                blob.insert(field, serde_json::json!(now_ms));
                if let Err(err) = self.store.kv_set(&state_key, &blob) {
                    warn!(%err, state_key, "module state writeback failed");
                }
            }
        }

        // A picked cron_due advances the job's clock so it does not re-fire
        // until its next scheduled occurrence.
        for signal in picked.iter().filter(|s| s.kind == "cron_due") {
            let Some(cron_id) = signal.data.get("cron_id").and_then(|v| v.as_str()) else {
                continue;
            };
            let Ok(Some(job)) = self.store.get_cron(cron_id) else {
                continue;
            };
            let mut state = job.state.clone();
            state.last_run = Some(now_ms);
            state.next_run = vigil_signals::next_run_after(&job.schedule, &job.tz, now_ms);
            if let Err(err) = self.store.update_cron_state(cron_id, &state) {
                warn!(%err, cron_id, "failed to advance cron state");
            }
        }

        // Concluded-experiment signals are announce-once.
        let announced_now: Vec<String> = picked
            .iter()
            .filter(|s| s.kind == "experiment_concluded")
            .filter_map(|s| s.data.get("experiment_id").and_then(|v| v.as_str()))
            .map(str::to_string)
            .collect();
        if !announced_now.is_empty() {
            let key = vigil_signals::ANNOUNCED_EXPERIMENTS_KEY;
            let mut announced: Vec<String> = self
                .store
                .kv_get(key)
                .ok()
                .flatten()
                .unwrap_or_default();
            for id in announced_now {
                if !announced.contains(&id) {
                    announced.push(id);
                }
            }
            if let Err(err) = self.store.kv_set(key, &announced) {
                warn!(%err, "failed to record announced experiments");
            }
        }
    }

    fn append_recent_actions(&self, actions: &[String], now_ms: i64) {
        let mut ring: Vec<RecentAction> = self
            .store
            .kv_get(RECENT_ACTIONS_KEY)
            .ok()
            .flatten()
            .unwrap_or_default();
        ring.retain(|a| now_ms - a.ts < RECENT_ACTIONS_TTL_MS);
        for action in actions {
            ring.push(RecentAction {
                text: action.clone(),
                ts: now_ms,
            });
        }
        if ring.len() > RECENT_ACTIONS_CAP {
            let overflow = ring.len() - RECENT_ACTIONS_CAP;
            ring.drain(..overflow);
        }
        if let Err(err) = self.store.kv_set(RECENT_ACTIONS_KEY, &ring) {
            warn!(%err, "failed to persist recent actions");
        }
    }

    /// Append to the bounded operator event ring.
    pub fn push_event(&self, now_ms: i64, kind: &str, detail: &str) {
        let mut ring: Vec<EventEntry> = self
            .store
            .kv_get(EVENT_RING_KEY)
            .ok()
            .flatten()
            .unwrap_or_default();
        ring.push(EventEntry {
            ts: now_ms,
            kind: kind.to_string(),
            detail: detail.chars().take(300).collect(),
        });
        if ring.len() > EVENT_RING_CAP {
            let overflow = ring.len() - EVENT_RING_CAP;
            ring.drain(..overflow);
        }
        if let Err(err) = self.store.kv_set(EVENT_RING_KEY, &ring) {
            warn!(%err, "failed to persist event ring");
        }
    }

    /// Policy failure: log at info, record, continue.
    fn soft_fail(&self, report: &mut DispatchReport, now_ms: i64, tag: &str, reason: &str) {
        info!(tag, reason, "tag skipped");
        report.skipped.push(format!("{tag}: {reason}"));
        let entry = ErrorEntry {
            id: 0,
            severity: Severity::Info,
            module: "dispatch".into(),
            message: format!("{tag} skipped: {reason}"),
            stack: None,
            context: None,
            resolved: true,
            ts: now_ms,
        };
        if let Err(err) = self.store.log_error(&entry) {
            warn!(%err, "failed to journal a skipped tag");
        }
    }
}

fn short_id() -> String {
    Uuid::new_v4().to_string()[..8].to_string()
}

/// Read the ring as prompt-ready strings, oldest first.
pub fn recent_action_texts(store: &Store, now_ms: i64) -> Vec<String> {
    store
        .kv_get::<Vec<RecentAction>>(RECENT_ACTIONS_KEY)
        .ok()
        .flatten()
        .unwrap_or_default()
        .into_iter()
        .filter(|a| now_ms - a.ts < RECENT_ACTIONS_TTL_MS)
        .map(|a| a.text)
        .collect()
}

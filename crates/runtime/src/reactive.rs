//! Reactive driver: inbound text → per-sender debounce → router → queue →
//! handler.  Tier-0 work is answered locally; everything else rides the
//! reactive LLM mediator with context sized by tier.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, mpsc, watch};
use tracing::{debug, info, warn};
use uuid::Uuid;

use vigil_config::AppConfig;
use vigil_llm::{Mediator, ToolRegistry};
use vigil_modules::ModuleRegistry;
use vigil_router::{Queue, RouteKind, route_message};
use vigil_signals::{FOLLOWUPS_KEY, Followup};
use vigil_store::{
    MessageDirection, MessageRow, ReplyOutcome, Sentiment, Store, UserNote,
};
use vigil_transport::{InboundMessage, Transport};

/// KV key: everything at or before this timestamp is out of conversational
/// context (set by `/clear`).
const CONTEXT_CLEARED_KEY: &str = "context-cleared-at";
/// Sentiment only counts as a reaction inside this window.
const REACTION_WINDOW_MS: i64 = 6 * 3_600_000;

pub struct ReactiveDriver {
    pub config: AppConfig,
    pub store: Arc<Store>,
    pub modules: Arc<ModuleRegistry>,
    pub transport: Arc<dyn Transport>,
    pub mediator: Arc<Mediator>,
    pub tools: Arc<ToolRegistry>,
    pub queue: Queue,
}

struct DebounceState {
    buffer: Vec<String>,
    generation: u64,
}

impl ReactiveDriver {
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let (tx, mut rx) = mpsc::channel::<InboundMessage>(64);
        self.transport.on_message(tx);

        let driver = Arc::new(self);
        let debounce: Arc<Mutex<HashMap<String, DebounceState>>> =
            Arc::new(Mutex::new(HashMap::new()));

        loop {
            let message = tokio::select! {
                message = rx.recv() => message,
                changed = shutdown.changed() => {
                    if changed.is_ok() && *shutdown.borrow() {
                        info!("reactive driver stopping — no new messages accepted");
                        return;
                    }
                    continue;
                }
            };
            let Some(message) = message else {
                debug!("transport inbound channel closed");
                return;
            };

            // Debounce: rapid fragments from one sender collapse into a
            // single routed message.
            let generation = {
                let mut map = debounce.lock().await;
                let state = map
                    .entry(message.sender.clone())
                    .or_insert_with(|| DebounceState {
                        buffer: Vec::new(),
                        generation: 0,
                    });
                state.buffer.push(message.text.clone());
                state.generation += 1;
                state.generation
            };

            let driver = driver.clone();
            let debounce = debounce.clone();
            let sender = message.sender.clone();
            let ts = message.ts;
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(driver.config.queue.debounce_ms)).await;
                let flushed = {
                    let mut map = debounce.lock().await;
                    let Some(state) = map.get_mut(&sender) else {
                        return;
                    };
                    if state.generation != generation {
                        // A newer fragment restarted the window.
                        return;
                    }
                    std::mem::take(&mut state.buffer).join("\n")
                };
                if flushed.trim().is_empty() {
                    return;
                }
                driver.submit(sender, flushed, ts).await;
            });
        }
    }

    /// Queue the routed handling under the sender's FIFO chain.
    async fn submit(self: &Arc<Self>, sender: String, text: String, ts: i64) {
        let driver = self.clone();
        let user = sender.clone();
        let result = self
            .queue
            .enqueue(&user, async move {
                driver.handle(&sender, &text, ts).await;
            })
            .await;
        if !result.queued {
            warn!(user = %user, depth = result.depth, "inbound message rejected — queue full");
        }
    }

    async fn handle(&self, sender: &str, text: &str, ts: i64) {
        if let Err(err) = self.store.log_message(&MessageRow {
            id: 0,
            direction: MessageDirection::In,
            chat_id: sender.to_string(),
            body: text.to_string(),
            bot_msg_id: None,
            ts,
        }) {
            warn!(%err, "failed to log inbound message");
        }

        // Module-claimed prefixes short-circuit the router.
        for (prefix, category) in self.modules.message_categories() {
            if text.starts_with(&prefix) {
                debug!(category = %category, "message claimed by module prefix");
                let reply = handle_action(&category, None, &self.store, &self.config);
                self.reply(sender, &reply).await;
                return;
            }
        }

        let decision = route_message(text, sender);
        debug!(kind = ?decision.kind, tier = decision.tier, "message routed");

        match decision.kind {
            RouteKind::Action => {
                let action = decision.action.as_deref().unwrap_or("help");
                let reply = handle_action(action, decision.params.as_ref(), &self.store, &self.config);
                self.reply(sender, &reply).await;
            }
            RouteKind::Ack => {
                self.record_reaction(text, decision.params.as_ref()).await;
            }
            RouteKind::Claude => {
                self.claude_reply(sender, text, decision.tier).await;
            }
        }
    }

    /// A bare acknowledgment closes the loop on the last unanswered bot
    /// message instead of dialing the LLM.
    async fn record_reaction(&self, text: &str, params: Option<&serde_json::Value>) {
        let positive = params
            .and_then(|p| p.get("positive"))
            .and_then(|v| v.as_bool())
            .unwrap_or(true);
        let now_ms = self.store.now_ms();

        let Ok(Some((bot_msg_id, sent_at))) = self.store.latest_unanswered_bot_msg() else {
            debug!("ack with nothing to react to — dropped");
            return;
        };
        let window_ms = now_ms - sent_at;
        if window_ms > REACTION_WINDOW_MS {
            debug!("ack long after the last bot message — not counted as a reaction");
            return;
        }

        let outcome = ReplyOutcome {
            id: 0,
            bot_msg_id,
            signal: None,
            sentiment: Some(if positive {
                Sentiment::Positive
            } else {
                Sentiment::Negative
            }),
            classification: Some("ack".into()),
            user_response: Some(text.to_string()),
            window_ms: Some(window_ms),
            ts: now_ms,
        };
        if let Err(err) = self.store.log_reply_outcome(&outcome) {
            warn!(%err, "failed to record reply outcome");
        }
    }

    async fn claude_reply(&self, sender: &str, text: &str, tier: u8) {
        let model = if tier >= 3 {
            self.config.llm.expensive_model.clone()
        } else {
            self.config.llm.cheap_model.clone()
        };

        // Tier 2+ gets recent conversation for continuity; tier 1 rides bare.
        let context = if tier >= 2 {
            self.conversation_context(sender, 8)
        } else {
            String::new()
        };
        let prompt = if context.is_empty() {
            format!("USER MESSAGE:\n{text}\n\nASSISTANT RESPONSE:")
        } else {
            format!(
                "RECENT CONVERSATION:\n{context}\n\nUSER MESSAGE:\n{text}\n\nASSISTANT RESPONSE:"
            )
        };

        let session_id = Uuid::new_v4().to_string();
        // Tier 3 gets the tool loop; lower tiers are plain one-shot calls.
        let outcome = if tier >= 3 && !self.tools.is_empty() {
            self.mediator
                .tool_loop(
                    &self.store,
                    &self.tools,
                    &self.config.agent.personality,
                    &prompt,
                    &model,
                    Some(&session_id),
                )
                .await
        } else {
            self.mediator
                .one_shot(
                    &self.store,
                    &self.config.agent.personality,
                    &prompt,
                    &model,
                    Some(&session_id),
                    None,
                )
                .await
        };

        match outcome {
            Ok(chat) => self.reply(sender, &chat.reply).await,
            Err(err) => {
                warn!(%err, "reactive llm call failed");
                self.reply(sender, "I hit a snag processing that — try again in a moment.")
                    .await;
            }
        }
    }

    fn conversation_context(&self, sender: &str, turns: usize) -> String {
        let cleared_at: i64 = self
            .store
            .kv_get(CONTEXT_CLEARED_KEY)
            .ok()
            .flatten()
            .unwrap_or(0);
        let rows = self.store.recent_messages(sender, turns).unwrap_or_default();
        rows.iter()
            .filter(|m| m.ts > cleared_at)
            .map(|m| {
                let who = match m.direction {
                    MessageDirection::In => "User",
                    MessageDirection::Out => "Assistant",
                };
                format!("{who}: {}", m.body)
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    async fn reply(&self, sender: &str, text: &str) {
        let bot_msg_id = Uuid::new_v4().to_string()[..8].to_string();
        if let Err(err) = self.transport.send(sender, &bot_msg_id, text).await {
            warn!(%err, "reply delivery failed");
            return;
        }
        if let Err(err) = self.store.log_message(&MessageRow {
            id: 0,
            direction: MessageDirection::Out,
            chat_id: sender.to_string(),
            body: text.to_string(),
            bot_msg_id: Some(bot_msg_id),
            ts: self.store.now_ms(),
        }) {
            warn!(%err, "failed to log outbound reply");
        }
    }
}

/// Tier-0 command handlers.  Pure string-in/string-out over the store so the
/// transport and tests share them.
pub fn handle_action(
    action: &str,
    params: Option<&serde_json::Value>,
    store: &Store,
    config: &AppConfig,
) -> String {
    let args = params
        .and_then(|p| p.get("args").or_else(|| p.get("text")))
        .and_then(|v| v.as_str())
        .unwrap_or("");

    match action {
        "help" => [
            "/status — loop and memory state",
            "/goals — active goals",
            "/memory — memory pressure snapshot",
            "/experiments — experiment list",
            "/errors — recent unresolved errors",
            "/costs — today's LLM spend",
            "/clear — drop conversational context",
            "",
            "Anything else, just say it.",
        ]
        .join("\n"),
        "status" | "ping" => {
            let state: vigil_agent::AgentState = store
                .kv_get(vigil_agent::AGENT_STATE_KEY)
                .ok()
                .flatten()
                .unwrap_or_default();
            format!(
                "cycles: {}\nlast cycle: {}\nspend today: ${:.2}",
                state.cycle_count,
                state
                    .last_cycle_at
                    .map(|ts| ts.to_string())
                    .unwrap_or_else(|| "never".into()),
                store.cost_today().unwrap_or(0.0),
            )
        }
        "clear" => {
            let now = store.now_ms();
            match store.kv_set(CONTEXT_CLEARED_KEY, &now) {
                Ok(()) => "Context cleared.".into(),
                Err(_) => "Could not clear context.".into(),
            }
        }
        "goals" | "goal_progress" => {
            let goals = store.active_goals().unwrap_or_default();
            if goals.is_empty() {
                "No active goals right now.".into()
            } else {
                goals
                    .iter()
                    .map(|g| {
                        format!("[{}] {} — {} {}%", g.id, g.title, g.status.as_str(), g.progress)
                    })
                    .collect::<Vec<_>>()
                    .join("\n")
            }
        }
        "memory" => {
            let ring: Option<vigil_guard::SnapshotRing> =
                store.kv_get(vigil_guard::SNAPSHOTS_KEY).ok().flatten();
            match ring.as_ref().and_then(|r| r.latest().copied()) {
                Some(snapshot) => format!(
                    "rss: {:.0}MB ({:.0}% of limit), tier {}",
                    snapshot.rss_mb,
                    snapshot.heap_pct,
                    snapshot.tier.as_str()
                ),
                None => "No memory snapshots yet.".into(),
            }
        }
        "experiments" => {
            let experiments = store.all_experiments().unwrap_or_default();
            if experiments.is_empty() {
                "No experiments on file.".into()
            } else {
                experiments
                    .iter()
                    .map(|e| {
                        format!(
                            "[{}] {} — {}{}",
                            e.id,
                            e.name,
                            e.status.as_str(),
                            e.conclusion
                                .as_deref()
                                .map(|c| format!(" ({c})"))
                                .unwrap_or_default()
                        )
                    })
                    .collect::<Vec<_>>()
                    .join("\n")
            }
        }
        "errors" => {
            let errors = store.recent_errors(5).unwrap_or_default();
            if errors.is_empty() {
                "No recent errors.".into()
            } else {
                errors
                    .iter()
                    .map(|e| format!("#{} [{}] {}: {}", e.id, e.severity.as_str(), e.module, e.message))
                    .collect::<Vec<_>>()
                    .join("\n")
            }
        }
        "costs" => {
            let today = store.cost_today().unwrap_or(0.0);
            let buckets = store.cost_by_day(7).unwrap_or_default();
            let week: f64 = buckets.values().sum();
            format!("today: ${today:.2}\nlast 7 days: ${week:.2}")
        }
        "remind" => {
            let topic = args
                .trim_start_matches("remind me to ")
                .trim_start_matches("remind me about ")
                .trim_start_matches("recuérdame ")
                .trim_start_matches("recuerdame ")
                .trim();
            if topic.is_empty() {
                "Remind you about what?".into()
            } else {
                let mut pending: Vec<Followup> = store
                    .kv_get(FOLLOWUPS_KEY)
                    .ok()
                    .flatten()
                    .unwrap_or_default();
                pending.push(Followup {
                    topic: topic.to_string(),
                    created_at: store.now_ms(),
                });
                match store.kv_set(FOLLOWUPS_KEY, &pending) {
                    Ok(()) => format!("Noted — I'll follow up on: {topic}"),
                    Err(_) => "Could not save that reminder.".into(),
                }
            }
        }
        "reminders" => {
            let pending: Vec<Followup> = store
                .kv_get(FOLLOWUPS_KEY)
                .ok()
                .flatten()
                .unwrap_or_default();
            if pending.is_empty() {
                "Nothing pending.".into()
            } else {
                pending
                    .iter()
                    .map(|f| format!("- {}", f.topic))
                    .collect::<Vec<_>>()
                    .join("\n")
            }
        }
        "note" => {
            let content = args
                .splitn(2, [':', ' '])
                .nth(1)
                .unwrap_or(args)
                .trim()
                .to_string();
            if content.is_empty() {
                "Note what, exactly?".into()
            } else {
                let note = UserNote {
                    id: Uuid::new_v4().to_string(),
                    topic: "inbox".into(),
                    content,
                    ts: store.now_ms(),
                };
                match store.insert_user_note(&note) {
                    Ok(()) => "Noted.".into(),
                    Err(_) => "Could not save the note.".into(),
                }
            }
        }
        "search_messages" => {
            let query = args
                .rsplit_once(" for ")
                .or_else(|| args.rsplit_once(" about "))
                .map(|(_, q)| q)
                .unwrap_or(args)
                .trim();
            let hits = store.search_messages(query, 5).unwrap_or_default();
            if hits.is_empty() {
                format!("Nothing in the chat history about \"{query}\".")
            } else {
                hits.iter()
                    .map(|m| format!("- {}", m.body))
                    .collect::<Vec<_>>()
                    .join("\n")
            }
        }
        "version" => format!("{} — proactive personal agent", config.agent.name),
        "goodnight" => "Sleep well — I'll keep things quiet.".into(),
        "goodmorning" => "Morning! I'll have your day's picture shortly.".into(),
        "pause" => {
            let _ = store.kv_set("proactive-paused", &true);
            "Paused — I'll stay quiet until you say otherwise.".into()
        }
        "resume" => {
            let _ = store.kv_delete("proactive-paused");
            "Back on watch.".into()
        }
        "forget" => "Dropped.".into(),
        "schedule" => "I don't see a calendar hooked up yet.".into(),
        _ => "I know the intent but have no handler for it yet.".into(),
    }
}

#[cfg(test)]
mod tests {
    use vigil_clock::Clock;

    use super::*;

    #[test]
    fn status_reads_loop_state() {
        let store = Store::open_in_memory(Clock::default()).unwrap();
        let config = AppConfig::default();
        store
            .kv_set(
                vigil_agent::AGENT_STATE_KEY,
                &vigil_agent::AgentState {
                    cycle_count: 12,
                    last_cycle_at: Some(99),
                    ..Default::default()
                },
            )
            .unwrap();

        let reply = handle_action("status", None, &store, &config);
        assert!(reply.contains("cycles: 12"));
    }

    #[test]
    fn remind_appends_a_followup() {
        let store = Store::open_in_memory(Clock::default()).unwrap();
        let config = AppConfig::default();
        let params = serde_json::json!({ "text": "remind me to water the plants" });

        let reply = handle_action("remind", Some(&params), &store, &config);
        assert!(reply.contains("water the plants"));

        let pending: Vec<Followup> = store.kv_get(FOLLOWUPS_KEY).unwrap().unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].topic, "water the plants");
    }

    #[test]
    fn unknown_goals_list_is_friendly() {
        let store = Store::open_in_memory(Clock::default()).unwrap();
        let config = AppConfig::default();
        assert_eq!(
            handle_action("goals", None, &store, &config),
            "No active goals right now."
        );
    }
}

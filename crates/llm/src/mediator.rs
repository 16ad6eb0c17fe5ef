//! One-shot chat and the bounded tool loop, with retries and cost capture.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use vigil_store::{CostEntry, Store};

use crate::client::{ChatClient, ChatReply, ChatRequest};
use crate::tools::{ToolRegistry, parse_tool_calls, render_tool_results};
use crate::{LlmError, ModelPolicy};

/// Transient failures get this many retries, with the backoff delay doubling
/// each attempt.
const RETRY_ATTEMPTS: u32 = 1;
const RETRY_BASE_DELAY: Duration = Duration::from_secs(2);

/// Result of a mediated call: the final reply plus what it cost.
#[derive(Debug, Clone)]
pub struct ChatOutcome {
    pub reply: String,
    pub model: String,
    pub cost_usd: f64,
    pub input_tokens: i64,
    pub output_tokens: i64,
    /// Rounds actually taken (1 for one-shot).
    pub rounds: usize,
}

/// Mediates between callers and the [`ChatClient`], applying timeouts,
/// a single retry on transient failure, and per-round cost entries.
pub struct Mediator {
    client: Arc<dyn ChatClient>,
    pub policy: ModelPolicy,
    /// Which driver path this mediator serves; stamped into cost entries.
    kind: String,
    chat_timeout: Duration,
    tool_timeout: Duration,
    max_tool_rounds: usize,
}

impl Mediator {
    pub fn new(
        client: Arc<dyn ChatClient>,
        policy: ModelPolicy,
        kind: impl Into<String>,
        chat_timeout: Duration,
        tool_timeout: Duration,
        max_tool_rounds: usize,
    ) -> Self {
        Self {
            client,
            policy,
            kind: kind.into(),
            chat_timeout,
            tool_timeout,
            max_tool_rounds,
        }
    }

    pub async fn shutdown(&self) {
        self.client.shutdown().await;
    }

    /// One prompt, one reply.  Used for planning, synthesis, and briefing.
    pub async fn one_shot(
        &self,
        store: &Store,
        system: &str,
        prompt: &str,
        model: &str,
        session_id: Option<&str>,
        cron_id: Option<&str>,
    ) -> Result<ChatOutcome, LlmError> {
        let request = ChatRequest {
            system: system.to_string(),
            prompt: prompt.to_string(),
            model: model.to_string(),
        };

        let started = Instant::now();
        let reply = self.call_with_retry(&request, self.chat_timeout).await?;
        self.record_cost(store, &reply, started.elapsed(), session_id, cron_id);

        Ok(ChatOutcome {
            model: if reply.model.is_empty() {
                model.to_string()
            } else {
                reply.model.clone()
            },
            cost_usd: reply.cost_usd,
            input_tokens: reply.input_tokens,
            output_tokens: reply.output_tokens,
            reply: reply.text,
            rounds: 1,
        })
    }

    /// Issue a request and keep feeding tool results back until the model
    /// stops asking for tools or the round bound is hit.  Every round emits
    /// its own cost entry.
    pub async fn tool_loop(
        &self,
        store: &Store,
        registry: &ToolRegistry,
        system: &str,
        prompt: &str,
        model: &str,
        session_id: Option<&str>,
    ) -> Result<ChatOutcome, LlmError> {
        let deadline = Instant::now() + self.tool_timeout;
        let mut conversation = prompt.to_string();
        let mut total_cost = 0.0;
        let mut total_input = 0;
        let mut total_output = 0;
        let mut rounds = 0;
        let mut final_text = String::new();

        for round in 0..self.max_tool_rounds {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                warn!(round, "tool loop hit the wall-clock ceiling");
                break;
            }

            let request = ChatRequest {
                system: system.to_string(),
                prompt: conversation.clone(),
                model: model.to_string(),
            };
            let started = Instant::now();
            let reply = self.call_with_retry(&request, remaining).await?;
            self.record_cost(store, &reply, started.elapsed(), session_id, None);
            total_cost += reply.cost_usd;
            total_input += reply.input_tokens;
            total_output += reply.output_tokens;
            rounds += 1;

            let calls = parse_tool_calls(&reply.text);
            if calls.is_empty() || registry.is_empty() {
                final_text = reply.text;
                break;
            }

            info!(round, calls = calls.len(), "llm requested tool calls");
            let results = registry.execute_round(&calls).await;
            conversation.push_str("\n\nASSISTANT:\n");
            conversation.push_str(&reply.text);
            conversation.push_str("\n\nUSER:\n");
            conversation.push_str(&render_tool_results(&results));
            final_text = reply.text;
        }

        Ok(ChatOutcome {
            reply: final_text,
            model: model.to_string(),
            cost_usd: total_cost,
            input_tokens: total_input,
            output_tokens: total_output,
            rounds,
        })
    }

    /// Timeout-bounded call, retried on transient failure with exponential
    /// backoff (base delay doubled per attempt, one retry by default).
    /// Persistent failures bubble up as cycle errors; no partial dispatch
    /// happens downstream.
    async fn call_with_retry(
        &self,
        request: &ChatRequest,
        timeout: Duration,
    ) -> Result<ChatReply, LlmError> {
        let mut attempt: u32 = 0;
        loop {
            match self.call_once(request, timeout).await {
                Ok(reply) => return Ok(reply),
                Err(err) if err.is_transient() && attempt < RETRY_ATTEMPTS => {
                    let delay = RETRY_BASE_DELAY * 2u32.pow(attempt);
                    warn!(%err, attempt, ?delay, "llm call failed — backing off before retry");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn call_once(
        &self,
        request: &ChatRequest,
        timeout: Duration,
    ) -> Result<ChatReply, LlmError> {
        match tokio::time::timeout(timeout, self.client.chat(request)).await {
            Ok(result) => result,
            Err(_) => Err(LlmError::Timeout(timeout)),
        }
    }

    fn record_cost(
        &self,
        store: &Store,
        reply: &ChatReply,
        elapsed: Duration,
        session_id: Option<&str>,
        cron_id: Option<&str>,
    ) {
        let entry = CostEntry {
            id: 0,
            kind: self.kind.clone(),
            model: reply.model.clone(),
            input_tokens: reply.input_tokens,
            output_tokens: reply.output_tokens,
            cache_read: reply.cache_read,
            cost_usd: reply.cost_usd,
            duration_ms: elapsed.as_millis() as i64,
            session_id: session_id.map(str::to_string),
            cron_id: cron_id.map(str::to_string),
            ts: store.now_ms(),
        };
        if let Err(err) = store.insert_cost(&entry) {
            warn!(%err, "failed to record cost entry");
        } else {
            debug!(
                cost_usd = entry.cost_usd,
                model = %entry.model,
                "cost entry recorded"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;

    use vigil_clock::Clock;
    use vigil_store::Store;

    use super::*;
    use crate::tools::{Tool, ToolOutput, ToolSpec};

    /// Scripted client: pops replies front-to-back; errors once exhausted.
    struct Scripted {
        replies: Mutex<Vec<ChatReply>>,
        fail_first: Mutex<bool>,
    }

    impl Scripted {
        fn new(texts: &[&str]) -> Self {
            Self {
                replies: Mutex::new(
                    texts
                        .iter()
                        .map(|t| ChatReply {
                            text: t.to_string(),
                            input_tokens: 10,
                            output_tokens: 5,
                            cache_read: 0,
                            cost_usd: 0.01,
                            model: "cheap".into(),
                        })
                        .collect(),
                ),
                fail_first: Mutex::new(false),
            }
        }

        fn failing_once(texts: &[&str]) -> Self {
            let s = Self::new(texts);
            *s.fail_first.lock().unwrap() = true;
            s
        }
    }

    #[async_trait]
    impl ChatClient for Scripted {
        async fn chat(&self, _request: &ChatRequest) -> Result<ChatReply, LlmError> {
            let mut fail = self.fail_first.lock().unwrap();
            if *fail {
                *fail = false;
                return Err(LlmError::Subprocess("flaky".into()));
            }
            drop(fail);
            let mut replies = self.replies.lock().unwrap();
            if replies.is_empty() {
                return Err(LlmError::Subprocess("script exhausted".into()));
            }
            Ok(replies.remove(0))
        }
    }

    fn mediator(client: Arc<dyn ChatClient>) -> Mediator {
        Mediator::new(
            client,
            ModelPolicy::new("cheap", "big"),
            "proactive",
            Duration::from_secs(5),
            Duration::from_secs(30),
            5,
        )
    }

    struct Echo;

    #[async_trait]
    impl Tool for Echo {
        fn spec(&self) -> ToolSpec {
            ToolSpec {
                name: "echo".into(),
                description: "echo".into(),
            }
        }

        async fn run(&self, args: &serde_json::Value) -> anyhow::Result<ToolOutput> {
            Ok(ToolOutput {
                success: true,
                output: args.to_string(),
            })
        }
    }

    #[tokio::test]
    async fn one_shot_records_a_cost_entry() {
        let store = Store::open_in_memory(Clock::default()).unwrap();
        let m = mediator(Arc::new(Scripted::new(&["hello there"])));

        let outcome = m
            .one_shot(&store, "sys", "hi", "cheap", Some("s1"), None)
            .await
            .unwrap();
        assert_eq!(outcome.reply, "hello there");

        let costs = store.costs_since(0).unwrap();
        assert_eq!(costs.len(), 1);
        assert_eq!(costs[0].session_id.as_deref(), Some("s1"));
        assert_eq!(costs[0].kind, "proactive");
    }

    #[tokio::test]
    async fn transient_failure_is_retried_once() {
        let store = Store::open_in_memory(Clock::default()).unwrap();
        let m = mediator(Arc::new(Scripted::failing_once(&["recovered"])));

        let outcome = m
            .one_shot(&store, "sys", "hi", "cheap", None, None)
            .await
            .unwrap();
        assert_eq!(outcome.reply, "recovered");
    }

    #[tokio::test]
    async fn tool_loop_feeds_results_back() {
        let store = Store::open_in_memory(Clock::default()).unwrap();
        let mut registry = ToolRegistry::default();
        registry.register(Box::new(Echo));

        let m = mediator(Arc::new(Scripted::new(&[
            r#"checking <tool name="echo">{"q":1}</tool>"#,
            "final answer",
        ])));

        let outcome = m
            .tool_loop(&store, &registry, "sys", "go", "cheap", None)
            .await
            .unwrap();
        assert_eq!(outcome.reply, "final answer");
        assert_eq!(outcome.rounds, 2);
        // One cost entry per round.
        assert_eq!(store.costs_since(0).unwrap().len(), 2);
    }
}

//! Tool registry and the balanced tool-call markers embedded in reply text.
//!
//! A tool call looks like `<tool name="web_search">{"query":"..."}</tool>`.
//! Markers are scanned tolerantly: unknown names execute as failures the
//! model can read, unbalanced markers are ignored.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// Static metadata about a tool, surfaced to the LLM in the prompt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolOutput {
    pub success: bool,
    pub output: String,
}

#[async_trait]
pub trait Tool: Send + Sync {
    fn spec(&self) -> ToolSpec;
    async fn run(&self, args: &serde_json::Value) -> Result<ToolOutput>;
}

/// Per-round cap on executed calls; anything past it is reported back to the
/// model as skipped.
const MAX_CALLS_PER_ROUND: usize = 4;
/// Per-call wall clock bound.  Blocking tools are only cooperatively
/// cancellable, so this is the real guardrail.
const TOOL_CALL_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Default)]
pub struct ToolRegistry {
    tools: Vec<Box<dyn Tool>>,
}

impl ToolRegistry {
    pub fn register(&mut self, tool: Box<dyn Tool>) {
        self.tools.push(tool);
    }

    pub fn list_specs(&self) -> Vec<ToolSpec> {
        self.tools.iter().map(|t| t.spec()).collect()
    }

    pub fn get(&self, name: &str) -> Option<&dyn Tool> {
        self.tools
            .iter()
            .find(|t| t.spec().name == name)
            .map(|t| t.as_ref())
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Execute one round of parsed calls, bounded in count and wall clock.
    pub async fn execute_round(&self, calls: &[ToolCall]) -> Vec<(String, ToolOutput)> {
        let mut results = Vec::new();
        for (index, call) in calls.iter().enumerate() {
            if index >= MAX_CALLS_PER_ROUND {
                warn!(dropped = calls.len() - MAX_CALLS_PER_ROUND, "tool round over call cap");
                results.push((
                    call.name.clone(),
                    ToolOutput {
                        success: false,
                        output: "skipped: too many tool calls in one round".into(),
                    },
                ));
                continue;
            }

            let Some(tool) = self.get(&call.name) else {
                results.push((
                    call.name.clone(),
                    ToolOutput {
                        success: false,
                        output: format!("unknown tool: {}", call.name),
                    },
                ));
                continue;
            };

            info!(tool = %call.name, "executing tool call");
            let outcome = tokio::time::timeout(TOOL_CALL_TIMEOUT, tool.run(&call.args)).await;
            let output = match outcome {
                Ok(Ok(output)) => output,
                Ok(Err(err)) => ToolOutput {
                    success: false,
                    output: format!("tool error: {err}"),
                },
                Err(_) => ToolOutput {
                    success: false,
                    output: "tool timed out".into(),
                },
            };
            results.push((call.name.clone(), output));
        }
        results
    }
}

// ─── marker parsing ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct ToolCall {
    pub name: String,
    pub args: serde_json::Value,
}

/// Extract balanced `<tool name="...">payload</tool>` blocks from reply text.
/// Payloads that fail to parse as JSON become `{"raw": "..."}` so the tool
/// still sees them.  Unbalanced markers are ignored.
pub fn parse_tool_calls(text: &str) -> Vec<ToolCall> {
    let mut calls = Vec::new();
    let mut rest = text;

    while let Some(start) = rest.find("<tool") {
        let after_start = &rest[start..];
        let Some(tag_end) = after_start.find('>') else {
            break;
        };
        let open_tag = &after_start[..tag_end + 1];
        let Some(name) = attr_value(open_tag, "name") else {
            rest = &after_start[tag_end + 1..];
            continue;
        };

        let body_and_beyond = &after_start[tag_end + 1..];
        let Some(close) = body_and_beyond.find("</tool>") else {
            break;
        };
        let payload = body_and_beyond[..close].trim();

        let args = serde_json::from_str(payload)
            .unwrap_or_else(|_| serde_json::json!({ "raw": payload }));
        calls.push(ToolCall { name, args });

        rest = &body_and_beyond[close + "</tool>".len()..];
    }
    calls
}

/// Pull a quoted attribute out of an open tag, position-independent.
fn attr_value(tag: &str, attr: &str) -> Option<String> {
    let needle = format!("{attr}=\"");
    let start = tag.find(&needle)? + needle.len();
    let end = tag[start..].find('"')? + start;
    Some(tag[start..end].to_string())
}

/// Render one round of results as the follow-up user turn.
pub fn render_tool_results(results: &[(String, ToolOutput)]) -> String {
    let mut blocks: Vec<String> = Vec::new();
    for (name, output) in results {
        let status = if output.success { "ok" } else { "failed" };
        blocks.push(format!("TOOL RESULT [{name}] ({status}):\n{}", output.output));
    }
    blocks.join("\n\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_single_call() {
        let calls = parse_tool_calls(r#"let me check <tool name="web_search">{"query":"weather"}</tool>"#);
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].name, "web_search");
        assert_eq!(calls[0].args["query"], "weather");
    }

    #[test]
    fn parses_multiple_calls_in_order() {
        let text = r#"<tool name="a">{}</tool> then <tool name="b">{}</tool>"#;
        let names: Vec<_> = parse_tool_calls(text).into_iter().map(|c| c.name).collect();
        assert_eq!(names, vec!["a", "b"]);
    }

    #[test]
    fn unbalanced_marker_is_ignored() {
        assert!(parse_tool_calls(r#"<tool name="a">{"x":1}"#).is_empty());
    }

    #[test]
    fn non_json_payload_is_wrapped_raw() {
        let calls = parse_tool_calls(r#"<tool name="shell">ls -la</tool>"#);
        assert_eq!(calls[0].args["raw"], "ls -la");
    }

    struct Echo;

    #[async_trait]
    impl Tool for Echo {
        fn spec(&self) -> ToolSpec {
            ToolSpec {
                name: "echo".into(),
                description: "echo args back".into(),
            }
        }

        async fn run(&self, args: &serde_json::Value) -> Result<ToolOutput> {
            Ok(ToolOutput {
                success: true,
                output: args.to_string(),
            })
        }
    }

    #[tokio::test]
    async fn unknown_tool_fails_soft() {
        let mut registry = ToolRegistry::default();
        registry.register(Box::new(Echo));

        let calls = vec![ToolCall {
            name: "nope".into(),
            args: serde_json::json!({}),
        }];
        let results = registry.execute_round(&calls).await;
        assert!(!results[0].1.success);
        assert!(results[0].1.output.contains("unknown tool"));
    }
}

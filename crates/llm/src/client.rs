//! The chat seam and its production implementation: a long-lived CLI
//! subprocess speaking newline-framed JSON over stdin/stdout.
//!
//! One request frame per line in, one reply frame per line out.  Reply frames
//! carry `{text, inputTokens, outputTokens, model}` plus optional cache/cost
//! usage.  The child is respawned transparently after a crash; graceful
//! shutdown kills it outright, which also cancels any in-flight call.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::LlmError;

#[derive(Debug, Clone, Serialize)]
pub struct ChatRequest {
    pub system: String,
    pub prompt: String,
    pub model: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatReply {
    pub text: String,
    #[serde(default)]
    pub input_tokens: i64,
    #[serde(default)]
    pub output_tokens: i64,
    #[serde(default)]
    pub cache_read: i64,
    #[serde(default)]
    pub cost_usd: f64,
    #[serde(default)]
    pub model: String,
}

/// Seam between the mediator and whatever produces completions.  Production
/// uses [`SubprocessClient`]; tests script replies.
#[async_trait]
pub trait ChatClient: Send + Sync {
    async fn chat(&self, request: &ChatRequest) -> Result<ChatReply, LlmError>;

    /// Tear down any underlying process.  Default is a no-op.
    async fn shutdown(&self) {}
}

struct ChildIo {
    child: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
}

/// One subprocess per driver path so the reactive and proactive sides keep
/// isolated context caches.
pub struct SubprocessClient {
    command: Vec<String>,
    io: Mutex<Option<ChildIo>>,
}

impl SubprocessClient {
    pub fn new(command: &[String]) -> Self {
        Self {
            command: command.to_vec(),
            io: Mutex::new(None),
        }
    }

    async fn spawn(&self) -> Result<ChildIo, LlmError> {
        let (program, args) = self
            .command
            .split_first()
            .ok_or_else(|| LlmError::Subprocess("empty llm command".into()))?;

        let mut child = Command::new(program)
            .args(args)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::null())
            .kill_on_drop(true)
            .spawn()?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| LlmError::Subprocess("child stdin unavailable".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| LlmError::Subprocess("child stdout unavailable".into()))?;

        info!(program, "llm subprocess spawned");
        Ok(ChildIo {
            child,
            stdin,
            stdout: BufReader::new(stdout),
        })
    }

    async fn round_trip(&self, frame: &str) -> Result<String, LlmError> {
        let mut guard = self.io.lock().await;
        if guard.is_none() {
            *guard = Some(self.spawn().await?);
        }
        let io = guard.as_mut().ok_or_else(|| {
            LlmError::Subprocess("subprocess unavailable after spawn".into())
        })?;

        let outcome: Result<String, LlmError> = async {
            io.stdin.write_all(frame.as_bytes()).await?;
            io.stdin.write_all(b"\n").await?;
            io.stdin.flush().await?;

            let mut line = String::new();
            let n = io.stdout.read_line(&mut line).await?;
            if n == 0 {
                return Err(LlmError::Subprocess("subprocess closed stdout".into()));
            }
            Ok(line)
        }
        .await;

        // A dead pipe means a dead child; drop it so the next call respawns.
        if outcome.is_err() {
            if let Some(mut io) = guard.take() {
                let _ = io.child.kill().await;
            }
            warn!("llm subprocess dropped — will respawn on next call");
        }
        outcome
    }
}

#[async_trait]
impl ChatClient for SubprocessClient {
    async fn chat(&self, request: &ChatRequest) -> Result<ChatReply, LlmError> {
        let frame = serde_json::to_string(request)
            .map_err(|err| LlmError::Protocol(format!("unserializable request: {err}")))?;

        debug!(model = %request.model, prompt_len = request.prompt.len(), "llm frame out");
        let line = self.round_trip(&frame).await?;

        let reply: ChatReply = serde_json::from_str(line.trim())
            .map_err(|err| LlmError::Protocol(format!("undecodable reply frame: {err}")))?;
        debug!(
            reply_len = reply.text.len(),
            input_tokens = reply.input_tokens,
            output_tokens = reply.output_tokens,
            "llm frame in"
        );
        Ok(reply)
    }

    async fn shutdown(&self) {
        let mut guard = self.io.lock().await;
        if let Some(mut io) = guard.take() {
            if let Err(err) = io.child.kill().await {
                warn!(%err, "failed to kill llm subprocess");
            } else {
                info!("llm subprocess stopped");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reply_frame_decodes_with_camel_case_usage() {
        let line = r#"{"text":"hi","inputTokens":12,"outputTokens":3,"model":"cheap"}"#;
        let reply: ChatReply = serde_json::from_str(line).unwrap();
        assert_eq!(reply.text, "hi");
        assert_eq!(reply.input_tokens, 12);
        assert_eq!(reply.output_tokens, 3);
        assert_eq!(reply.cache_read, 0);
    }

    #[test]
    fn request_frame_is_single_line_json() {
        let request = ChatRequest {
            system: "be brief".into(),
            prompt: "hello\nworld".into(),
            model: "cheap".into(),
        };
        let frame = serde_json::to_string(&request).unwrap();
        assert!(!frame.contains('\n'));
    }
}

//! Messaging transport seam and the out-of-band notifier.
//!
//! The concrete chat binding (WhatsApp, Telegram, ...) lives behind the
//! [`Transport`] trait; the core only hands it text and receives inbound
//! messages through a channel.  Chunking at the 3.8k boundary is done here so
//! every binding inherits paragraph-aware splits.

pub mod console;

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Character budget per outbound chunk, under the usual 4k transport caps.
pub const MAX_CHUNK_CHARS: usize = 3_800;

/// An inbound message delivered by the transport binding.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundMessage {
    pub sender: String,
    pub text: String,
    pub media: Option<String>,
    pub ts: i64,
}

/// Outbound side of a chat binding.
///
/// `send` must be idempotent from the agent's point of view: the same
/// `bot_msg_id` delivered twice is deduplicated by the binding.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, chat_id: &str, bot_msg_id: &str, text: &str) -> Result<()>;

    async fn send_file(&self, chat_id: &str, path: &str, as_document: bool) -> Result<()>;

    /// Register the channel inbound messages are pushed into.
    fn on_message(&self, tx: mpsc::Sender<InboundMessage>);
}

/// Split `text` into chunks of at most `max_chars`, preferring paragraph and
/// line boundaries over mid-sentence cuts.
pub fn chunk_message(text: &str, max_chars: usize) -> Vec<String> {
    if text.chars().count() <= max_chars {
        return vec![text.to_string()];
    }

    let mut chunks = Vec::new();
    let mut current = String::new();
    let mut current_len = 0;

    for line in text.lines() {
        let line_len = line.chars().count() + 1;

        // A single line longer than the budget gets a hard character split.
        if line_len > max_chars {
            if current_len > 0 {
                chunks.push(current.trim_end().to_string());
                current.clear();
                current_len = 0;
            }
            let mut piece = String::new();
            for ch in line.chars() {
                piece.push(ch);
                if piece.chars().count() >= max_chars {
                    chunks.push(piece.clone());
                    piece.clear();
                }
            }
            if !piece.is_empty() {
                current.push_str(&piece);
                current.push('\n');
                current_len = piece.chars().count() + 1;
            }
            continue;
        }

        if current_len > 0 && current_len + line_len > max_chars {
            chunks.push(current.trim_end().to_string());
            current.clear();
            current_len = 0;
        }
        current.push_str(line);
        current.push('\n');
        current_len += line_len;
    }

    if !current.trim().is_empty() {
        chunks.push(current.trim_end().to_string());
    }

    if chunks.is_empty() {
        chunks.push(text.to_string());
    }
    chunks
}

// ─── notifier ────────────────────────────────────────────────────────────────

/// Fire-and-forget alert channel, separate from the user dialog.
///
/// Delivery is best-effort: the POST happens on a spawned task with a short
/// timeout, is never retried, and its failure is only ever logged.  Nothing
/// the notifier does feeds back into the signal stream.
#[derive(Debug, Clone)]
pub struct Notifier {
    url: Option<String>,
    client: reqwest::Client,
}

impl Notifier {
    pub fn new(url: &str) -> Self {
        Self {
            url: if url.trim().is_empty() {
                None
            } else {
                Some(url.trim().to_string())
            },
            client: reqwest::Client::new(),
        }
    }

    pub fn disabled() -> Self {
        Self::new("")
    }

    /// Never blocks the caller and never errors.
    pub fn notify(&self, text: &str) {
        let Some(url) = self.url.clone() else {
            debug!("notifier disabled — dropping alert");
            return;
        };
        let client = self.client.clone();
        let body = text.to_string();
        tokio::spawn(async move {
            let sent = client
                .post(&url)
                .timeout(Duration::from_secs(10))
                .body(body)
                .send()
                .await;
            if let Err(err) = sent {
                warn!(%err, "notifier delivery failed");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_text_is_one_chunk() {
        let chunks = chunk_message("hello", 3_800);
        assert_eq!(chunks, vec!["hello".to_string()]);
    }

    #[test]
    fn splits_on_line_boundaries() {
        let text = format!("{}\n{}", "a".repeat(30), "b".repeat(30));
        let chunks = chunk_message(&text, 40);
        assert_eq!(chunks.len(), 2);
        assert!(chunks[0].chars().all(|c| c == 'a'));
        assert!(chunks[1].chars().all(|c| c == 'b'));
    }

    #[test]
    fn oversized_single_line_hard_splits() {
        let text = "x".repeat(100);
        let chunks = chunk_message(&text, 40);
        assert!(chunks.len() >= 3);
        assert!(chunks.iter().all(|c| c.chars().count() <= 40));
        let total: usize = chunks.iter().map(|c| c.chars().count()).sum();
        assert_eq!(total, 100);
    }

    #[tokio::test]
    async fn disabled_notifier_is_a_no_op() {
        let notifier = Notifier::disabled();
        notifier.notify("CRITICAL memory pressure");
    }
}

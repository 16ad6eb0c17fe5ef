//! Console binding: stdin in, stdout out.  Mostly for local runs and
//! debugging; real chat bindings implement [`Transport`] the same way.

use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::Mutex;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::debug;

use crate::{InboundMessage, MAX_CHUNK_CHARS, Transport, chunk_message};

#[derive(Debug, Default)]
pub struct ConsoleTransport {
    /// Dedup of already-delivered bot message ids.
    delivered: Mutex<HashSet<String>>,
}

impl ConsoleTransport {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Transport for ConsoleTransport {
    async fn send(&self, chat_id: &str, bot_msg_id: &str, text: &str) -> Result<()> {
        {
            let mut delivered = self
                .delivered
                .lock()
                .map_err(|_| anyhow::anyhow!("dedup lock poisoned"))?;
            if !delivered.insert(bot_msg_id.to_string()) {
                debug!(bot_msg_id, "duplicate send suppressed");
                return Ok(());
            }
        }
        for chunk in chunk_message(text, MAX_CHUNK_CHARS) {
            println!("[{chat_id}] {chunk}");
        }
        Ok(())
    }

    async fn send_file(&self, chat_id: &str, path: &str, as_document: bool) -> Result<()> {
        println!("[{chat_id}] <file: {path} (document: {as_document})>");
        Ok(())
    }

    fn on_message(&self, tx: mpsc::Sender<InboundMessage>) {
        tokio::spawn(async move {
            let mut lines = BufReader::new(tokio::io::stdin()).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if line.trim().is_empty() {
                    continue;
                }
                let message = InboundMessage {
                    sender: "user".to_string(),
                    text: line,
                    media: None,
                    ts: chrono::Utc::now().timestamp_millis(),
                };
                if tx.send(message).await.is_err() {
                    break;
                }
            }
        });
    }
}

//! Channel history sources for backlog replay.
//!
//! Chat adapters implement [`MessageHistory`]. The CLI uses
//! [`JsonlHistory`], which reads an exported channel as one JSON object
//! per line:
//!
//! ```json
//! {"author_is_bot": false, "posted_at": "2026-03-01T12:00:00Z", "content": "listen https://youtu.be/dQw4w9WgXcQ"}
//! ```

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};

use crate::models::ChatMessage;

#[async_trait]
pub trait MessageHistory: Send + Sync {
    /// Up to `limit` of the most recent messages, newest first.
    async fn fetch_recent(&self, limit: usize) -> Result<Vec<ChatMessage>>;
}

/// A JSON-lines export of a channel.
pub struct JsonlHistory {
    path: PathBuf,
}

impl JsonlHistory {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl MessageHistory for JsonlHistory {
    async fn fetch_recent(&self, limit: usize) -> Result<Vec<ChatMessage>> {
        let content = tokio::fs::read_to_string(&self.path)
            .await
            .with_context(|| format!("Failed to read history file: {}", self.path.display()))?;

        let mut messages = parse_jsonl(&content)
            .with_context(|| format!("Malformed history file: {}", self.path.display()))?;

        // Exports are not guaranteed to be ordered; stable sort keeps file
        // order among equal timestamps.
        messages.sort_by(|a, b| b.posted_at.cmp(&a.posted_at));
        messages.truncate(limit);
        Ok(messages)
    }
}

fn parse_jsonl(content: &str) -> Result<Vec<ChatMessage>> {
    content
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(idx, line)| {
            serde_json::from_str::<ChatMessage>(line)
                .with_context(|| format!("line {}", idx + 1))
        })
        .collect()
}

//! Core data models used throughout the relay.
//!
//! These types represent the links, dedup records, and credentials that flow
//! through classification, deduplication, and playlist sync.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// The external service a link belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    YouTube,
    SoundCloud,
    Unknown,
}

impl ProviderKind {
    /// The providers a playlist can be synced to.
    pub const ALL: [ProviderKind; 2] = [ProviderKind::YouTube, ProviderKind::SoundCloud];

    /// Stable lowercase label, used as the `provider` column value.
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::YouTube => "youtube",
            ProviderKind::SoundCloud => "soundcloud",
            ProviderKind::Unknown => "unknown",
        }
    }

    /// Human-readable display name.
    pub fn display_name(&self) -> &'static str {
        match self {
            ProviderKind::YouTube => "YouTube",
            ProviderKind::SoundCloud => "SoundCloud",
            ProviderKind::Unknown => "Unknown",
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "youtube" => Ok(ProviderKind::YouTube),
            "soundcloud" => Ok(ProviderKind::SoundCloud),
            "unknown" => Ok(ProviderKind::Unknown),
            other => anyhow::bail!(
                "Unknown provider: '{}'. Must be youtube or soundcloud.",
                other
            ),
        }
    }
}

/// A link found in free text, already classified.
///
/// Produced fresh per classification call and never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractedLink {
    /// The URL exactly as it appeared in the text.
    pub raw_url: String,
    pub provider: ProviderKind,
    /// Video id (YouTube) or `user/track` path (SoundCloud).
    pub external_id: String,
}

/// A `(community, url)` pair that has been synced to a playlist.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessedLinkRecord {
    pub community_id: i64,
    /// Canonical URL (see [`crate::classify::normalize`]).
    pub url: String,
    pub provider: ProviderKind,
    pub external_id: Option<String>,
    pub title: Option<String>,
    pub processed_at: DateTime<Utc>,
}

/// A message as delivered by the chat platform.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    #[serde(default)]
    pub author_is_bot: bool,
    pub posted_at: DateTime<Utc>,
    pub content: String,
}

impl ChatMessage {
    pub fn new(content: impl Into<String>, posted_at: DateTime<Utc>) -> Self {
        Self {
            author_is_bot: false,
            posted_at,
            content: content.into(),
        }
    }
}

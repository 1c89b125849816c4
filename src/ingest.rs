//! Ingestion pipeline.
//!
//! Ties classification, the dedup store, and the playlist providers
//! together. The live path ([`Pipeline::ingest_message`]) and the backlog
//! path ([`Pipeline::replay_backlog`]) both funnel every message through
//! [`Pipeline::ingest`], so they share one dedup story:
//!
//! ```text
//! text ─▶ extract_links ─▶ provider configured? ─▶ is_processed ─▶ try_claim
//!                                                                     │
//!            mark_processed ◀── resolve_title ◀── ok ◀── add_track ◀──┘
//!            release_claim  ◀─────────────────── err ◀──┘
//! ```
//!
//! Links are keyed by their canonical URL, so the same video pasted as
//! `youtu.be/..` and `m.youtube.com/watch?v=..` is synced once.

use anyhow::{bail, Result};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::classify::{extract_links, normalize};
use crate::history::MessageHistory;
use crate::models::{ChatMessage, ExtractedLink, ProviderKind};
use crate::providers::{ProviderError, Providers};
use crate::store::{Claim, DedupStore};

/// Largest backlog a single replay may request.
pub const MAX_BACKLOG: usize = 100;

/// What happened to one link.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum LinkOutcome {
    /// The playlist holds the track and the store records it.
    /// `newly_added` is false when the track was already in the playlist.
    Synced { newly_added: bool },
    /// Already recorded for this community, or claimed by a concurrent caller.
    Duplicate,
    /// No client is configured for the link's provider. Store untouched.
    UnconfiguredProvider,
    /// The sync did not complete; the link stays unrecorded.
    Failed { error: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LinkReport {
    pub raw_url: String,
    /// Canonical URL used as the dedup key.
    pub url: String,
    pub provider: ProviderKind,
    #[serde(flatten)]
    pub outcome: LinkOutcome,
}

/// Aggregate counters for a backlog replay.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BacklogSummary {
    pub total_links_seen: usize,
    pub synced_by_provider: BTreeMap<ProviderKind, usize>,
    pub skipped_unconfigured_provider: usize,
    pub duplicates: usize,
    pub failed: usize,
    pub messages_scanned: usize,
}

impl BacklogSummary {
    pub fn record(&mut self, reports: &[LinkReport]) {
        for report in reports {
            self.total_links_seen += 1;
            match &report.outcome {
                LinkOutcome::Synced { .. } => {
                    *self.synced_by_provider.entry(report.provider).or_default() += 1
                }
                LinkOutcome::Duplicate => self.duplicates += 1,
                LinkOutcome::UnconfiguredProvider => self.skipped_unconfigured_provider += 1,
                LinkOutcome::Failed { .. } => self.failed += 1,
            }
        }
    }

    pub fn synced(&self, provider: ProviderKind) -> usize {
        self.synced_by_provider.get(&provider).copied().unwrap_or(0)
    }
}

impl fmt::Display for BacklogSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "  messages scanned: {}", self.messages_scanned)?;
        writeln!(f, "  links seen: {}", self.total_links_seen)?;
        for kind in ProviderKind::ALL {
            writeln!(f, "  synced to {}: {}", kind.display_name(), self.synced(kind))?;
        }
        writeln!(f, "  duplicates: {}", self.duplicates)?;
        writeln!(
            f,
            "  skipped (provider not configured): {}",
            self.skipped_unconfigured_provider
        )?;
        write!(f, "  failed: {}", self.failed)
    }
}

/// The shared ingestion path.
#[derive(Clone)]
pub struct Pipeline {
    store: Arc<dyn DedupStore>,
    providers: Providers,
    shutdown: CancellationToken,
}

impl Pipeline {
    pub fn new(store: Arc<dyn DedupStore>, providers: Providers, shutdown: CancellationToken) -> Self {
        Self {
            store,
            providers,
            shutdown,
        }
    }

    pub fn providers(&self) -> &Providers {
        &self.providers
    }

    /// Classify `raw_text` and sync every link it contains, in order.
    ///
    /// Never fails as a whole: a problem with one link becomes that link's
    /// [`LinkOutcome::Failed`].
    pub async fn ingest(&self, community_id: i64, raw_text: &str) -> Vec<LinkReport> {
        let links = extract_links(raw_text);
        let mut reports = Vec::with_capacity(links.len());

        for link in links {
            let url = normalize(&link.raw_url).unwrap_or_else(|| link.raw_url.clone());
            let outcome = self.process_link(community_id, &link, &url).await;
            reports.push(LinkReport {
                raw_url: link.raw_url,
                url,
                provider: link.provider,
                outcome,
            });
        }

        reports
    }

    /// Live path: ingest one chat message. Bot-authored messages are ignored.
    pub async fn ingest_message(&self, community_id: i64, message: &ChatMessage) -> Vec<LinkReport> {
        if message.author_is_bot {
            return Vec::new();
        }
        self.ingest(community_id, &message.content).await
    }

    /// Backlog path: replay the `count` most recent messages, oldest first.
    pub async fn replay_backlog(
        &self,
        community_id: i64,
        history: &dyn MessageHistory,
        count: usize,
    ) -> Result<BacklogSummary> {
        if !(1..=MAX_BACKLOG).contains(&count) {
            bail!("backlog count must be between 1 and {}, got {}", MAX_BACKLOG, count);
        }

        let mut messages = history.fetch_recent(count).await?;
        messages.reverse();

        let mut summary = BacklogSummary::default();
        for message in messages.iter().filter(|m| !m.author_is_bot) {
            if self.shutdown.is_cancelled() {
                tracing::warn!(
                    community_id,
                    scanned = summary.messages_scanned,
                    "Backlog replay interrupted by shutdown"
                );
                break;
            }
            let reports = self.ingest(community_id, &message.content).await;
            summary.record(&reports);
            summary.messages_scanned += 1;
        }

        tracing::info!(
            community_id,
            links = summary.total_links_seen,
            failed = summary.failed,
            "Backlog replay finished"
        );
        Ok(summary)
    }

    async fn process_link(&self, community_id: i64, link: &ExtractedLink, url: &str) -> LinkOutcome {
        let Some(provider) = self.providers.get(link.provider) else {
            tracing::debug!(url, "{} is not configured; skipping", link.provider.display_name());
            return LinkOutcome::UnconfiguredProvider;
        };

        match self.store.is_processed(community_id, url).await {
            Ok(true) => return LinkOutcome::Duplicate,
            Ok(false) => {}
            Err(e) => return storage_failure(url, e),
        }

        // The store's uniqueness constraint decides who syncs; losers report duplicate.
        match self.store.try_claim(community_id, url, link.provider).await {
            Ok(Claim::Claimed) => {}
            Ok(Claim::AlreadyRecorded) => return LinkOutcome::Duplicate,
            Err(e) => return storage_failure(url, e),
        }

        let added = tokio::select! {
            r = provider.add_track(&link.external_id) => r,
            _ = self.shutdown.cancelled() => Err(ProviderError::cancelled()),
        };

        let added = match added {
            Ok(outcome) => outcome,
            Err(e) => {
                if e.is_transient() {
                    tracing::warn!(url, "Sync to {} failed, will retry later: {}", link.provider, e);
                } else {
                    tracing::error!(url, "Sync to {} failed: {}", link.provider, e);
                }
                self.release(community_id, url).await;
                return LinkOutcome::Failed {
                    error: e.to_string(),
                };
            }
        };

        let title = tokio::select! {
            t = provider.resolve_title(&link.external_id) => t,
            _ = self.shutdown.cancelled() => None,
        };

        if let Err(e) = self
            .store
            .mark_processed(
                community_id,
                url,
                link.provider,
                Some(&link.external_id),
                title.as_deref(),
            )
            .await
        {
            // The playlist holds the track; a retry will find it present.
            tracing::error!(url, "Synced but could not record: {:#}", e);
            self.release(community_id, url).await;
            return LinkOutcome::Failed {
                error: format!("synced but not recorded: {}", e),
            };
        }

        tracing::info!(
            community_id,
            url,
            title = title.as_deref().unwrap_or(""),
            newly_added = added.newly_added(),
            "Synced link to {}",
            link.provider.display_name()
        );
        LinkOutcome::Synced {
            newly_added: added.newly_added(),
        }
    }

    async fn release(&self, community_id: i64, url: &str) {
        if let Err(e) = self.store.release_claim(community_id, url).await {
            tracing::error!(url, "Failed to release claim: {:#}", e);
        }
    }
}

fn storage_failure(url: &str, e: anyhow::Error) -> LinkOutcome {
    tracing::error!(url, "Dedup store error: {:#}", e);
    LinkOutcome::Failed {
        error: format!("storage error: {}", e),
    }
}

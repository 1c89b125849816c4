//! Deduplication store.
//!
//! The [`DedupStore`] trait is the durable record of `(community, url)` pairs
//! that have already been synced to a playlist. Two implementations ship:
//!
//! - [`SqliteDedupStore`](sqlite::SqliteDedupStore): the production backend.
//! - [`InMemoryDedupStore`](memory::InMemoryDedupStore): for tests and embedders.
//!
//! # Uniqueness
//!
//! `(community_id, url)` is unique at the storage level. Writers never check
//! before they insert; they insert and treat a uniqueness violation as
//! "already recorded by someone else". That is what keeps concurrent live
//! ingestion and backlog replay from syncing one URL twice.
//!
//! # Claims
//!
//! A row starts life as a pending claim ([`DedupStore::try_claim`]) taken
//! before the provider is called, and becomes a synced record through
//! [`DedupStore::mark_processed`]. A failed sync releases the claim so a
//! later pass can retry. Only synced rows count for
//! [`DedupStore::is_processed`].
//!
//! Implementations must be `Send + Sync` to work with async runtimes.

pub mod memory;
pub mod sqlite;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Duration;

use crate::models::ProviderKind;

pub use memory::InMemoryDedupStore;
pub use sqlite::SqliteDedupStore;

/// Result of trying to claim a `(community, url)` key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Claim {
    /// This caller owns the key and should call the provider.
    Claimed,
    /// A synced record or another caller's claim already holds the key.
    AlreadyRecorded,
}

/// Synced record count for one community and provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderCount {
    pub community_id: i64,
    pub provider: String,
    pub count: i64,
    pub last_processed_at: Option<i64>,
}

/// Abstract dedup backend.
///
/// # Operations
///
/// | Method | Purpose |
/// |--------|---------|
/// | [`is_processed`](DedupStore::is_processed) | Membership test over synced rows |
/// | [`try_claim`](DedupStore::try_claim) | Insert a pending claim, losing gracefully on conflict |
/// | [`mark_processed`](DedupStore::mark_processed) | Idempotent record of a successful sync |
/// | [`release_claim`](DedupStore::release_claim) | Drop a pending claim after a failed sync |
/// | [`release_stale_claims`](DedupStore::release_stale_claims) | Crash recovery for abandoned claims |
/// | [`retention_sweep`](DedupStore::retention_sweep) | Delete records older than a threshold |
/// | [`stats`](DedupStore::stats) | Per-community, per-provider counts |
#[async_trait]
pub trait DedupStore: Send + Sync {
    /// Whether `url` has been synced for `community_id`.
    async fn is_processed(&self, community_id: i64, url: &str) -> Result<bool>;

    /// Insert a pending claim for the key.
    async fn try_claim(&self, community_id: i64, url: &str, provider: ProviderKind)
        -> Result<Claim>;

    /// Record a successful sync.
    ///
    /// Calling this twice for the same key leaves exactly one record and
    /// does not fail. A pending claim for the key is finalized in place.
    async fn mark_processed(
        &self,
        community_id: i64,
        url: &str,
        provider: ProviderKind,
        external_id: Option<&str>,
        title: Option<&str>,
    ) -> Result<()>;

    /// Remove a pending claim. Synced records are never touched.
    async fn release_claim(&self, community_id: i64, url: &str) -> Result<()>;

    /// Remove pending claims older than `older_than`. Returns rows removed.
    async fn release_stale_claims(&self, older_than: Duration) -> Result<u64>;

    /// Delete synced records older than `max_age_days`. Returns rows removed.
    async fn retention_sweep(&self, max_age_days: u32) -> Result<u64>;

    /// Synced record counts grouped by community and provider.
    async fn stats(&self) -> Result<Vec<ProviderCount>>;
}

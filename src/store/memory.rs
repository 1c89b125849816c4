//! In-memory [`DedupStore`] implementation for testing and embedding.
//!
//! Uses a `HashMap` keyed by `(community_id, url)` behind `std::sync::Mutex`.
//! The map's single-entry-per-key property plays the role of the SQLite
//! unique index: inserts go through the `Entry` API and a vacant check is
//! never separated from the write.

use std::collections::hash_map::Entry;
use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};

use crate::models::{ProcessedLinkRecord, ProviderKind};

use super::{Claim, DedupStore, ProviderCount};

#[derive(Debug, Clone)]
enum Row {
    Pending { claimed_at: DateTime<Utc> },
    Synced(ProcessedLinkRecord),
}

/// In-memory dedup store.
#[derive(Default)]
pub struct InMemoryDedupStore {
    rows: Mutex<HashMap<(i64, String), Row>>,
}

impl InMemoryDedupStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of all synced records, ordered by community then URL.
    pub fn records(&self) -> Vec<ProcessedLinkRecord> {
        let rows = self.rows.lock().unwrap();
        let mut out: Vec<ProcessedLinkRecord> = rows
            .values()
            .filter_map(|row| match row {
                Row::Synced(record) => Some(record.clone()),
                Row::Pending { .. } => None,
            })
            .collect();
        out.sort_by(|a, b| (a.community_id, &a.url).cmp(&(b.community_id, &b.url)));
        out
    }

    /// Number of rows (pending and synced) currently held.
    pub fn len(&self) -> usize {
        self.rows.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Backdate a synced record, for retention tests.
    pub fn set_processed_at(&self, community_id: i64, url: &str, at: DateTime<Utc>) {
        let mut rows = self.rows.lock().unwrap();
        if let Some(Row::Synced(record)) = rows.get_mut(&(community_id, url.to_string())) {
            record.processed_at = at;
        }
    }
}

#[async_trait]
impl DedupStore for InMemoryDedupStore {
    async fn is_processed(&self, community_id: i64, url: &str) -> Result<bool> {
        let rows = self.rows.lock().unwrap();
        Ok(matches!(
            rows.get(&(community_id, url.to_string())),
            Some(Row::Synced(_))
        ))
    }

    async fn try_claim(
        &self,
        community_id: i64,
        url: &str,
        _provider: ProviderKind,
    ) -> Result<Claim> {
        let mut rows = self.rows.lock().unwrap();
        match rows.entry((community_id, url.to_string())) {
            Entry::Occupied(_) => Ok(Claim::AlreadyRecorded),
            Entry::Vacant(slot) => {
                slot.insert(Row::Pending {
                    claimed_at: Utc::now(),
                });
                Ok(Claim::Claimed)
            }
        }
    }

    async fn mark_processed(
        &self,
        community_id: i64,
        url: &str,
        provider: ProviderKind,
        external_id: Option<&str>,
        title: Option<&str>,
    ) -> Result<()> {
        let record = ProcessedLinkRecord {
            community_id,
            url: url.to_string(),
            provider,
            external_id: external_id.map(str::to_string),
            title: title.map(str::to_string),
            processed_at: Utc::now(),
        };

        let mut rows = self.rows.lock().unwrap();
        match rows.entry((community_id, url.to_string())) {
            Entry::Vacant(slot) => {
                slot.insert(Row::Synced(record));
            }
            Entry::Occupied(mut slot) => {
                if matches!(slot.get(), Row::Pending { .. }) {
                    slot.insert(Row::Synced(record));
                }
            }
        }
        Ok(())
    }

    async fn release_claim(&self, community_id: i64, url: &str) -> Result<()> {
        let mut rows = self.rows.lock().unwrap();
        let key = (community_id, url.to_string());
        if matches!(rows.get(&key), Some(Row::Pending { .. })) {
            rows.remove(&key);
        }
        Ok(())
    }

    async fn release_stale_claims(&self, older_than: Duration) -> Result<u64> {
        let cutoff = Utc::now() - older_than;
        let mut rows = self.rows.lock().unwrap();
        let before = rows.len();
        rows.retain(|_, row| match row {
            Row::Pending { claimed_at } => *claimed_at >= cutoff,
            Row::Synced(_) => true,
        });
        Ok((before - rows.len()) as u64)
    }

    async fn retention_sweep(&self, max_age_days: u32) -> Result<u64> {
        let cutoff = Utc::now() - Duration::days(i64::from(max_age_days));
        let mut rows = self.rows.lock().unwrap();
        let before = rows.len();
        rows.retain(|_, row| match row {
            Row::Synced(record) => record.processed_at >= cutoff,
            Row::Pending { .. } => true,
        });
        Ok((before - rows.len()) as u64)
    }

    async fn stats(&self) -> Result<Vec<ProviderCount>> {
        let rows = self.rows.lock().unwrap();
        let mut grouped: BTreeMap<(i64, String), (i64, i64)> = BTreeMap::new();
        for row in rows.values() {
            if let Row::Synced(record) = row {
                let ts = record.processed_at.timestamp();
                let entry = grouped
                    .entry((record.community_id, record.provider.as_str().to_string()))
                    .or_insert((0, ts));
                entry.0 += 1;
                entry.1 = entry.1.max(ts);
            }
        }
        Ok(grouped
            .into_iter()
            .map(|((community_id, provider), (count, last))| ProviderCount {
                community_id,
                provider,
                count,
                last_processed_at: Some(last),
            })
            .collect())
    }
}

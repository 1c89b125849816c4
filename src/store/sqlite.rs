//! SQLite-backed [`DedupStore`].
//!
//! Relies on the `UNIQUE(community_id, url)` constraint created by
//! [`crate::migrate`]. Inserts are never preceded by a membership check; a
//! constraint violation is the signal that a row already exists.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{Duration, Utc};
use sqlx::{Row, SqlitePool};

use crate::models::ProviderKind;

use super::{Claim, DedupStore, ProviderCount};

const STATUS_PENDING: &str = "pending";
const STATUS_SYNCED: &str = "synced";

/// SQLite implementation of the [`DedupStore`] trait.
pub struct SqliteDedupStore {
    pool: SqlitePool,
}

impl SqliteDedupStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db_err) => db_err.is_unique_violation(),
        _ => false,
    }
}

#[async_trait]
impl DedupStore for SqliteDedupStore {
    async fn is_processed(&self, community_id: i64, url: &str) -> Result<bool> {
        let found: Option<i64> = sqlx::query_scalar(
            "SELECT 1 FROM processed_links WHERE community_id = ? AND url = ? AND status = ?",
        )
        .bind(community_id)
        .bind(url)
        .bind(STATUS_SYNCED)
        .fetch_optional(&self.pool)
        .await?;

        Ok(found.is_some())
    }

    async fn try_claim(
        &self,
        community_id: i64,
        url: &str,
        provider: ProviderKind,
    ) -> Result<Claim> {
        let result = sqlx::query(
            r#"
            INSERT INTO processed_links (community_id, url, provider, status, processed_at)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(community_id)
        .bind(url)
        .bind(provider.as_str())
        .bind(STATUS_PENDING)
        .bind(Utc::now().timestamp())
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(Claim::Claimed),
            Err(e) if is_unique_violation(&e) => Ok(Claim::AlreadyRecorded),
            Err(e) => Err(e.into()),
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
        let now = Utc::now().timestamp();

        let result = sqlx::query(
            r#"
            INSERT INTO processed_links (community_id, url, provider, external_id, title, status, processed_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(community_id)
        .bind(url)
        .bind(provider.as_str())
        .bind(external_id)
        .bind(title)
        .bind(STATUS_SYNCED)
        .bind(now)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(e) if is_unique_violation(&e) => {
                // Already recorded. If the existing row is our pending claim,
                // finalize it; a synced row is left exactly as it is.
                sqlx::query(
                    r#"
                    UPDATE processed_links
                    SET provider = ?, external_id = ?, title = ?, status = ?, processed_at = ?
                    WHERE community_id = ? AND url = ? AND status = ?
                    "#,
                )
                .bind(provider.as_str())
                .bind(external_id)
                .bind(title)
                .bind(STATUS_SYNCED)
                .bind(now)
                .bind(community_id)
                .bind(url)
                .bind(STATUS_PENDING)
                .execute(&self.pool)
                .await?;
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn release_claim(&self, community_id: i64, url: &str) -> Result<()> {
        sqlx::query("DELETE FROM processed_links WHERE community_id = ? AND url = ? AND status = ?")
            .bind(community_id)
            .bind(url)
            .bind(STATUS_PENDING)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn release_stale_claims(&self, older_than: Duration) -> Result<u64> {
        let cutoff = (Utc::now() - older_than).timestamp();
        let result =
            sqlx::query("DELETE FROM processed_links WHERE status = ? AND processed_at < ?")
                .bind(STATUS_PENDING)
                .bind(cutoff)
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected())
    }

    async fn retention_sweep(&self, max_age_days: u32) -> Result<u64> {
        let cutoff = (Utc::now() - Duration::days(i64::from(max_age_days))).timestamp();
        let result =
            sqlx::query("DELETE FROM processed_links WHERE status = ? AND processed_at < ?")
                .bind(STATUS_SYNCED)
                .bind(cutoff)
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected())
    }

    async fn stats(&self) -> Result<Vec<ProviderCount>> {
        let rows = sqlx::query(
            r#"
            SELECT community_id, provider, COUNT(*) AS count, MAX(processed_at) AS last_ts
            FROM processed_links
            WHERE status = ?
            GROUP BY community_id, provider
            ORDER BY community_id, provider
            "#,
        )
        .bind(STATUS_SYNCED)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| ProviderCount {
                community_id: row.get("community_id"),
                provider: row.get("provider"),
                count: row.get("count"),
                last_processed_at: row.get("last_ts"),
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{db, migrate};
    use tempfile::TempDir;

    const URL: &str = "https://www.youtube.com/watch?v=dQw4w9WgXcQ";

    async fn open_store() -> (SqliteDedupStore, TempDir) {
        let tmp = TempDir::new().unwrap();
        let pool = db::connect_path(&tmp.path().join("relay.sqlite"))
            .await
            .unwrap();
        migrate::apply_schema(&pool).await.unwrap();
        (SqliteDedupStore::new(pool), tmp)
    }

    async fn row_count(store: &SqliteDedupStore) -> i64 {
        sqlx::query_scalar("SELECT COUNT(*) FROM processed_links")
            .fetch_one(store.pool())
            .await
            .unwrap()
    }

    async fn backdate(store: &SqliteDedupStore, url: &str, age: Duration) {
        sqlx::query("UPDATE processed_links SET processed_at = ? WHERE url = ?")
            .bind((Utc::now() - age).timestamp())
            .bind(url)
            .execute(store.pool())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_mark_processed_twice_leaves_one_row() {
        let (store, _tmp) = open_store().await;
        for _ in 0..2 {
            store
                .mark_processed(1, URL, ProviderKind::YouTube, Some("dQw4w9WgXcQ"), None)
                .await
                .unwrap();
        }

        assert_eq!(row_count(&store).await, 1);
        assert!(store.is_processed(1, URL).await.unwrap());
        assert_eq!(
            store.try_claim(1, URL, ProviderKind::YouTube).await.unwrap(),
            Claim::AlreadyRecorded
        );
    }

    #[tokio::test]
    async fn test_mark_processed_finalizes_pending_claim() {
        let (store, _tmp) = open_store().await;
        assert_eq!(
            store.try_claim(1, URL, ProviderKind::YouTube).await.unwrap(),
            Claim::Claimed
        );
        assert!(!store.is_processed(1, URL).await.unwrap());

        store
            .mark_processed(1, URL, ProviderKind::YouTube, Some("dQw4w9WgXcQ"), Some("Title"))
            .await
            .unwrap();

        assert!(store.is_processed(1, URL).await.unwrap());
        assert_eq!(row_count(&store).await, 1);
        let (external_id, title): (Option<String>, Option<String>) =
            sqlx::query_as("SELECT external_id, title FROM processed_links WHERE url = ?")
                .bind(URL)
                .fetch_one(store.pool())
                .await
                .unwrap();
        assert_eq!(external_id.as_deref(), Some("dQw4w9WgXcQ"));
        assert_eq!(title.as_deref(), Some("Title"));
    }

    #[tokio::test]
    async fn test_second_mark_does_not_rewrite_synced_row() {
        let (store, _tmp) = open_store().await;
        store
            .mark_processed(1, URL, ProviderKind::YouTube, None, Some("First"))
            .await
            .unwrap();
        store
            .mark_processed(1, URL, ProviderKind::YouTube, None, Some("Second"))
            .await
            .unwrap();

        let title: Option<String> =
            sqlx::query_scalar("SELECT title FROM processed_links WHERE url = ?")
                .bind(URL)
                .fetch_one(store.pool())
                .await
                .unwrap();
        assert_eq!(title.as_deref(), Some("First"));
    }

    #[tokio::test]
    async fn test_release_claim_keeps_synced_rows() {
        let (store, _tmp) = open_store().await;
        store.try_claim(1, URL, ProviderKind::YouTube).await.unwrap();
        store.release_claim(1, URL).await.unwrap();
        assert_eq!(row_count(&store).await, 0);
        assert_eq!(
            store.try_claim(1, URL, ProviderKind::YouTube).await.unwrap(),
            Claim::Claimed
        );

        store
            .mark_processed(1, URL, ProviderKind::YouTube, None, None)
            .await
            .unwrap();
        store.release_claim(1, URL).await.unwrap();
        assert!(store.is_processed(1, URL).await.unwrap());
    }

    #[tokio::test]
    async fn test_retention_sweep_removes_only_old_synced_rows() {
        let (store, _tmp) = open_store().await;
        let fresh = "https://soundcloud.com/artist/fresh";
        let pending = "https://soundcloud.com/artist/pending";
        store
            .mark_processed(1, URL, ProviderKind::YouTube, None, None)
            .await
            .unwrap();
        store
            .mark_processed(1, fresh, ProviderKind::SoundCloud, None, None)
            .await
            .unwrap();
        store
            .try_claim(1, pending, ProviderKind::SoundCloud)
            .await
            .unwrap();
        backdate(&store, URL, Duration::days(45)).await;
        backdate(&store, pending, Duration::days(45)).await;

        assert_eq!(store.retention_sweep(30).await.unwrap(), 1);
        assert!(!store.is_processed(1, URL).await.unwrap());
        assert!(store.is_processed(1, fresh).await.unwrap());
        assert_eq!(row_count(&store).await, 2);
    }

    #[tokio::test]
    async fn test_release_stale_claims_spares_recent_and_synced() {
        let (store, _tmp) = open_store().await;
        let stale = "https://soundcloud.com/artist/stale";
        let recent = "https://soundcloud.com/artist/recent";
        store.try_claim(1, stale, ProviderKind::SoundCloud).await.unwrap();
        store.try_claim(1, recent, ProviderKind::SoundCloud).await.unwrap();
        store
            .mark_processed(1, URL, ProviderKind::YouTube, None, None)
            .await
            .unwrap();
        backdate(&store, stale, Duration::hours(1)).await;
        backdate(&store, URL, Duration::hours(1)).await;

        assert_eq!(
            store
                .release_stale_claims(Duration::minutes(15))
                .await
                .unwrap(),
            1
        );
        assert_eq!(
            store.try_claim(1, stale, ProviderKind::SoundCloud).await.unwrap(),
            Claim::Claimed
        );
        assert_eq!(
            store.try_claim(1, recent, ProviderKind::SoundCloud).await.unwrap(),
            Claim::AlreadyRecorded
        );
        assert!(store.is_processed(1, URL).await.unwrap());
    }

    #[tokio::test]
    async fn test_stats_count_synced_rows_only() {
        let (store, _tmp) = open_store().await;
        store
            .mark_processed(1, URL, ProviderKind::YouTube, None, None)
            .await
            .unwrap();
        store
            .mark_processed(2, URL, ProviderKind::YouTube, None, None)
            .await
            .unwrap();
        store
            .try_claim(1, "https://soundcloud.com/a/b", ProviderKind::SoundCloud)
            .await
            .unwrap();

        let stats = store.stats().await.unwrap();
        assert_eq!(stats.len(), 2);
        assert_eq!(stats[0].community_id, 1);
        assert_eq!(stats[0].provider, "youtube");
        assert_eq!(stats[0].count, 1);
        assert!(stats[0].last_processed_at.is_some());
        assert_eq!(stats[1].community_id, 2);
    }
}

use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

/// Create the database file and schema. Safe to run repeatedly.
pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    apply_schema(&pool).await?;
    pool.close().await;
    Ok(())
}

pub async fn apply_schema(pool: &SqlitePool) -> Result<()> {
    // Synced links, plus pending claims taken while a provider call is in flight
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS processed_links (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            community_id INTEGER NOT NULL,
            url TEXT NOT NULL,
            provider TEXT NOT NULL,
            external_id TEXT,
            title TEXT,
            status TEXT NOT NULL DEFAULT 'synced',
            processed_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_processed_links_community_url \
         ON processed_links(community_id, url)",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_processed_links_processed_at \
         ON processed_links(processed_at)",
    )
    .execute(pool)
    .await?;

    Ok(())
}

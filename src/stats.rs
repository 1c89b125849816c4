//! Dedup store statistics.
//!
//! Summarises what has been synced: totals, claims still in flight, and a
//! per-community, per-provider breakdown. Used by `relay stats`.

use anyhow::Result;

use crate::config::Config;
use crate::db;
use crate::store::{DedupStore, SqliteDedupStore};

/// Run the stats command: query the database and print a summary.
pub async fn run_stats(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;

    let total_synced: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM processed_links WHERE status = 'synced'")
            .fetch_one(&pool)
            .await?;

    let total_pending: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM processed_links WHERE status = 'pending'")
            .fetch_one(&pool)
            .await?;

    let db_size = std::fs::metadata(&config.db.path)
        .map(|m| m.len())
        .unwrap_or(0);

    println!("Playlist Relay — Dedup Store Stats");
    println!("==================================");
    println!();
    println!("  Database:    {}", config.db.path.display());
    println!("  Size:        {}", format_bytes(db_size));
    println!();
    println!("  Synced:      {}", total_synced);
    println!("  In flight:   {}", total_pending);
    println!("  Retention:   {} days", config.retention.max_age_days);

    let store = SqliteDedupStore::new(pool.clone());
    let counts = store.stats().await?;

    if !counts.is_empty() {
        println!();
        println!("  By community:");
        println!(
            "  {:<22} {:<12} {:>8}   {}",
            "COMMUNITY", "PROVIDER", "LINKS", "LAST SYNC"
        );
        println!("  {}", "-".repeat(62));

        for c in &counts {
            let last = match c.last_processed_at {
                Some(ts) => format_ts_relative(ts),
                None => "never".to_string(),
            };
            println!(
                "  {:<22} {:<12} {:>8}   {}",
                c.community_id, c.provider, c.count, last
            );
        }
    }

    println!();

    pool.close().await;
    Ok(())
}

/// Format a byte count as a human-readable string.
fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    }
}

/// Format a Unix timestamp as a relative time string (e.g. "3 hours ago").
fn format_ts_relative(ts: i64) -> String {
    let delta = chrono::Utc::now().timestamp() - ts;
    if delta < 0 {
        return format_ts_iso(ts);
    }

    let (n, unit) = match delta {
        d if d < 60 => return "just now".to_string(),
        d if d < 3600 => (d / 60, "min"),
        d if d < 86400 => (d / 3600, "hour"),
        d if d < 86400 * 30 => (d / 86400, "day"),
        _ => return format_ts_iso(ts),
    };
    format!("{} {}{} ago", n, unit, if n == 1 { "" } else { "s" })
}

fn format_ts_iso(ts: i64) -> String {
    chrono::DateTime::from_timestamp(ts, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| ts.to_string())
}

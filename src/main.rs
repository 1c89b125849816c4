//! # Playlist Relay CLI (`relay`)
//!
//! The `relay` binary drives the sync core from the command line: database
//! setup, provider authorization, one-off ingestion, backlog replay over an
//! exported channel history, and store maintenance.
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `relay init` | Create the SQLite database and run schema migrations |
//! | `relay status` | Show which providers are configured and have a stored token |
//! | `relay auth <provider>` | Authorize a provider and store its token |
//! | `relay extract "<text>"` | Classify the music links in a piece of text |
//! | `relay ingest --community <id> "<text>"` | Ingest one message |
//! | `relay backlog --community <id> --history <file>` | Replay recent channel history |
//! | `relay sweep` | Delete records past the retention window |
//! | `relay stats` | Per-community, per-provider record counts |
//!
//! ## Examples
//!
//! ```bash
//! relay init --config ./config/relay.toml
//! relay auth soundcloud
//! relay ingest --community 42 "new track https://youtu.be/dQw4w9WgXcQ"
//! relay backlog --community 42 --history ./export.jsonl --count 50
//! ```

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use playlist_relay::classify;
use playlist_relay::config::{self, Config};
use playlist_relay::db;
use playlist_relay::history::JsonlHistory;
use playlist_relay::ingest::{LinkOutcome, LinkReport, MAX_BACKLOG};
use playlist_relay::migrate;
use playlist_relay::models::ProviderKind;
use playlist_relay::oauth::SystemBrowser;
use playlist_relay::providers;
use playlist_relay::service::RelayService;
use playlist_relay::stats;
use playlist_relay::status;
use playlist_relay::store::{DedupStore, SqliteDedupStore};

/// Playlist Relay CLI: collect music links from chat and keep shared
/// YouTube and SoundCloud playlists in sync.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/relay.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "relay",
    about = "Playlist Relay — sync music links from chat into YouTube and SoundCloud playlists",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/relay.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema.
    ///
    /// Idempotent; running it multiple times is safe.
    Init,

    /// Show provider configuration and token status.
    Status,

    /// Authorize a provider in the browser and store the token.
    ///
    /// Reuses a stored token when it is still valid unless `--force` is given.
    Auth {
        /// `youtube` or `soundcloud`.
        provider: ProviderKind,

        /// Discard any stored token and run the consent flow again.
        #[arg(long)]
        force: bool,
    },

    /// Print the music links found in a piece of text. Performs no I/O.
    Extract {
        text: String,
    },

    /// Ingest one message: sync every new link it contains.
    Ingest {
        /// Community (server/guild) the message belongs to.
        #[arg(long)]
        community: i64,

        /// The message text.
        text: String,

        /// Print per-link outcomes as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Replay the most recent messages of a channel export, oldest first.
    Backlog {
        #[arg(long)]
        community: i64,

        /// JSON-lines channel export.
        #[arg(long)]
        history: PathBuf,

        /// Number of recent messages to replay (1-100).
        #[arg(long, default_value_t = MAX_BACKLOG)]
        count: usize,
    },

    /// Delete dedup records older than the retention window.
    Sweep {
        /// Override `retention.max_age_days`.
        #[arg(long)]
        days: Option<u32>,
    },

    /// Show dedup store statistics.
    Stats,
}

fn init_logging(default_level: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Extraction is pure and needs no config.
    if let Commands::Extract { text } = &cli.command {
        init_logging("warn");
        print_extracted(text);
        return Ok(());
    }

    let cfg = config::load_config(&cli.config)?;
    init_logging(&cfg.log.level);

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized at {}", cfg.db.path.display());
        }
        Commands::Status => {
            status::print_status(&cfg)?;
        }
        Commands::Auth { provider, force } => {
            run_auth(&cfg, provider, force).await?;
        }
        Commands::Extract { .. } => unreachable!("handled before config load"),
        Commands::Ingest {
            community,
            text,
            json,
        } => {
            let service = RelayService::open(cfg).await?;
            service.cancel_on_ctrl_c();
            let reports = service.pipeline().ingest(community, &text).await;
            if json {
                println!("{}", serde_json::to_string_pretty(&reports)?);
            } else {
                print_reports(&reports);
            }
            service.shutdown().await;
        }
        Commands::Backlog {
            community,
            history,
            count,
        } => {
            let service = RelayService::open(cfg).await?;
            service.cancel_on_ctrl_c();
            let source = JsonlHistory::new(history);
            let result = service
                .pipeline()
                .replay_backlog(community, &source, count)
                .await;
            service.shutdown().await;
            let summary = result?;
            println!("backlog community {}", community);
            println!("{}", summary);
        }
        Commands::Sweep { days } => {
            let days = days.unwrap_or(cfg.retention.max_age_days);
            if days == 0 {
                bail!("--days must be >= 1");
            }
            run_sweep(&cfg, &cfg.db.path, days).await?;
        }
        Commands::Stats => {
            stats::run_stats(&cfg).await?;
        }
    }

    Ok(())
}

fn print_extracted(text: &str) {
    let links = classify::extract_links(text);
    if links.is_empty() {
        println!("No music links found.");
        return;
    }
    for link in links {
        let canonical = classify::normalize(&link.raw_url).unwrap_or_default();
        println!(
            "{:<10} {:<24} {}",
            link.provider, link.external_id, canonical
        );
    }
}

fn print_reports(reports: &[LinkReport]) {
    if reports.is_empty() {
        println!("No music links found.");
        return;
    }
    for r in reports {
        let outcome = match &r.outcome {
            LinkOutcome::Synced { newly_added: true } => "synced".to_string(),
            LinkOutcome::Synced { newly_added: false } => "synced (already in playlist)".to_string(),
            LinkOutcome::Duplicate => "duplicate".to_string(),
            LinkOutcome::UnconfiguredProvider => "skipped (provider not configured)".to_string(),
            LinkOutcome::Failed { error } => format!("failed: {}", error),
        };
        println!("{:<10} {}  {}", r.provider, r.url, outcome);
    }
}

async fn run_auth(cfg: &Config, provider: ProviderKind, force: bool) -> Result<()> {
    let shutdown = CancellationToken::new();
    let http = providers::http_client(cfg)?;
    let Some(tokens) =
        providers::token_manager(cfg, provider, &http, Arc::new(SystemBrowser), &shutdown)
    else {
        let missing = cfg
            .providers
            .get(provider)
            .map(|p| p.missing_fields())
            .unwrap_or_else(|| vec!["client_id", "client_secret", "playlist_id"]);
        bail!(
            "{} is not configured (missing {})",
            provider.display_name(),
            missing.join(", ")
        );
    };

    let cancel = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            cancel.cancel();
        }
    });

    let result = if force {
        tokens.reauthorize().await
    } else {
        tokens.access_token().await
    };
    result?;

    println!(
        "{} authorized; token stored at {}",
        provider.display_name(),
        cfg.token_path(provider).display()
    );
    Ok(())
}

async fn run_sweep(cfg: &Config, db_path: &Path, days: u32) -> Result<()> {
    let pool = db::connect(cfg).await?;
    migrate::apply_schema(&pool).await?;
    let store = SqliteDedupStore::new(pool.clone());
    let removed = store.retention_sweep(days).await?;
    pool.close().await;

    println!("sweep {}", db_path.display());
    println!("  removed: {} records older than {} days", removed, days);
    Ok(())
}

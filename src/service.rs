//! Long-lived relay service.
//!
//! Everything that should exist once per process is built here in
//! [`RelayService::open`]: the database pool, the dedup store, one token
//! manager and client per configured provider, and the shutdown token they
//! all share. Chat adapters and the CLI hold the service and call through
//! [`RelayService::pipeline`].

use anyhow::Result;
use sqlx::SqlitePool;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::db;
use crate::ingest::Pipeline;
use crate::migrate;
use crate::oauth::{BrowserLauncher, SystemBrowser};
use crate::providers::{self, Providers};
use crate::store::{DedupStore, SqliteDedupStore};

pub struct RelayService {
    config: Config,
    pool: SqlitePool,
    store: Arc<SqliteDedupStore>,
    pipeline: Pipeline,
    shutdown: CancellationToken,
}

impl RelayService {
    /// Open with the system browser for consent prompts.
    pub async fn open(config: Config) -> Result<Self> {
        Self::open_with(config, Arc::new(SystemBrowser)).await
    }

    pub async fn open_with(config: Config, browser: Arc<dyn BrowserLauncher>) -> Result<Self> {
        let pool = db::connect(&config).await?;
        migrate::apply_schema(&pool).await?;

        let store = Arc::new(SqliteDedupStore::new(pool.clone()));
        let stale_after = chrono::Duration::minutes(config.retention.stale_claim_minutes);
        let released = store.release_stale_claims(stale_after).await?;
        if released > 0 {
            tracing::warn!("Released {} abandoned sync claims from a previous run", released);
        }

        let shutdown = CancellationToken::new();
        let http = providers::http_client(&config)?;
        let providers = Providers::from_config(&config, &http, browser, &shutdown);
        if providers.configured().is_empty() {
            tracing::warn!("No playlist provider is fully configured; links will be skipped");
        }

        let pipeline = Pipeline::new(store.clone(), providers, shutdown.clone());

        Ok(Self {
            config,
            pool,
            store,
            pipeline,
            shutdown,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    pub fn store(&self) -> Arc<dyn DedupStore> {
        self.store.clone()
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Cancel in-flight work when the process receives Ctrl-C.
    pub fn cancel_on_ctrl_c(&self) {
        let token = self.shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("Interrupt received; shutting down");
                token.cancel();
            }
        });
    }

    /// Cancel outstanding waits and close the database.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        self.pool.close().await;
    }
}

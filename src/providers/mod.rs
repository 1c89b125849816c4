//! Playlist providers.
//!
//! A [`PlaylistProvider`] knows how to check membership of one configured
//! playlist and append a track to it. The pipeline only sees the trait;
//! concrete clients live in [`youtube`] and [`soundcloud`].
//!
//! # Error classes
//!
//! | Class | Examples | Pipeline treatment |
//! |-------|----------|--------------------|
//! | [`ProviderError::Transient`] | timeout, connection reset, 429, 5xx | `failed`, warn, retry later |
//! | [`ProviderError::Definitive`] | unknown video, missing playlist, 403 | `failed`, error |
//! | [`ProviderError::Auth`] | consent timed out, token endpoint said no | `failed`, error |
//!
//! In every case the dedup store is left unmarked.

pub mod soundcloud;
pub mod youtube;

use anyhow::Result;
use async_trait::async_trait;
use reqwest::StatusCode;
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::models::ProviderKind;
use crate::oauth::{AuthError, BrowserLauncher, OAuthClientConfig, TokenManager};

pub use soundcloud::SoundCloudClient;
pub use youtube::YouTubeClient;

/// Page size for membership scans.
pub const PAGE_SIZE: u32 = 50;

/// Result of a successful [`PlaylistProvider::add_track`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddOutcome {
    /// The track was appended by this call.
    Added,
    /// The track was already in the playlist; nothing was changed.
    AlreadyPresent,
}

impl AddOutcome {
    pub fn newly_added(&self) -> bool {
        matches!(self, AddOutcome::Added)
    }
}

/// Failures that will not go away by retrying the same call.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DefinitiveError {
    #[error("track not found: {0}")]
    TrackNotFound(String),
    #[error("playlist not found: {0}")]
    PlaylistNotFound(String),
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("access token rejected by the provider")]
    Unauthorized,
    #[error("malformed request or response: {0}")]
    Malformed(String),
}

#[derive(Debug, Clone, Error)]
pub enum ProviderError {
    #[error("transient provider error: {0}")]
    Transient(String),
    #[error(transparent)]
    Definitive(#[from] DefinitiveError),
    #[error("authorization failed: {0}")]
    Auth(#[from] AuthError),
}

impl ProviderError {
    /// Worth retrying later: timeouts, throttling, 5xx, an unreachable
    /// token endpoint, cancellation.
    pub fn is_transient(&self) -> bool {
        match self {
            ProviderError::Transient(_) => true,
            ProviderError::Auth(e) => e.is_transient(),
            ProviderError::Definitive(_) => false,
        }
    }

    pub fn cancelled() -> Self {
        ProviderError::Transient("cancelled by shutdown".to_string())
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            DefinitiveError::Malformed(e.to_string()).into()
        } else {
            ProviderError::Transient(e.to_string())
        }
    }
}

/// Map an HTTP status the provider did not explain more precisely.
///
/// `not_found` decides what a 404 means for the resource being addressed.
pub(crate) fn status_error(
    status: StatusCode,
    detail: &str,
    not_found: impl FnOnce(String) -> DefinitiveError,
) -> ProviderError {
    let detail = if detail.trim().is_empty() {
        status.to_string()
    } else {
        format!("{}: {}", status, detail.trim())
    };
    match status {
        StatusCode::REQUEST_TIMEOUT | StatusCode::TOO_MANY_REQUESTS => {
            ProviderError::Transient(detail)
        }
        s if s.is_server_error() => ProviderError::Transient(detail),
        StatusCode::UNAUTHORIZED => DefinitiveError::Unauthorized.into(),
        StatusCode::FORBIDDEN => DefinitiveError::PermissionDenied(detail).into(),
        StatusCode::NOT_FOUND => not_found(detail).into(),
        _ => DefinitiveError::Malformed(detail).into(),
    }
}

/// A playlist on one provider.
#[async_trait]
pub trait PlaylistProvider: Send + Sync {
    fn kind(&self) -> ProviderKind;

    /// Scan the playlist, page by page, for `external_id`.
    async fn is_track_present(&self, external_id: &str) -> Result<bool, ProviderError>;

    /// Append `external_id` without checking membership first.
    async fn insert_track(&self, external_id: &str) -> Result<(), ProviderError>;

    /// Append `external_id` unless it is already in the playlist.
    async fn add_track(&self, external_id: &str) -> Result<AddOutcome, ProviderError> {
        if self.is_track_present(external_id).await? {
            return Ok(AddOutcome::AlreadyPresent);
        }
        self.insert_track(external_id).await?;
        Ok(AddOutcome::Added)
    }

    /// Human-readable title, if the provider will say.
    async fn resolve_title(&self, external_id: &str) -> Option<String>;
}

/// Authenticated HTTP access shared by the provider clients.
///
/// Attaches the current access token and, on a 401, invalidates it and
/// retries once with whatever the token manager produces next.
#[derive(Clone)]
pub struct ApiClient {
    http: reqwest::Client,
    tokens: Arc<TokenManager>,
}

impl ApiClient {
    pub fn new(http: reqwest::Client, tokens: Arc<TokenManager>) -> Self {
        Self { http, tokens }
    }

    pub fn http(&self) -> &reqwest::Client {
        &self.http
    }

    pub async fn send<F>(&self, build: F) -> Result<reqwest::Response, ProviderError>
    where
        F: Fn(&reqwest::Client) -> reqwest::RequestBuilder + Send + Sync,
    {
        let mut retried = false;
        loop {
            let token = self.tokens.access_token().await?;
            let resp = build(&self.http)
                .header(
                    reqwest::header::AUTHORIZATION,
                    self.tokens.auth_scheme().header_value(&token),
                )
                .send()
                .await?;

            if resp.status() != StatusCode::UNAUTHORIZED {
                return Ok(resp);
            }
            if retried {
                return Err(DefinitiveError::Unauthorized.into());
            }
            self.tokens.invalidate(&token).await;
            retried = true;
        }
    }
}

/// The provider clients that are configured, one slot per kind.
#[derive(Clone, Default)]
pub struct Providers {
    youtube: Option<Arc<dyn PlaylistProvider>>,
    soundcloud: Option<Arc<dyn PlaylistProvider>>,
}

impl Providers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install `provider` in the slot for its kind.
    pub fn with(mut self, provider: Arc<dyn PlaylistProvider>) -> Self {
        match provider.kind() {
            ProviderKind::YouTube => self.youtube = Some(provider),
            ProviderKind::SoundCloud => self.soundcloud = Some(provider),
            ProviderKind::Unknown => {
                tracing::warn!("Ignoring provider registered for an unknown kind");
            }
        }
        self
    }

    pub fn get(&self, kind: ProviderKind) -> Option<&Arc<dyn PlaylistProvider>> {
        match kind {
            ProviderKind::YouTube => self.youtube.as_ref(),
            ProviderKind::SoundCloud => self.soundcloud.as_ref(),
            ProviderKind::Unknown => None,
        }
    }

    pub fn configured(&self) -> Vec<ProviderKind> {
        ProviderKind::ALL
            .into_iter()
            .filter(|k| self.get(*k).is_some())
            .collect()
    }

    /// Build a client for every fully configured provider.
    pub fn from_config(
        config: &Config,
        http: &reqwest::Client,
        browser: Arc<dyn BrowserLauncher>,
        shutdown: &CancellationToken,
    ) -> Self {
        let mut providers = Self::new();
        for kind in ProviderKind::ALL {
            let Some(tokens) = token_manager(config, kind, http, browser.clone(), shutdown) else {
                continue;
            };
            let Some(settings) = config.providers.get(kind) else {
                continue;
            };
            let api = ApiClient::new(http.clone(), tokens);
            let playlist_id = settings.playlist_id.clone().unwrap_or_default();
            let client: Arc<dyn PlaylistProvider> = match kind {
                ProviderKind::YouTube => Arc::new(YouTubeClient::new(
                    api,
                    settings.api_base.clone(),
                    playlist_id,
                    settings.api_key.clone(),
                )),
                ProviderKind::SoundCloud => Arc::new(SoundCloudClient::new(
                    api,
                    settings.api_base.clone(),
                    playlist_id,
                )),
                ProviderKind::Unknown => continue,
            };
            tracing::info!("{} playlist sync enabled", kind.display_name());
            providers = providers.with(client);
        }
        providers
    }
}

/// Token manager for `kind`, or `None` when the provider is not fully configured.
pub fn token_manager(
    config: &Config,
    kind: ProviderKind,
    http: &reqwest::Client,
    browser: Arc<dyn BrowserLauncher>,
    shutdown: &CancellationToken,
) -> Option<Arc<TokenManager>> {
    let settings = config.providers.get(kind)?;
    if !settings.is_complete() {
        tracing::debug!(
            "{} not configured (missing {})",
            kind.display_name(),
            settings.missing_fields().join(", ")
        );
        return None;
    }

    let defaults = match kind {
        ProviderKind::YouTube => youtube::oauth_defaults(),
        ProviderKind::SoundCloud => soundcloud::oauth_defaults(),
        ProviderKind::Unknown => return None,
    };
    let api_base = settings
        .api_base
        .clone()
        .unwrap_or_else(|| defaults.api_base.to_string());

    let client = OAuthClientConfig {
        provider: kind,
        client_id: settings.client_id.clone().unwrap_or_default(),
        client_secret: settings.client_secret.clone().unwrap_or_default(),
        auth_url: settings
            .auth_url
            .clone()
            .unwrap_or_else(|| defaults.auth_url.to_string()),
        token_url: settings
            .token_url
            .clone()
            .unwrap_or_else(|| defaults.token_url.to_string()),
        redirect_uri: config.oauth.redirect_uri(),
        callback_port: config.oauth.callback_port,
        scopes: settings
            .scopes
            .clone()
            .unwrap_or_else(|| defaults.scopes.iter().map(|s| s.to_string()).collect()),
        extra_auth_params: defaults
            .extra_auth_params
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect(),
        token_path: config.token_path(kind),
        callback_timeout: std::time::Duration::from_secs(config.oauth.callback_timeout_secs),
        refresh_skew: chrono::Duration::seconds(config.oauth.refresh_skew_secs),
        probe_url: Some(format!("{}{}", api_base.trim_end_matches('/'), defaults.probe_path)),
        auth_scheme: defaults.auth_scheme,
    };

    Some(Arc::new(TokenManager::new(
        client,
        http.clone(),
        browser,
        shutdown.clone(),
    )))
}

/// Public endpoints and OAuth parameters for one provider.
pub(crate) struct OAuthDefaults {
    pub auth_url: &'static str,
    pub token_url: &'static str,
    pub api_base: &'static str,
    pub probe_path: &'static str,
    pub scopes: &'static [&'static str],
    pub extra_auth_params: &'static [(&'static str, &'static str)],
    pub auth_scheme: crate::oauth::AuthScheme,
}

/// Shared HTTP client for providers and token endpoints.
pub fn http_client(config: &Config) -> Result<reqwest::Client> {
    let client = reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(config.oauth.http_timeout_secs))
        .user_agent(concat!("playlist-relay/", env!("CARGO_PKG_VERSION")))
        .build()?;
    Ok(client)
}

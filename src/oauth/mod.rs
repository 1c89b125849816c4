//! OAuth 2.0 authorization-code + PKCE token lifecycle.
//!
//! A [`TokenManager`] owns one provider's credential. Callers ask it for an
//! access token; it hands back the cached one, refreshes it, or runs the
//! interactive consent flow, whichever the current state requires.
//!
//! # States
//!
//! ```text
//! NoCredential ──load ok──▶ Valid ◀──────────── Refreshing
//!      │                     │ expired             │ refresh failed
//!      │ no file / probe 401 ▼                     ▼
//!      └──────────────▶ AwaitingAuthorization ◀── timeout / denial
//!                            │ code received
//!                            ▼
//!                      ExchangingCode ──ok──▶ Valid
//!                            │ token endpoint error
//!                            ▼
//!                      Unauthenticated ──next use──▶ AwaitingAuthorization
//! ```
//!
//! # Serialization
//!
//! Every transition happens under one async mutex, so at most one refresh
//! or consent flow is in flight per provider. Callers that queued behind a
//! failed attempt take that attempt's error instead of opening a second
//! consent screen; the next call after that starts a fresh attempt.
//!
//! A transient refresh failure keeps the stored credential and leaves the
//! manager in `Refreshing` until the next call retries.

pub mod browser;
pub mod callback;
pub mod credential;
pub mod pkce;

use chrono::Utc;
use reqwest::StatusCode;
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{watch, Mutex};
use tokio_util::sync::CancellationToken;

pub use browser::{BrowserLauncher, SystemBrowser};
pub use callback::CallbackListener;
pub use credential::{OAuthCredential, TokenResponse};
pub use pkce::PkceChallenge;

use crate::models::ProviderKind;

/// Where a [`TokenManager`] is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthState {
    NoCredential,
    Valid,
    Refreshing,
    AwaitingAuthorization,
    ExchangingCode,
    Unauthenticated,
}

impl fmt::Display for AuthState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AuthState::NoCredential => "no-credential",
            AuthState::Valid => "valid",
            AuthState::Refreshing => "refreshing",
            AuthState::AwaitingAuthorization => "awaiting-authorization",
            AuthState::ExchangingCode => "exchanging-code",
            AuthState::Unauthenticated => "unauthenticated",
        };
        f.write_str(name)
    }
}

/// Why an access token could not be produced.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("authorization timed out after {0:?}")]
    Timeout(Duration),
    #[error("authorization denied: {0}")]
    Denied(String),
    #[error("authorization cancelled by shutdown")]
    Cancelled,
    #[error("cannot listen for the OAuth callback on port {port}: {reason}")]
    Listener { port: u16, reason: String },
    #[error("cannot build authorization URL: {0}")]
    InvalidAuthUrl(String),
    #[error("token endpoint rejected the request: {0}")]
    TokenEndpoint(String),
    #[error("token endpoint unreachable: {0}")]
    Transport(String),
}

impl AuthError {
    /// Failures that a later retry could plausibly get past without the
    /// user doing anything.
    pub fn is_transient(&self) -> bool {
        matches!(self, AuthError::Transport(_) | AuthError::Cancelled)
    }

    /// State the manager settles in after a failed consent attempt. Any
    /// failure of the code exchange itself leaves it unauthenticated.
    fn settled_state(&self) -> AuthState {
        match self {
            AuthError::TokenEndpoint(_) | AuthError::Transport(_) => AuthState::Unauthenticated,
            _ => AuthState::AwaitingAuthorization,
        }
    }
}

/// How the access token is presented to the provider's API.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthScheme {
    /// `Authorization: Bearer <token>`
    Bearer,
    /// `Authorization: OAuth <token>`
    OAuth,
}

impl AuthScheme {
    pub fn header_value(&self, token: &str) -> String {
        match self {
            AuthScheme::Bearer => format!("Bearer {}", token),
            AuthScheme::OAuth => format!("OAuth {}", token),
        }
    }
}

/// Everything a [`TokenManager`] needs to talk to one authorization server.
#[derive(Debug, Clone)]
pub struct OAuthClientConfig {
    pub provider: ProviderKind,
    pub client_id: String,
    pub client_secret: String,
    pub auth_url: String,
    pub token_url: String,
    pub redirect_uri: String,
    /// Loopback port the callback listener binds.
    pub callback_port: u16,
    pub scopes: Vec<String>,
    /// Extra query parameters for the consent URL (e.g. `access_type=offline`).
    pub extra_auth_params: Vec<(String, String)>,
    pub token_path: PathBuf,
    pub callback_timeout: Duration,
    pub refresh_skew: chrono::Duration,
    /// Authenticated GET used to check a token loaded from disk.
    pub probe_url: Option<String>,
    pub auth_scheme: AuthScheme,
}

struct Inner {
    loaded: bool,
    credential: Option<OAuthCredential>,
    last_failure: Option<AuthError>,
}

/// Single owner of one provider's credential.
pub struct TokenManager {
    config: OAuthClientConfig,
    http: reqwest::Client,
    browser: Arc<dyn BrowserLauncher>,
    shutdown: CancellationToken,
    inner: Mutex<Inner>,
    attempts: AtomicU64,
    state: watch::Sender<AuthState>,
}

impl TokenManager {
    pub fn new(
        config: OAuthClientConfig,
        http: reqwest::Client,
        browser: Arc<dyn BrowserLauncher>,
        shutdown: CancellationToken,
    ) -> Self {
        let (state, _) = watch::channel(AuthState::NoCredential);
        Self {
            config,
            http,
            browser,
            shutdown,
            inner: Mutex::new(Inner {
                loaded: false,
                credential: None,
                last_failure: None,
            }),
            attempts: AtomicU64::new(0),
            state,
        }
    }

    pub fn provider(&self) -> ProviderKind {
        self.config.provider
    }

    pub fn auth_scheme(&self) -> AuthScheme {
        self.config.auth_scheme
    }

    pub fn state(&self) -> AuthState {
        *self.state.borrow()
    }

    /// Observe state transitions.
    pub fn subscribe(&self) -> watch::Receiver<AuthState> {
        self.state.subscribe()
    }

    fn set_state(&self, next: AuthState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            tracing::debug!(
                provider = %self.config.provider,
                "token state {} -> {}",
                previous,
                next
            );
        }
    }

    /// Return a usable access token, refreshing or authorizing as needed.
    pub async fn access_token(&self) -> Result<String, AuthError> {
        let observed = self.attempts.load(Ordering::Acquire);
        let mut inner = self.inner.lock().await;

        if !inner.loaded {
            self.load_stored(&mut inner).await;
        }

        if let Some(cred) = &inner.credential {
            if !cred.is_expired(Utc::now(), self.config.refresh_skew) {
                self.set_state(AuthState::Valid);
                return Ok(cred.access_token.clone());
            }
        }

        // An attempt finished while this caller was queued.
        if self.attempts.load(Ordering::Acquire) != observed {
            if let Some(err) = &inner.last_failure {
                return Err(err.clone());
            }
        }

        let result = self.acquire(&mut inner).await;
        match &result {
            Ok(_) => inner.last_failure = None,
            Err(e) => inner.last_failure = Some(e.clone()),
        }
        self.attempts.fetch_add(1, Ordering::AcqRel);
        result
    }

    /// Drop any credential and run the consent flow now.
    pub async fn reauthorize(&self) -> Result<String, AuthError> {
        let mut inner = self.inner.lock().await;
        inner.loaded = true;
        inner.credential = None;
        self.set_state(AuthState::AwaitingAuthorization);

        let result = self.authorize_interactive(&mut inner).await;
        match &result {
            Ok(_) => inner.last_failure = None,
            Err(e) => inner.last_failure = Some(e.clone()),
        }
        self.attempts.fetch_add(1, Ordering::AcqRel);
        result
    }

    /// Mark `rejected_token` as expired after the API refused it.
    ///
    /// A no-op if the manager has already moved on to a different token.
    pub async fn invalidate(&self, rejected_token: &str) {
        let mut inner = self.inner.lock().await;
        if let Some(cred) = inner.credential.as_mut() {
            if cred.access_token == rejected_token {
                tracing::info!(
                    provider = %self.config.provider,
                    "Access token rejected by the API; forcing renewal"
                );
                cred.expires_at = Some(Utc::now() - chrono::Duration::seconds(1));
            }
        }
    }

    /// Consent URL for one attempt.
    pub fn authorization_url(&self, pkce: &PkceChallenge) -> Result<String, AuthError> {
        let scope = self.config.scopes.join(" ");
        let mut params: Vec<(&str, &str)> = vec![
            ("client_id", self.config.client_id.as_str()),
            ("redirect_uri", self.config.redirect_uri.as_str()),
            ("response_type", "code"),
            ("code_challenge", pkce.challenge.as_str()),
            ("code_challenge_method", "S256"),
            ("state", pkce.state.as_str()),
        ];
        if !scope.is_empty() {
            params.push(("scope", scope.as_str()));
        }
        for (k, v) in &self.config.extra_auth_params {
            params.push((k.as_str(), v.as_str()));
        }
        url::Url::parse_with_params(&self.config.auth_url, &params)
            .map(String::from)
            .map_err(|e| AuthError::InvalidAuthUrl(e.to_string()))
    }

    async fn load_stored(&self, inner: &mut Inner) {
        inner.loaded = true;
        let path = &self.config.token_path;

        let credential = match credential::load(path).await {
            Ok(Some(cred)) => cred,
            Ok(None) => {
                tracing::info!(provider = %self.config.provider, "No stored token at {}", path.display());
                self.set_state(AuthState::AwaitingAuthorization);
                return;
            }
            Err(e) => {
                tracing::warn!(provider = %self.config.provider, "Ignoring unreadable token file: {:#}", e);
                self.set_state(AuthState::AwaitingAuthorization);
                return;
            }
        };

        if !credential.is_expired(Utc::now(), self.config.refresh_skew)
            && self.probe_rejects(&credential).await
        {
            tracing::warn!(
                provider = %self.config.provider,
                "Stored token was rejected by the provider; authorization required"
            );
            self.set_state(AuthState::AwaitingAuthorization);
            return;
        }

        tracing::debug!(provider = %self.config.provider, "Loaded stored token");
        inner.credential = Some(credential);
    }

    /// Whether the liveness probe returned 401/403. Network trouble is not
    /// taken as a verdict.
    async fn probe_rejects(&self, credential: &OAuthCredential) -> bool {
        let Some(url) = &self.config.probe_url else {
            return false;
        };
        let request = self.http.get(url).header(
            reqwest::header::AUTHORIZATION,
            self.config.auth_scheme.header_value(&credential.access_token),
        );
        match request.send().await {
            Ok(resp) => matches!(resp.status(), StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN),
            Err(e) => {
                tracing::warn!(provider = %self.config.provider, "Token probe failed: {}", e);
                false
            }
        }
    }

    async fn acquire(&self, inner: &mut Inner) -> Result<String, AuthError> {
        if let Some(cred) = inner.credential.clone() {
            if cred.can_refresh() {
                self.set_state(AuthState::Refreshing);
                match self.refresh(&cred).await {
                    Ok(fresh) => return Ok(self.adopt(inner, fresh).await),
                    Err(e) if e.is_transient() => {
                        tracing::warn!(provider = %self.config.provider, "Token refresh failed: {}", e);
                        return Err(e);
                    }
                    Err(e) => {
                        tracing::warn!(
                            provider = %self.config.provider,
                            "Refresh token rejected ({}); authorization required",
                            e
                        );
                    }
                }
            }
            inner.credential = None;
        }

        self.set_state(AuthState::AwaitingAuthorization);
        self.authorize_interactive(inner).await
    }

    async fn authorize_interactive(&self, inner: &mut Inner) -> Result<String, AuthError> {
        match self.run_consent_flow().await {
            Ok(fresh) => Ok(self.adopt(inner, fresh).await),
            Err(e) => {
                tracing::warn!(provider = %self.config.provider, "Authorization failed: {}", e);
                self.set_state(e.settled_state());
                Err(e)
            }
        }
    }

    /// Install a fresh credential in memory and persist it.
    async fn adopt(&self, inner: &mut Inner, fresh: OAuthCredential) -> String {
        if let Err(e) = credential::save(&self.config.token_path, &fresh).await {
            // The in-memory copy stays authoritative; the next save retries.
            tracing::error!(provider = %self.config.provider, "Failed to persist token: {:#}", e);
        }
        let token = fresh.access_token.clone();
        inner.credential = Some(fresh);
        self.set_state(AuthState::Valid);
        token
    }

    async fn run_consent_flow(&self) -> Result<OAuthCredential, AuthError> {
        let pkce = PkceChallenge::generate();
        let url = self.authorization_url(&pkce)?;

        let listener = CallbackListener::bind(self.config.callback_port, pkce.state.clone()).await?;

        tracing::info!(provider = %self.config.provider, "Waiting for authorization in the browser");
        if let Err(e) = self.browser.open(&url) {
            listener.shutdown().await;
            return Err(AuthError::Denied(format!("could not present consent page: {:#}", e)));
        }

        let code = listener
            .wait_for_code(self.config.callback_timeout, &self.shutdown)
            .await?;

        self.set_state(AuthState::ExchangingCode);
        let form = [
            ("grant_type", "authorization_code"),
            ("client_id", self.config.client_id.as_str()),
            ("client_secret", self.config.client_secret.as_str()),
            ("redirect_uri", self.config.redirect_uri.as_str()),
            ("code", code.as_str()),
            ("code_verifier", pkce.verifier.as_str()),
        ];
        let credential = self.token_request(&form, None).await?;
        tracing::info!(provider = %self.config.provider, "Authorization complete");
        Ok(credential)
    }

    async fn refresh(&self, current: &OAuthCredential) -> Result<OAuthCredential, AuthError> {
        let refresh_token = current.refresh_token.clone().unwrap_or_default();
        let form = [
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token.as_str()),
            ("client_id", self.config.client_id.as_str()),
            ("client_secret", self.config.client_secret.as_str()),
        ];
        let fresh = self.token_request(&form, Some(refresh_token.clone())).await?;
        tracing::debug!(provider = %self.config.provider, "Access token refreshed");
        Ok(fresh)
    }

    async fn token_request(
        &self,
        form: &[(&str, &str)],
        previous_refresh: Option<String>,
    ) -> Result<OAuthCredential, AuthError> {
        let send = self.http.post(&self.config.token_url).form(form).send();
        let resp = tokio::select! {
            r = send => r.map_err(|e| AuthError::Transport(e.to_string()))?,
            _ = self.shutdown.cancelled() => return Err(AuthError::Cancelled),
        };

        let status = resp.status();
        if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
            return Err(AuthError::Transport(format!("token endpoint returned {}", status)));
        }
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(AuthError::TokenEndpoint(format!("{}: {}", status, body.trim())));
        }

        let parsed: TokenResponse = resp
            .json()
            .await
            .map_err(|e| AuthError::TokenEndpoint(format!("unreadable token response: {}", e)))?;
        OAuthCredential::from_response(parsed, Utc::now(), previous_refresh)
            .map_err(|e| AuthError::TokenEndpoint(e.to_string()))
    }
}

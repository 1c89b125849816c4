use axum::{extract::State, http::StatusCode, routing::get, routing::post, Form, Json, Router};
use chrono::{Duration as ChronoDuration, Utc};
use serde_json::json;
use std::collections::{BTreeSet, HashMap};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use playlist_relay::models::ProviderKind;
use playlist_relay::oauth::credential;
use playlist_relay::oauth::pkce::challenge_for;
use playlist_relay::oauth::{
    AuthError, AuthScheme, AuthState, BrowserLauncher, OAuthClientConfig, OAuthCredential,
    TokenManager,
};

// ---------------------------------------------------------------------------
// Stand-in authorization server
// ---------------------------------------------------------------------------

struct MockAuth {
    token_requests: Mutex<Vec<HashMap<String, String>>>,
    token_status: Mutex<StatusCode>,
    issue_refresh_token: bool,
    probe_status: StatusCode,
    probe_hits: AtomicUsize,
}

impl MockAuth {
    fn new() -> Self {
        Self {
            token_requests: Mutex::new(Vec::new()),
            token_status: Mutex::new(StatusCode::OK),
            issue_refresh_token: true,
            probe_status: StatusCode::OK,
            probe_hits: AtomicUsize::new(0),
        }
    }

    fn requests(&self) -> Vec<HashMap<String, String>> {
        self.token_requests.lock().unwrap().clone()
    }
}

async fn token_endpoint(
    State(mock): State<Arc<MockAuth>>,
    Form(form): Form<HashMap<String, String>>,
) -> (StatusCode, Json<serde_json::Value>) {
    let n = {
        let mut requests = mock.token_requests.lock().unwrap();
        requests.push(form);
        requests.len()
    };
    let status = *mock.token_status.lock().unwrap();
    if status != StatusCode::OK {
        return (status, Json(json!({"error": "invalid_grant"})));
    }

    let mut body = json!({
        "access_token": format!("acc-{}", n),
        "token_type": "bearer",
        "expires_in": 3600,
        "scope": "non-expiring",
    });
    if mock.issue_refresh_token {
        body["refresh_token"] = json!(format!("ref-{}", n));
    }
    (StatusCode::OK, Json(body))
}

async fn probe_endpoint(State(mock): State<Arc<MockAuth>>) -> StatusCode {
    mock.probe_hits.fetch_add(1, Ordering::SeqCst);
    mock.probe_status
}

async fn spawn_mock(mock: Arc<MockAuth>) -> SocketAddr {
    let app = Router::new()
        .route("/token", post(token_endpoint))
        .route("/me", get(probe_endpoint))
        .with_state(mock);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

// ---------------------------------------------------------------------------
// A browser that plays the user
// ---------------------------------------------------------------------------

#[derive(Clone, Copy)]
enum UserAction {
    Approve,
    Deny,
    ForgeState,
    Ignore,
}

struct FakeBrowser {
    action: UserAction,
    opened: AtomicUsize,
    challenge: Mutex<Option<String>>,
    callback_status: Arc<Mutex<Option<u16>>>,
}

impl FakeBrowser {
    fn new(action: UserAction) -> Arc<Self> {
        Arc::new(Self {
            action,
            opened: AtomicUsize::new(0),
            challenge: Mutex::new(None),
            callback_status: Arc::new(Mutex::new(None)),
        })
    }

    fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    async fn wait_for_callback_status(&self) -> Option<u16> {
        for _ in 0..100 {
            if let Some(s) = *self.callback_status.lock().unwrap() {
                return Some(s);
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        None
    }
}

impl BrowserLauncher for FakeBrowser {
    fn open(&self, url: &str) -> anyhow::Result<()> {
        self.opened.fetch_add(1, Ordering::SeqCst);
        let parsed = url::Url::parse(url)?;
        let params: HashMap<String, String> = parsed.query_pairs().into_owned().collect();
        *self.challenge.lock().unwrap() = params.get("code_challenge").cloned();

        let redirect = params["redirect_uri"].clone();
        let state = params["state"].clone();
        let target = match self.action {
            UserAction::Ignore => return Ok(()),
            UserAction::Approve => format!("{}?code=auth-code-1&state={}", redirect, state),
            UserAction::Deny => format!("{}?error=access_denied&state={}", redirect, state),
            UserAction::ForgeState => format!("{}?code=auth-code-1&state=forged", redirect),
        };

        let slot = self.callback_status.clone();
        tokio::spawn(async move {
            if let Ok(resp) = reqwest::get(&target).await {
                *slot.lock().unwrap() = Some(resp.status().as_u16());
            }
        });
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn free_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

fn client_config(
    auth_server: Option<SocketAddr>,
    token_path: &Path,
    port: u16,
    timeout: Duration,
) -> OAuthClientConfig {
    let base = auth_server
        .map(|a| format!("http://{}", a))
        .unwrap_or_else(|| "http://127.0.0.1:9".to_string());
    OAuthClientConfig {
        provider: ProviderKind::SoundCloud,
        client_id: "client-1".to_string(),
        client_secret: "secret-1".to_string(),
        auth_url: format!("{}/authorize", base),
        token_url: format!("{}/token", base),
        redirect_uri: format!("http://127.0.0.1:{}/callback", port),
        callback_port: port,
        scopes: vec!["non-expiring".to_string()],
        extra_auth_params: Vec::new(),
        token_path: token_path.to_path_buf(),
        callback_timeout: timeout,
        refresh_skew: ChronoDuration::seconds(60),
        probe_url: auth_server.map(|a| format!("http://{}/me", a)),
        auth_scheme: AuthScheme::OAuth,
    }
}

fn manager(config: OAuthClientConfig, browser: Arc<FakeBrowser>) -> TokenManager {
    TokenManager::new(config, reqwest::Client::new(), browser, CancellationToken::new())
}

fn token_path(tmp: &TempDir) -> PathBuf {
    tmp.path().join("soundcloud_oauth_token.json")
}

async fn store_token(path: &Path, access: &str, refresh: Option<&str>, expires_in_secs: i64) {
    let credential = OAuthCredential {
        access_token: access.to_string(),
        refresh_token: refresh.map(str::to_string),
        expires_at: Some(Utc::now() + ChronoDuration::seconds(expires_in_secs)),
        scopes: BTreeSet::new(),
    };
    credential::save(path, &credential).await.unwrap();
}

fn port_is_free(port: u16) -> bool {
    std::net::TcpListener::bind(("127.0.0.1", port)).is_ok()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_consent_flow_exchanges_code_and_persists_token() {
    let tmp = TempDir::new().unwrap();
    let mock = Arc::new(MockAuth::new());
    let addr = spawn_mock(mock.clone()).await;
    let browser = FakeBrowser::new(UserAction::Approve);
    let port = free_port();
    let mgr = manager(
        client_config(Some(addr), &token_path(&tmp), port, Duration::from_secs(10)),
        browser.clone(),
    );
    let states = mgr.subscribe();

    let token = mgr.access_token().await.unwrap();
    assert_eq!(token, "acc-1");
    assert_eq!(mgr.state(), AuthState::Valid);
    assert!(states.has_changed().unwrap());
    assert_eq!(*states.borrow(), AuthState::Valid);
    assert_eq!(browser.opened(), 1);
    assert_eq!(browser.wait_for_callback_status().await, Some(200));

    let requests = mock.requests();
    assert_eq!(requests.len(), 1);
    let form = &requests[0];
    assert_eq!(form["grant_type"], "authorization_code");
    assert_eq!(form["code"], "auth-code-1");
    assert_eq!(form["client_id"], "client-1");
    assert_eq!(form["client_secret"], "secret-1");
    assert_eq!(form["redirect_uri"], format!("http://127.0.0.1:{}/callback", port));
    let challenge = browser.challenge.lock().unwrap().clone().unwrap();
    assert_eq!(challenge_for(&form["code_verifier"]), challenge);

    let stored = credential::load(&token_path(&tmp)).await.unwrap().unwrap();
    assert_eq!(stored.access_token, "acc-1");
    assert_eq!(stored.refresh_token.as_deref(), Some("ref-1"));
    assert!(stored.expires_at.is_some());

    // Cached token: no further network traffic.
    assert_eq!(mgr.access_token().await.unwrap(), "acc-1");
    assert_eq!(mock.requests().len(), 1);
    assert!(port_is_free(port), "callback listener must be closed");
}

#[tokio::test]
async fn test_concurrent_callers_share_one_consent_screen() {
    let tmp = TempDir::new().unwrap();
    let mock = Arc::new(MockAuth::new());
    let addr = spawn_mock(mock.clone()).await;
    let browser = FakeBrowser::new(UserAction::Approve);
    let mgr = manager(
        client_config(Some(addr), &token_path(&tmp), free_port(), Duration::from_secs(10)),
        browser.clone(),
    );

    let (a, b, c) = tokio::join!(mgr.access_token(), mgr.access_token(), mgr.access_token());
    assert_eq!(a.unwrap(), "acc-1");
    assert_eq!(b.unwrap(), "acc-1");
    assert_eq!(c.unwrap(), "acc-1");
    assert_eq!(browser.opened(), 1);
    assert_eq!(mock.requests().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_callback_timeout_returns_to_awaiting_authorization() {
    let tmp = TempDir::new().unwrap();
    let browser = FakeBrowser::new(UserAction::Ignore);
    let port = free_port();
    let path = token_path(&tmp);
    let mgr = manager(
        client_config(None, &path, port, Duration::from_secs(300)),
        browser.clone(),
    );

    let err = mgr.access_token().await.unwrap_err();
    assert_eq!(err, AuthError::Timeout(Duration::from_secs(300)));
    assert_eq!(mgr.state(), AuthState::AwaitingAuthorization);
    assert!(!path.exists(), "no token file may be written");
    assert!(port_is_free(port), "callback listener must be closed");
}

#[tokio::test(start_paused = true)]
async fn test_queued_callers_take_the_failed_attempts_result() {
    let tmp = TempDir::new().unwrap();
    let browser = FakeBrowser::new(UserAction::Ignore);
    let mgr = manager(
        client_config(None, &token_path(&tmp), free_port(), Duration::from_secs(300)),
        browser.clone(),
    );

    let (a, b) = tokio::join!(mgr.access_token(), mgr.access_token());
    assert!(matches!(a, Err(AuthError::Timeout(_))));
    assert!(matches!(b, Err(AuthError::Timeout(_))));
    assert_eq!(browser.opened(), 1);

    // A later call starts a fresh attempt.
    let _ = mgr.access_token().await;
    assert_eq!(browser.opened(), 2);
}

#[tokio::test]
async fn test_state_mismatch_is_rejected() {
    let tmp = TempDir::new().unwrap();
    let mock = Arc::new(MockAuth::new());
    let addr = spawn_mock(mock.clone()).await;
    let browser = FakeBrowser::new(UserAction::ForgeState);
    let port = free_port();
    let path = token_path(&tmp);
    let mgr = manager(
        client_config(Some(addr), &path, port, Duration::from_secs(10)),
        browser.clone(),
    );

    let err = mgr.access_token().await.unwrap_err();
    assert!(matches!(err, AuthError::Denied(ref reason) if reason.contains("state")));
    assert_eq!(mgr.state(), AuthState::AwaitingAuthorization);
    assert_eq!(browser.wait_for_callback_status().await, Some(400));
    assert!(mock.requests().is_empty(), "code must never be exchanged");
    assert!(!path.exists());
    assert!(port_is_free(port));
}

#[tokio::test]
async fn test_user_denial_is_reported() {
    let tmp = TempDir::new().unwrap();
    let browser = FakeBrowser::new(UserAction::Deny);
    let mgr = manager(
        client_config(None, &token_path(&tmp), free_port(), Duration::from_secs(10)),
        browser.clone(),
    );

    let err = mgr.access_token().await.unwrap_err();
    assert_eq!(err, AuthError::Denied("access_denied".to_string()));
    assert_eq!(mgr.state(), AuthState::AwaitingAuthorization);
}

#[tokio::test]
async fn test_token_endpoint_error_settles_unauthenticated() {
    let tmp = TempDir::new().unwrap();
    let mock = Arc::new(MockAuth::new());
    *mock.token_status.lock().unwrap() = StatusCode::BAD_REQUEST;
    let addr = spawn_mock(mock.clone()).await;
    let browser = FakeBrowser::new(UserAction::Approve);
    let path = token_path(&tmp);
    let mgr = manager(
        client_config(Some(addr), &path, free_port(), Duration::from_secs(10)),
        browser.clone(),
    );

    let err = mgr.access_token().await.unwrap_err();
    assert!(matches!(err, AuthError::TokenEndpoint(_)));
    assert_eq!(mgr.state(), AuthState::Unauthenticated);
    assert!(!path.exists());

    // Next use starts over from the consent screen.
    *mock.token_status.lock().unwrap() = StatusCode::OK;
    assert_eq!(mgr.access_token().await.unwrap(), "acc-2");
    assert_eq!(browser.opened(), 2);
}

#[tokio::test]
async fn test_expired_token_is_refreshed_without_prompt() {
    let tmp = TempDir::new().unwrap();
    let path = token_path(&tmp);
    store_token(&path, "stale", Some("ref-stored"), -600).await;

    let mock = Arc::new(MockAuth {
        issue_refresh_token: false,
        ..MockAuth::new()
    });
    let addr = spawn_mock(mock.clone()).await;
    let browser = FakeBrowser::new(UserAction::Ignore);
    let mgr = manager(
        client_config(Some(addr), &path, free_port(), Duration::from_secs(10)),
        browser.clone(),
    );

    assert_eq!(mgr.access_token().await.unwrap(), "acc-1");
    assert_eq!(browser.opened(), 0);
    assert_eq!(mock.probe_hits.load(Ordering::SeqCst), 0);

    let requests = mock.requests();
    assert_eq!(requests[0]["grant_type"], "refresh_token");
    assert_eq!(requests[0]["refresh_token"], "ref-stored");

    // The refresh response had no refresh token; the old one is kept.
    let stored = credential::load(&path).await.unwrap().unwrap();
    assert_eq!(stored.access_token, "acc-1");
    assert_eq!(stored.refresh_token.as_deref(), Some("ref-stored"));
}

#[tokio::test]
async fn test_stored_token_passing_probe_is_used() {
    let tmp = TempDir::new().unwrap();
    let path = token_path(&tmp);
    store_token(&path, "still-good", None, 3600).await;

    let mock = Arc::new(MockAuth::new());
    let addr = spawn_mock(mock.clone()).await;
    let browser = FakeBrowser::new(UserAction::Ignore);
    let mgr = manager(
        client_config(Some(addr), &path, free_port(), Duration::from_secs(10)),
        browser.clone(),
    );

    assert_eq!(mgr.state(), AuthState::NoCredential);
    assert_eq!(mgr.access_token().await.unwrap(), "still-good");
    assert_eq!(mgr.state(), AuthState::Valid);
    assert_eq!(mock.probe_hits.load(Ordering::SeqCst), 1);
    assert_eq!(browser.opened(), 0);
}

#[tokio::test]
async fn test_revoked_stored_token_triggers_authorization() {
    let tmp = TempDir::new().unwrap();
    let path = token_path(&tmp);
    store_token(&path, "revoked", None, 3600).await;

    let mock = Arc::new(MockAuth {
        probe_status: StatusCode::UNAUTHORIZED,
        ..MockAuth::new()
    });
    let addr = spawn_mock(mock.clone()).await;
    let browser = FakeBrowser::new(UserAction::Approve);
    let mgr = manager(
        client_config(Some(addr), &path, free_port(), Duration::from_secs(10)),
        browser.clone(),
    );

    assert_eq!(mgr.access_token().await.unwrap(), "acc-1");
    assert_eq!(browser.opened(), 1);
    let stored = credential::load(&path).await.unwrap().unwrap();
    assert_eq!(stored.access_token, "acc-1");
}

#[tokio::test]
async fn test_invalidate_forces_refresh_of_the_rejected_token_only() {
    let tmp = TempDir::new().unwrap();
    let mock = Arc::new(MockAuth::new());
    let addr = spawn_mock(mock.clone()).await;
    let browser = FakeBrowser::new(UserAction::Approve);
    let mgr = manager(
        client_config(Some(addr), &token_path(&tmp), free_port(), Duration::from_secs(10)),
        browser.clone(),
    );

    assert_eq!(mgr.access_token().await.unwrap(), "acc-1");

    mgr.invalidate("some-older-token").await;
    assert_eq!(mgr.access_token().await.unwrap(), "acc-1");

    mgr.invalidate("acc-1").await;
    assert_eq!(mgr.access_token().await.unwrap(), "acc-2");
    let requests = mock.requests();
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[1]["grant_type"], "refresh_token");
    assert_eq!(requests[1]["refresh_token"], "ref-1");
    assert_eq!(browser.opened(), 1);
}

#[tokio::test]
async fn test_shutdown_cancels_pending_authorization() {
    let tmp = TempDir::new().unwrap();
    let browser = FakeBrowser::new(UserAction::Ignore);
    let port = free_port();
    let shutdown = CancellationToken::new();
    let mgr = TokenManager::new(
        client_config(None, &token_path(&tmp), port, Duration::from_secs(300)),
        reqwest::Client::new(),
        browser,
        shutdown.clone(),
    );

    let cancel = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        shutdown.cancel();
    });

    let err = mgr.access_token().await.unwrap_err();
    cancel.await.unwrap();
    assert_eq!(err, AuthError::Cancelled);
    assert!(port_is_free(port));
}

#[tokio::test]
async fn test_port_in_use_fails_the_attempt() {
    let tmp = TempDir::new().unwrap();
    let occupied = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = occupied.local_addr().unwrap().port();
    let browser = FakeBrowser::new(UserAction::Approve);
    let mgr = manager(
        client_config(None, &token_path(&tmp), port, Duration::from_secs(10)),
        browser.clone(),
    );

    let err = mgr.access_token().await.unwrap_err();
    assert!(matches!(err, AuthError::Listener { .. }));
    assert_eq!(browser.opened(), 0, "browser must not open without a listener");
}

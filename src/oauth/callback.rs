//! Transient loopback listener for the OAuth redirect.
//!
//! Bound before the browser is opened, serves exactly one route, and is torn
//! down (task joined, socket closed) whichever way the wait ends.
//!
//! # Endpoint
//!
//! | Method | Path | Result |
//! |--------|------|--------|
//! | `GET` | `/callback?code=..&state=..` | 200 on a matching `state`, 400 otherwise |

use axum::{
    extract::{Query, State},
    http::StatusCode,
    routing::get,
    Router,
};
use serde::Deserialize;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

use super::AuthError;

const SUCCESS_PAGE: &str = "Authorization complete. You can close this window.";
const DENIED_PAGE: &str = "Authorization was not completed. You can close this window.";
const MISSING_CODE_PAGE: &str = "Missing authorization code.";
const ALREADY_DONE_PAGE: &str = "This authorization attempt has already finished.";

/// Upper bound on waiting for in-flight browser connections during teardown.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug)]
enum CallbackResult {
    Code(String),
    Denied(String),
}

#[derive(Debug, Deserialize)]
struct CallbackParams {
    code: Option<String>,
    state: Option<String>,
    error: Option<String>,
    error_description: Option<String>,
}

struct CallbackState {
    expected_state: String,
    sender: Mutex<Option<oneshot::Sender<CallbackResult>>>,
}

impl CallbackState {
    /// Hand the result to the waiting attempt. Returns false if one was
    /// already delivered.
    fn deliver(&self, result: CallbackResult) -> bool {
        let sender = self.sender.lock().unwrap().take();
        match sender {
            Some(tx) => tx.send(result).is_ok(),
            None => false,
        }
    }
}

/// A running callback listener for one authorization attempt.
pub struct CallbackListener {
    addr: SocketAddr,
    receiver: oneshot::Receiver<CallbackResult>,
    stop: CancellationToken,
    task: JoinHandle<()>,
}

impl CallbackListener {
    /// Bind `127.0.0.1:port` and start serving `/callback`.
    ///
    /// Fails with [`AuthError::Listener`] when the port is taken.
    pub async fn bind(port: u16, expected_state: String) -> Result<Self, AuthError> {
        let listener = tokio::net::TcpListener::bind((Ipv4Addr::LOCALHOST, port))
            .await
            .map_err(|e| AuthError::Listener {
                port,
                reason: e.to_string(),
            })?;
        let addr = listener.local_addr().map_err(|e| AuthError::Listener {
            port,
            reason: e.to_string(),
        })?;

        let (tx, rx) = oneshot::channel();
        let state = Arc::new(CallbackState {
            expected_state,
            sender: Mutex::new(Some(tx)),
        });

        let app = Router::new()
            .route("/callback", get(handle_callback))
            .layer(TraceLayer::new_for_http())
            .with_state(state);

        let stop = CancellationToken::new();
        let stop_signal = stop.clone();
        let task = tokio::spawn(async move {
            let served = axum::serve(listener, app)
                .with_graceful_shutdown(async move { stop_signal.cancelled().await })
                .await;
            if let Err(e) = served {
                tracing::warn!("OAuth callback listener stopped with error: {}", e);
            }
        });

        tracing::debug!("OAuth callback listener bound on {}", addr);

        Ok(Self {
            addr,
            receiver: rx,
            stop,
            task,
        })
    }

    /// Wait for the authorization code, bounded by `timeout` and `cancel`.
    ///
    /// Consumes the listener; it is shut down before this returns.
    pub async fn wait_for_code(
        mut self,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<String, AuthError> {
        let outcome = tokio::select! {
            received = &mut self.receiver => match received {
                Ok(CallbackResult::Code(code)) => Ok(code),
                Ok(CallbackResult::Denied(reason)) => Err(AuthError::Denied(reason)),
                Err(_) => Err(AuthError::Denied("callback listener stopped".to_string())),
            },
            _ = tokio::time::sleep(timeout) => Err(AuthError::Timeout(timeout)),
            _ = cancel.cancelled() => Err(AuthError::Cancelled),
        };

        self.shutdown().await;
        outcome
    }

    /// Stop serving and release the port.
    pub async fn shutdown(self) {
        self.stop.cancel();
        let mut task = self.task;
        if tokio::time::timeout(DRAIN_TIMEOUT, &mut task).await.is_err() {
            task.abort();
            let _ = task.await;
        }
        tracing::debug!("OAuth callback listener on {} closed", self.addr);
    }
}

async fn handle_callback(
    State(state): State<Arc<CallbackState>>,
    Query(params): Query<CallbackParams>,
) -> (StatusCode, &'static str) {
    if let Some(error) = params.error {
        let reason = match params.error_description {
            Some(desc) => format!("{}: {}", error, desc),
            None => error,
        };
        tracing::warn!("Authorization callback reported an error: {}", reason);
        state.deliver(CallbackResult::Denied(reason));
        return (StatusCode::BAD_REQUEST, DENIED_PAGE);
    }

    let Some(code) = params.code.filter(|c| !c.is_empty()) else {
        return (StatusCode::BAD_REQUEST, MISSING_CODE_PAGE);
    };

    if params.state.as_deref() != Some(state.expected_state.as_str()) {
        tracing::warn!("Authorization callback rejected: state mismatch");
        state.deliver(CallbackResult::Denied("state mismatch".to_string()));
        return (StatusCode::BAD_REQUEST, DENIED_PAGE);
    }

    if state.deliver(CallbackResult::Code(code)) {
        (StatusCode::OK, SUCCESS_PAGE)
    } else {
        (StatusCode::BAD_REQUEST, ALREADY_DONE_PAGE)
    }
}

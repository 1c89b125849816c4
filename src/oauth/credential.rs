//! OAuth credential model and its on-disk token file.
//!
//! # File format
//!
//! ```json
//! {
//!   "access_token": "...",
//!   "refresh_token": "...",
//!   "expires_at": "2026-01-01T00:00:00Z",
//!   "scope": "non-expiring"
//! }
//! ```
//!
//! `refresh_token`, `expires_at`, and `scope` are optional. Every save is a
//! complete replace: the payload goes to a sibling temp file which is then
//! renamed over the target, so a crash mid-write never leaves a half-written
//! token that would parse as "authenticated".

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::path::{Path, PathBuf};

/// A provider credential. The in-memory copy is authoritative for the
/// lifetime of the process.
#[derive(Clone, PartialEq, Eq)]
pub struct OAuthCredential {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub scopes: BTreeSet<String>,
}

impl fmt::Debug for OAuthCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OAuthCredential")
            .field("access_token", &"<redacted>")
            .field("has_refresh_token", &self.refresh_token.is_some())
            .field("expires_at", &self.expires_at)
            .field("scopes", &self.scopes)
            .finish()
    }
}

impl OAuthCredential {
    /// Whether the access token is expired, or will be within `skew`.
    /// Tokens without an expiry never expire.
    pub fn is_expired(&self, now: DateTime<Utc>, skew: Duration) -> bool {
        match self.expires_at {
            Some(expires_at) => expires_at - skew <= now,
            None => false,
        }
    }

    pub fn can_refresh(&self) -> bool {
        self.refresh_token
            .as_deref()
            .is_some_and(|t| !t.is_empty())
    }

    /// Build a credential from a token endpoint response.
    ///
    /// `previous_refresh` is kept when a refresh response omits a new
    /// refresh token.
    pub fn from_response(
        response: TokenResponse,
        now: DateTime<Utc>,
        previous_refresh: Option<String>,
    ) -> Result<Self> {
        if response.access_token.trim().is_empty() {
            bail!("token response carried an empty access_token");
        }
        let expires_at = match response.expires_in.filter(|secs| *secs > 0) {
            Some(secs) => Some(
                Duration::try_seconds(secs)
                    .and_then(|d| now.checked_add_signed(d))
                    .with_context(|| format!("token response expires_in out of range: {}", secs))?,
            ),
            None => None,
        };
        Ok(Self {
            access_token: response.access_token,
            refresh_token: response.refresh_token.or(previous_refresh),
            expires_at,
            scopes: parse_scopes(response.scope.as_deref()),
        })
    }
}

/// JSON body returned by a token endpoint.
#[derive(Debug, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub expires_in: Option<i64>,
    #[serde(default)]
    pub scope: Option<String>,
}

#[derive(Serialize, Deserialize)]
struct TokenFile {
    access_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    refresh_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    expires_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    scope: Option<String>,
}

fn parse_scopes(scope: Option<&str>) -> BTreeSet<String> {
    scope
        .unwrap_or_default()
        .split([' ', ','])
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Read a token file. A missing file is `Ok(None)`; a malformed one is an error.
pub async fn load(path: &Path) -> Result<Option<OAuthCredential>> {
    let content = match tokio::fs::read_to_string(path).await {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => {
            return Err(e).with_context(|| format!("Failed to read token file: {}", path.display()))
        }
    };

    let file: TokenFile = serde_json::from_str(&content)
        .with_context(|| format!("Malformed token file: {}", path.display()))?;
    if file.access_token.trim().is_empty() {
        bail!("Token file has an empty access_token: {}", path.display());
    }

    Ok(Some(OAuthCredential {
        access_token: file.access_token,
        refresh_token: file.refresh_token,
        expires_at: file.expires_at,
        scopes: parse_scopes(file.scope.as_deref()),
    }))
}

/// Write a token file as a complete replace.
pub async fn save(path: &Path, credential: &OAuthCredential) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent).await?;
        }
    }

    let scope = if credential.scopes.is_empty() {
        None
    } else {
        Some(
            credential
                .scopes
                .iter()
                .cloned()
                .collect::<Vec<_>>()
                .join(" "),
        )
    };
    let file = TokenFile {
        access_token: credential.access_token.clone(),
        refresh_token: credential.refresh_token.clone(),
        expires_at: credential.expires_at,
        scope,
    };
    let body = serde_json::to_vec_pretty(&file)?;

    let tmp = temp_path(path);
    tokio::fs::write(&tmp, &body)
        .await
        .with_context(|| format!("Failed to write token file: {}", tmp.display()))?;
    restrict_permissions(&tmp).await?;
    if let Err(e) = tokio::fs::rename(&tmp, path).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(e).with_context(|| format!("Failed to replace token file: {}", path.display()));
    }

    Ok(())
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

#[cfg(unix)]
async fn restrict_permissions(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)).await?;
    Ok(())
}

#[cfg(not(unix))]
async fn restrict_permissions(_path: &Path) -> Result<()> {
    Ok(())
}

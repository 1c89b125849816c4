//! YouTube Data API v3 playlist client.
//!
//! Membership is checked with `playlistItems.list`, paging through
//! `nextPageToken`; tracks are appended with `playlistItems.insert`.
//! Titles come from `videos.list`, using the read-only API key when one is
//! configured so a title lookup never triggers a consent prompt.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;

use super::{
    status_error, ApiClient, DefinitiveError, OAuthDefaults, PlaylistProvider, ProviderError,
    PAGE_SIZE,
};
use crate::models::ProviderKind;
use crate::oauth::AuthScheme;

pub const API_BASE: &str = "https://www.googleapis.com/youtube/v3";

pub(crate) fn oauth_defaults() -> OAuthDefaults {
    OAuthDefaults {
        auth_url: "https://accounts.google.com/o/oauth2/v2/auth",
        token_url: "https://oauth2.googleapis.com/token",
        api_base: API_BASE,
        probe_path: "/channels?part=id&mine=true",
        scopes: &["https://www.googleapis.com/auth/youtube"],
        // Google only issues a refresh token for offline access.
        extra_auth_params: &[("access_type", "offline"), ("prompt", "consent")],
        auth_scheme: AuthScheme::Bearer,
    }
}

pub struct YouTubeClient {
    api: ApiClient,
    api_base: String,
    playlist_id: String,
    api_key: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PlaylistItemsPage {
    #[serde(default)]
    items: Vec<PlaylistItem>,
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PlaylistItem {
    snippet: Option<PlaylistItemSnippet>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PlaylistItemSnippet {
    resource_id: Option<ResourceId>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResourceId {
    video_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct VideoList {
    #[serde(default)]
    items: Vec<Video>,
}

#[derive(Debug, Deserialize)]
struct Video {
    snippet: Option<VideoSnippet>,
}

#[derive(Debug, Deserialize)]
struct VideoSnippet {
    title: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    message: String,
    #[serde(default)]
    errors: Vec<ErrorItem>,
}

#[derive(Debug, Deserialize)]
struct ErrorItem {
    #[serde(default)]
    reason: String,
}

impl YouTubeClient {
    pub fn new(
        api: ApiClient,
        api_base: Option<String>,
        playlist_id: String,
        api_key: Option<String>,
    ) -> Self {
        let api_base = api_base
            .unwrap_or_else(|| API_BASE.to_string())
            .trim_end_matches('/')
            .to_string();
        Self {
            api,
            api_base,
            playlist_id,
            api_key: api_key.filter(|k| !k.trim().is_empty()),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.api_base, path)
    }

    /// Turn a non-success response into a typed error, reading Google's
    /// `error.errors[].reason` where present.
    async fn error_from(&self, resp: reqwest::Response, video_id: &str) -> ProviderError {
        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        let parsed = serde_json::from_str::<ErrorEnvelope>(&body).ok();
        let reason = parsed
            .as_ref()
            .and_then(|e| e.error.errors.first())
            .map(|e| e.reason.as_str())
            .unwrap_or_default();
        let message = parsed
            .as_ref()
            .map(|e| e.error.message.clone())
            .unwrap_or(body.clone());

        match reason {
            "videoNotFound" => DefinitiveError::TrackNotFound(video_id.to_string()).into(),
            "playlistNotFound" => DefinitiveError::PlaylistNotFound(self.playlist_id.clone()).into(),
            "forbidden" | "insufficientPermissions" | "playlistItemsNotAccessible" => {
                DefinitiveError::PermissionDenied(message).into()
            }
            "quotaExceeded" | "rateLimitExceeded" | "userRateLimitExceeded" => {
                ProviderError::Transient(format!("{}: {}", reason, message))
            }
            _ => {
                let playlist_id = self.playlist_id.clone();
                status_error(status, &message, move |_| {
                    DefinitiveError::PlaylistNotFound(playlist_id)
                })
            }
        }
    }
}

#[async_trait]
impl PlaylistProvider for YouTubeClient {
    fn kind(&self) -> ProviderKind {
        ProviderKind::YouTube
    }

    async fn is_track_present(&self, external_id: &str) -> Result<bool, ProviderError> {
        let url = self.url("playlistItems");
        let mut page_token: Option<String> = None;
        let mut pages = 0u32;
        let page_size = PAGE_SIZE.to_string();

        loop {
            let token = page_token.clone();
            let resp = self
                .api
                .send(|http| {
                    let mut req = http.get(&url).query(&[
                        ("part", "snippet"),
                        ("playlistId", self.playlist_id.as_str()),
                        ("maxResults", page_size.as_str()),
                    ]);
                    if let Some(t) = &token {
                        req = req.query(&[("pageToken", t.as_str())]);
                    }
                    req
                })
                .await?;

            if !resp.status().is_success() {
                return Err(self.error_from(resp, external_id).await);
            }

            let page: PlaylistItemsPage = resp.json().await?;
            pages += 1;
            let found = page.items.iter().any(|item| {
                item.snippet
                    .as_ref()
                    .and_then(|s| s.resource_id.as_ref())
                    .and_then(|r| r.video_id.as_deref())
                    == Some(external_id)
            });
            if found {
                tracing::debug!(video_id = external_id, pages, "Video already in playlist");
                return Ok(true);
            }

            match page.next_page_token.filter(|t| !t.is_empty()) {
                Some(next) => page_token = Some(next),
                None => return Ok(false),
            }
        }
    }

    async fn insert_track(&self, external_id: &str) -> Result<(), ProviderError> {
        let url = self.url("playlistItems");
        let body = json!({
            "snippet": {
                "playlistId": self.playlist_id,
                "resourceId": {
                    "kind": "youtube#video",
                    "videoId": external_id,
                }
            }
        });

        let resp = self
            .api
            .send(|http| http.post(&url).query(&[("part", "snippet")]).json(&body))
            .await?;
        if !resp.status().is_success() {
            return Err(self.error_from(resp, external_id).await);
        }

        tracing::info!(video_id = external_id, "Added video to YouTube playlist");
        Ok(())
    }

    async fn resolve_title(&self, external_id: &str) -> Option<String> {
        let url = self.url("videos");
        let query = [("part", "snippet"), ("id", external_id)];

        let resp = match &self.api_key {
            Some(key) => self
                .api
                .http()
                .get(&url)
                .query(&query)
                .query(&[("key", key.as_str())])
                .send()
                .await
                .map_err(ProviderError::from),
            None => self.api.send(|http| http.get(&url).query(&query)).await,
        };

        let resp = match resp {
            Ok(r) if r.status().is_success() => r,
            Ok(r) => {
                tracing::debug!(video_id = external_id, "Title lookup returned {}", r.status());
                return None;
            }
            Err(e) => {
                tracing::debug!(video_id = external_id, "Title lookup failed: {}", e);
                return None;
            }
        };

        let list: VideoList = resp.json().await.ok()?;
        list.items
            .into_iter()
            .next()
            .and_then(|v| v.snippet)
            .and_then(|s| s.title)
    }
}

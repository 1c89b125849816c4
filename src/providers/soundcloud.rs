//! SoundCloud playlist client.
//!
//! External ids are `user/track` permalinks; the API addresses tracks by
//! numeric id, so every id is resolved through `/resolve` first and cached
//! for the life of the client. SoundCloud has no "append" call: inserting
//! rewrites the playlist's full track list with the new id at the end.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Mutex;

use super::{
    status_error, ApiClient, DefinitiveError, OAuthDefaults, PlaylistProvider, ProviderError,
    PAGE_SIZE,
};
use crate::classify::SOUNDCLOUD_CANONICAL_PREFIX;
use crate::models::ProviderKind;
use crate::oauth::AuthScheme;

pub const API_BASE: &str = "https://api.soundcloud.com";

pub(crate) fn oauth_defaults() -> OAuthDefaults {
    OAuthDefaults {
        auth_url: "https://secure.soundcloud.com/authorize",
        token_url: "https://secure.soundcloud.com/oauth/token",
        api_base: API_BASE,
        probe_path: "/me",
        scopes: &["non-expiring"],
        extra_auth_params: &[],
        auth_scheme: AuthScheme::OAuth,
    }
}

#[derive(Debug, Clone)]
struct ResolvedTrack {
    id: i64,
    title: Option<String>,
}

pub struct SoundCloudClient {
    api: ApiClient,
    api_base: String,
    playlist_id: String,
    resolved: Mutex<HashMap<String, ResolvedTrack>>,
}

#[derive(Debug, Deserialize)]
struct ResolveResponse {
    id: i64,
    #[serde(default)]
    kind: Option<String>,
    #[serde(default)]
    title: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TrackRef {
    id: i64,
}

/// `linked_partitioning` pages carry a cursor; older endpoints return a
/// bare array.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum TrackPage {
    Paged {
        #[serde(default)]
        collection: Vec<TrackRef>,
        #[serde(default)]
        next_href: Option<String>,
    },
    Plain(Vec<TrackRef>),
}

impl SoundCloudClient {
    pub fn new(api: ApiClient, api_base: Option<String>, playlist_id: String) -> Self {
        let api_base = api_base
            .unwrap_or_else(|| API_BASE.to_string())
            .trim_end_matches('/')
            .to_string();
        Self {
            api,
            api_base,
            playlist_id,
            resolved: Mutex::new(HashMap::new()),
        }
    }

    async fn resolve(&self, external_id: &str) -> Result<ResolvedTrack, ProviderError> {
        let cached = self.resolved.lock().unwrap().get(external_id).cloned();
        if let Some(hit) = cached {
            return Ok(hit);
        }

        let url = format!("{}/resolve", self.api_base);
        let permalink = format!("{}{}", SOUNDCLOUD_CANONICAL_PREFIX, external_id);
        let resp = self
            .api
            .send(|http| http.get(&url).query(&[("url", permalink.as_str())]))
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(status_error(status, &body, |_| {
                DefinitiveError::TrackNotFound(external_id.to_string())
            }));
        }

        let parsed: ResolveResponse = resp.json().await?;
        if parsed.kind.as_deref().is_some_and(|k| k != "track") {
            return Err(DefinitiveError::TrackNotFound(format!(
                "{} resolves to a {}, not a track",
                external_id,
                parsed.kind.unwrap_or_default()
            ))
            .into());
        }

        let track = ResolvedTrack {
            id: parsed.id,
            title: parsed.title,
        };
        self.resolved
            .lock()
            .unwrap()
            .insert(external_id.to_string(), track.clone());
        Ok(track)
    }

    /// Every track id in the playlist, following `next_href` to the end.
    async fn playlist_track_ids(&self) -> Result<Vec<i64>, ProviderError> {
        let mut ids = Vec::new();
        let mut next = Some(format!(
            "{}/playlists/{}/tracks?linked_partitioning=true&limit={}",
            self.api_base, self.playlist_id, PAGE_SIZE
        ));

        while let Some(url) = next.take() {
            let resp = self.api.send(|http| http.get(&url)).await?;
            let status = resp.status();
            if !status.is_success() {
                let body = resp.text().await.unwrap_or_default();
                return Err(status_error(status, &body, |_| {
                    DefinitiveError::PlaylistNotFound(self.playlist_id.clone())
                }));
            }

            match resp.json::<TrackPage>().await? {
                TrackPage::Paged {
                    collection,
                    next_href,
                } => {
                    ids.extend(collection.into_iter().map(|t| t.id));
                    next = next_href.filter(|h| !h.is_empty());
                }
                TrackPage::Plain(tracks) => ids.extend(tracks.into_iter().map(|t| t.id)),
            }
        }

        Ok(ids)
    }
}

#[async_trait]
impl PlaylistProvider for SoundCloudClient {
    fn kind(&self) -> ProviderKind {
        ProviderKind::SoundCloud
    }

    async fn is_track_present(&self, external_id: &str) -> Result<bool, ProviderError> {
        let track = self.resolve(external_id).await?;
        let ids = self.playlist_track_ids().await?;
        Ok(ids.contains(&track.id))
    }

    async fn insert_track(&self, external_id: &str) -> Result<(), ProviderError> {
        let track = self.resolve(external_id).await?;
        let mut ids = self.playlist_track_ids().await?;
        if ids.contains(&track.id) {
            return Ok(());
        }
        ids.push(track.id);

        let url = format!("{}/playlists/{}", self.api_base, self.playlist_id);
        let body = json!({
            "playlist": {
                "tracks": ids.iter().map(|id| json!({ "id": id })).collect::<Vec<_>>()
            }
        });
        let resp = self.api.send(|http| http.put(&url).json(&body)).await?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(status_error(status, &text, |_| {
                DefinitiveError::PlaylistNotFound(self.playlist_id.clone())
            }));
        }

        tracing::info!(track = external_id, track_id = track.id, "Added track to SoundCloud playlist");
        Ok(())
    }

    async fn resolve_title(&self, external_id: &str) -> Option<String> {
        match self.resolve(external_id).await {
            Ok(track) => track.title,
            Err(e) => {
                tracing::debug!(track = external_id, "Title lookup failed: {}", e);
                None
            }
        }
    }
}

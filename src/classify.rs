//! Link classification.
//!
//! Turns free text into an ordered list of [`ExtractedLink`]s and rewrites
//! accepted URL variants into one canonical form, so dedup keys stay stable
//! regardless of which mirror or subdomain a user pasted.
//!
//! Everything here is pure: no I/O, no state. Text that contains no
//! recognizable link, or a link whose identifier fails validation, simply
//! yields no entries.
//!
//! # Accepted shapes
//!
//! | Provider | Shape | Example |
//! |----------|-------|---------|
//! | YouTube | canonical | `https://www.youtube.com/watch?v=dQw4w9WgXcQ` |
//! | YouTube | short link | `https://youtu.be/dQw4w9WgXcQ` |
//! | YouTube | music subdomain | `https://music.youtube.com/watch?v=dQw4w9WgXcQ` |
//! | YouTube | mobile | `https://m.youtube.com/watch?v=dQw4w9WgXcQ` |
//! | YouTube | shorts | `https://youtube.com/shorts/dQw4w9WgXcQ` |
//! | SoundCloud | track page | `https://soundcloud.com/artist/track-name` |

use regex::Regex;
use std::collections::HashSet;
use std::sync::LazyLock;
use url::Url;

use crate::models::{ExtractedLink, ProviderKind};

/// Canonical prefix every accepted YouTube variant is rewritten to.
pub const YOUTUBE_CANONICAL_PREFIX: &str = "https://www.youtube.com/watch?v=";
/// Canonical prefix for SoundCloud track pages.
pub const SOUNDCLOUD_CANONICAL_PREFIX: &str = "https://soundcloud.com/";

const YOUTUBE_ID_LEN: usize = 11;

/// Candidate URL tokens in free text. Angle brackets and parentheses are
/// excluded so `<https://...>` and markdown links split cleanly.
static URL_TOKEN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"(?i)https?://[^\s<>"'()\[\]{}|\\^`]+"#).unwrap());

static YOUTUBE_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        // www / bare / music. / m. watch pages, `v` anywhere in the query
        r"(?i)^https?://(?:www\.|m\.|music\.)?youtube\.com/watch\?(?:[^#]*&)?v=([A-Za-z0-9_-]{11})(?:[&#]|$)",
        r"(?i)^https?://(?:www\.)?youtu\.be/([A-Za-z0-9_-]{11})(?:[/?&#]|$)",
        r"(?i)^https?://(?:www\.|m\.)?youtube\.com/shorts/([A-Za-z0-9_-]{11})(?:[/?&#]|$)",
    ]
    .iter()
    .map(|p| Regex::new(p).unwrap())
    .collect()
});

static YOUTUBE_ID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_-]{11}$").unwrap());

static SOUNDCLOUD_TRACK: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)^https?://(?:www\.|m\.)?soundcloud\.com/([A-Za-z0-9_-]+)/([A-Za-z0-9_-]+)/?(?:[?#]|$)",
    )
    .unwrap()
});

/// Profile tabs that look like `user/track` but are not tracks.
const SOUNDCLOUD_NON_TRACK_SEGMENTS: &[&str] = &[
    "sets",
    "likes",
    "tracks",
    "albums",
    "reposts",
    "followers",
    "following",
    "popular-tracks",
    "comments",
];

/// Extract every recognizable music link from `text`.
///
/// Links are returned in order of first appearance. A URL that appears more
/// than once (by exact text) is returned once. Unknown domains and links that
/// fail identifier validation are dropped.
pub fn extract_links(text: &str) -> Vec<ExtractedLink> {
    let mut seen = HashSet::new();
    let mut links = Vec::new();

    for m in URL_TOKEN.find_iter(text) {
        let raw = trim_trailing_punctuation(m.as_str());
        if !seen.insert(raw.to_string()) {
            continue;
        }

        let provider = identify_provider(raw);
        if provider == ProviderKind::Unknown {
            continue;
        }

        if let Some(external_id) = extract_external_id(raw) {
            links.push(ExtractedLink {
                raw_url: raw.to_string(),
                provider,
                external_id,
            });
        }
    }

    links
}

/// Classify a URL by domain alone.
///
/// A case-insensitive substring test, deliberately independent of the
/// extraction patterns, for URLs that arrive already parsed.
pub fn identify_provider(url: &str) -> ProviderKind {
    let lower = url.to_ascii_lowercase();
    if lower.contains("youtube.com") || lower.contains("youtu.be") {
        ProviderKind::YouTube
    } else if lower.contains("soundcloud.com") {
        ProviderKind::SoundCloud
    } else {
        ProviderKind::Unknown
    }
}

/// Derive the platform identifier for a URL.
///
/// For YouTube this is the 11-character video id; anything shorter or longer
/// is rejected. For SoundCloud it is the lowercased `user/track` path.
pub fn extract_external_id(url: &str) -> Option<String> {
    match identify_provider(url) {
        ProviderKind::YouTube => extract_youtube_video_id(url),
        ProviderKind::SoundCloud => extract_soundcloud_path(url),
        ProviderKind::Unknown => None,
    }
}

/// Rewrite any accepted variant to its canonical URL.
pub fn normalize(url: &str) -> Option<String> {
    match identify_provider(url) {
        ProviderKind::YouTube => {
            extract_youtube_video_id(url).map(|id| format!("{}{}", YOUTUBE_CANONICAL_PREFIX, id))
        }
        ProviderKind::SoundCloud => {
            extract_soundcloud_path(url).map(|path| format!("{}{}", SOUNDCLOUD_CANONICAL_PREFIX, path))
        }
        ProviderKind::Unknown => None,
    }
}

/// Whether a YouTube URL points at (or carries) a playlist.
pub fn is_youtube_playlist(url: &str) -> bool {
    match Url::parse(url) {
        Ok(parsed) => {
            host_matches(&parsed, "youtube.com") && parsed.query_pairs().any(|(k, _)| k == "list")
        }
        Err(_) => false,
    }
}

/// Whether a URL is a YouTube Shorts link.
pub fn is_youtube_shorts(url: &str) -> bool {
    url.to_ascii_lowercase().contains("/shorts/")
}

fn extract_youtube_video_id(url: &str) -> Option<String> {
    for pattern in YOUTUBE_PATTERNS.iter() {
        if let Some(caps) = pattern.captures(url) {
            return Some(caps[1].to_string());
        }
    }

    // Fallback: parse the URL and look at the path / query directly.
    let parsed = Url::parse(url).ok()?;
    let candidate = if host_matches(&parsed, "youtu.be") {
        parsed
            .path_segments()
            .and_then(|mut segs| segs.next())
            .map(str::to_string)
    } else if host_matches(&parsed, "youtube.com") {
        parsed
            .query_pairs()
            .find(|(k, _)| k == "v")
            .map(|(_, v)| v.into_owned())
            .or_else(|| {
                let segs: Vec<&str> = parsed.path_segments()?.collect();
                match segs.as_slice() {
                    ["embed" | "shorts" | "live" | "v", id, ..] => Some(id.to_string()),
                    _ => None,
                }
            })
    } else {
        None
    };

    candidate.filter(|id| id.len() == YOUTUBE_ID_LEN && YOUTUBE_ID.is_match(id))
}

fn extract_soundcloud_path(url: &str) -> Option<String> {
    let caps = SOUNDCLOUD_TRACK.captures(url)?;
    let user = caps[1].to_ascii_lowercase();
    let track = caps[2].to_ascii_lowercase();
    if SOUNDCLOUD_NON_TRACK_SEGMENTS.contains(&track.as_str()) {
        return None;
    }
    Some(format!("{}/{}", user, track))
}

fn host_matches(url: &Url, domain: &str) -> bool {
    match url.host_str() {
        Some(host) => {
            let host = host.to_ascii_lowercase();
            host == domain || host.ends_with(&format!(".{}", domain))
        }
        None => false,
    }
}

/// Sentence punctuation that commonly trails a pasted URL.
fn trim_trailing_punctuation(token: &str) -> &str {
    token.trim_end_matches(['.', ',', ';', ':', '!', '?'])
}

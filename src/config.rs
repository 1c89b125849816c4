use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::models::ProviderKind;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub log: LogConfig,
    #[serde(default)]
    pub retention: RetentionConfig,
    #[serde(default)]
    pub oauth: OAuthConfig,
    #[serde(default)]
    pub providers: ProvidersConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LogConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetentionConfig {
    #[serde(default = "default_max_age_days")]
    pub max_age_days: u32,
    /// Pending claims older than this are released when the service opens.
    #[serde(default = "default_stale_claim_minutes")]
    pub stale_claim_minutes: i64,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            max_age_days: default_max_age_days(),
            stale_claim_minutes: default_stale_claim_minutes(),
        }
    }
}

fn default_max_age_days() -> u32 {
    30
}
fn default_stale_claim_minutes() -> i64 {
    15
}

#[derive(Debug, Deserialize, Clone)]
pub struct OAuthConfig {
    /// Host in the redirect URI. The listener only binds 127.0.0.1.
    #[serde(default = "default_callback_host")]
    pub callback_host: String,
    #[serde(default = "default_callback_port")]
    pub callback_port: u16,
    #[serde(default = "default_callback_timeout_secs")]
    pub callback_timeout_secs: u64,
    /// Tokens expiring within this many seconds are refreshed before use.
    #[serde(default = "default_refresh_skew_secs")]
    pub refresh_skew_secs: i64,
    #[serde(default = "default_http_timeout_secs")]
    pub http_timeout_secs: u64,
    #[serde(default = "default_token_dir")]
    pub token_dir: PathBuf,
}

impl Default for OAuthConfig {
    fn default() -> Self {
        Self {
            callback_host: default_callback_host(),
            callback_port: default_callback_port(),
            callback_timeout_secs: default_callback_timeout_secs(),
            refresh_skew_secs: default_refresh_skew_secs(),
            http_timeout_secs: default_http_timeout_secs(),
            token_dir: default_token_dir(),
        }
    }
}

fn default_callback_host() -> String {
    "127.0.0.1".to_string()
}
fn default_callback_port() -> u16 {
    8888
}
fn default_callback_timeout_secs() -> u64 {
    300
}
fn default_refresh_skew_secs() -> i64 {
    60
}
fn default_http_timeout_secs() -> u64 {
    30
}
fn default_token_dir() -> PathBuf {
    PathBuf::from("./data")
}

impl OAuthConfig {
    pub fn redirect_uri(&self) -> String {
        format!(
            "http://{}:{}/callback",
            self.callback_host, self.callback_port
        )
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct ProvidersConfig {
    pub youtube: Option<ProviderConfig>,
    pub soundcloud: Option<ProviderConfig>,
}

impl ProvidersConfig {
    pub fn get(&self, kind: ProviderKind) -> Option<&ProviderConfig> {
        match kind {
            ProviderKind::YouTube => self.youtube.as_ref(),
            ProviderKind::SoundCloud => self.soundcloud.as_ref(),
            ProviderKind::Unknown => None,
        }
    }
}

/// Per-provider settings. Endpoints default to the public APIs and are only
/// overridden for testing against local stand-ins.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct ProviderConfig {
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default)]
    pub client_secret: Option<String>,
    #[serde(default)]
    pub playlist_id: Option<String>,
    /// Read-only API key (YouTube title lookups).
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub token_file: Option<PathBuf>,
    #[serde(default)]
    pub scopes: Option<Vec<String>>,
    #[serde(default)]
    pub auth_url: Option<String>,
    #[serde(default)]
    pub token_url: Option<String>,
    #[serde(default)]
    pub api_base: Option<String>,
}

impl ProviderConfig {
    /// A provider is active only when client id, secret, and playlist id are all set.
    pub fn is_complete(&self) -> bool {
        non_empty(&self.client_id) && non_empty(&self.client_secret) && non_empty(&self.playlist_id)
    }

    /// Names of the settings that are still missing.
    pub fn missing_fields(&self) -> Vec<&'static str> {
        let mut missing = Vec::new();
        if !non_empty(&self.client_id) {
            missing.push("client_id");
        }
        if !non_empty(&self.client_secret) {
            missing.push("client_secret");
        }
        if !non_empty(&self.playlist_id) {
            missing.push("playlist_id");
        }
        missing
    }
}

fn non_empty(value: &Option<String>) -> bool {
    value.as_deref().is_some_and(|v| !v.trim().is_empty())
}

impl Config {
    /// Path of the token file for a provider.
    pub fn token_path(&self, kind: ProviderKind) -> PathBuf {
        self.providers
            .get(kind)
            .and_then(|p| p.token_file.clone())
            .unwrap_or_else(|| {
                self.oauth
                    .token_dir
                    .join(format!("{}_oauth_token.json", kind.as_str()))
            })
    }
}

/// Environment variables that override the file, per provider and field.
const ENV_OVERRIDES: &[(ProviderKind, &str, &str)] = &[
    (ProviderKind::YouTube, "client_id", "YOUTUBE_CLIENT_ID"),
    (ProviderKind::YouTube, "client_secret", "YOUTUBE_CLIENT_SECRET"),
    (ProviderKind::YouTube, "playlist_id", "YOUTUBE_PLAYLIST_ID"),
    (ProviderKind::YouTube, "api_key", "YOUTUBE_API_KEY"),
    (ProviderKind::SoundCloud, "client_id", "SOUNDCLOUD_CLIENT_ID"),
    (ProviderKind::SoundCloud, "client_secret", "SOUNDCLOUD_CLIENT_SECRET"),
    (ProviderKind::SoundCloud, "playlist_id", "SOUNDCLOUD_PLAYLIST_ID"),
];

fn apply_env_overrides(config: &mut Config) {
    for (kind, field, var) in ENV_OVERRIDES {
        let Ok(value) = std::env::var(var) else {
            continue;
        };
        if value.trim().is_empty() {
            continue;
        }
        let slot = match kind {
            ProviderKind::YouTube => &mut config.providers.youtube,
            ProviderKind::SoundCloud => &mut config.providers.soundcloud,
            ProviderKind::Unknown => continue,
        };
        let provider = slot.get_or_insert_with(ProviderConfig::default);
        match *field {
            "client_id" => provider.client_id = Some(value),
            "client_secret" => provider.client_secret = Some(value),
            "playlist_id" => provider.playlist_id = Some(value),
            "api_key" => provider.api_key = Some(value),
            _ => {}
        }
    }
}

/// Parse and validate a configuration string without touching the environment.
pub fn parse_config(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let mut config: Config =
        toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    apply_env_overrides(&mut config);
    validate(&config)?;

    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    if config.retention.max_age_days == 0 {
        anyhow::bail!("retention.max_age_days must be >= 1");
    }

    if config.retention.stale_claim_minutes < 1 {
        anyhow::bail!("retention.stale_claim_minutes must be >= 1");
    }

    if config.oauth.callback_timeout_secs == 0 {
        anyhow::bail!("oauth.callback_timeout_secs must be > 0");
    }

    if config.oauth.callback_port == 0 {
        anyhow::bail!("oauth.callback_port must be a fixed port (not 0)");
    }

    if config.oauth.refresh_skew_secs < 0 {
        anyhow::bail!("oauth.refresh_skew_secs must be >= 0");
    }

    match config.log.level.to_ascii_lowercase().as_str() {
        "trace" | "debug" | "info" | "warn" | "error" => {}
        other => anyhow::bail!(
            "Unknown log level: '{}'. Must be trace, debug, info, warn, or error.",
            other
        ),
    }

    Ok(())
}

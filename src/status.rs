//! Provider configuration overview for `relay status`.

use anyhow::Result;

use crate::config::Config;
use crate::models::ProviderKind;

/// One provider's readiness.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderStatus {
    pub provider: ProviderKind,
    pub configured: bool,
    pub missing: Vec<&'static str>,
    pub token_present: bool,
}

pub fn provider_statuses(config: &Config) -> Vec<ProviderStatus> {
    ProviderKind::ALL
        .into_iter()
        .map(|kind| {
            let (configured, missing) = match config.providers.get(kind) {
                Some(p) => (p.is_complete(), p.missing_fields()),
                None => (false, vec!["client_id", "client_secret", "playlist_id"]),
            };
            ProviderStatus {
                provider: kind,
                configured,
                missing,
                token_present: config.token_path(kind).exists(),
            }
        })
        .collect()
}

pub fn print_status(config: &Config) -> Result<()> {
    println!("{:<12} {:<36} TOKEN", "PROVIDER", "STATUS");
    for s in provider_statuses(config) {
        let status = if s.configured {
            "OK".to_string()
        } else {
            format!("NOT CONFIGURED ({})", s.missing.join(", "))
        };
        let token = if s.token_present { "stored" } else { "none" };
        println!("{:<12} {:<36} {}", s.provider, status, token);
    }
    Ok(())
}

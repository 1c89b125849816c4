//! Delivering the authorization URL to the user.

use anyhow::Result;

/// Opens the provider's consent page.
///
/// The system implementation launches the default browser; tests supply a
/// launcher that plays the user's part.
pub trait BrowserLauncher: Send + Sync {
    fn open(&self, url: &str) -> Result<()>;
}

/// Launches the platform browser and logs the URL for headless hosts.
pub struct SystemBrowser;

impl BrowserLauncher for SystemBrowser {
    fn open(&self, url: &str) -> Result<()> {
        tracing::info!("Open this URL to authorize playlist access: {}", url);
        if let Err(e) = webbrowser::open(url) {
            // Not fatal: the URL is in the log and can be opened by hand.
            tracing::warn!("Could not launch a browser: {}", e);
        }
        Ok(())
    }
}

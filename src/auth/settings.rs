//! Runtime knobs for a login flow

use std::path::PathBuf;
use std::time::Duration;

use url::Url;

pub const DEFAULT_CALLBACK_PATH: &str = "/auth/callback";
/// How long the external signer app gets to answer
pub const CALLBACK_TIMEOUT: Duration = Duration::from_secs(30);
/// Pause after the tab regains focus before re-reading the URL
pub const VISIBILITY_SETTLE_DELAY: Duration = Duration::from_millis(500);
/// Bound on each NIP-46 round trip
pub const BUNKER_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct FlowSettings {
    /// Base URL of the relay admin backend
    pub api_url: Url,
    /// Shown to the user inside the signer app
    pub app_name: String,
    /// Where the signer app sends the browser back to
    pub callback_url: Url,
    /// Name of the external signer app, used in messages
    pub signer_app: String,
    pub callback_timeout: Duration,
    pub settle_delay: Duration,
    pub bunker_timeout: Duration,
    /// Where the remembered bunker lives; `None` disables it
    pub state_dir: Option<PathBuf>,
}

impl FlowSettings {
    pub fn new(api_url: Url) -> Self {
        let callback_url = api_url
            .join(DEFAULT_CALLBACK_PATH)
            .unwrap_or_else(|_| api_url.clone());
        Self {
            api_url,
            app_name: "Relay Admin".to_string(),
            callback_url,
            signer_app: "Amber".to_string(),
            callback_timeout: CALLBACK_TIMEOUT,
            settle_delay: VISIBILITY_SETTLE_DELAY,
            bunker_timeout: BUNKER_TIMEOUT,
            state_dir: None,
        }
    }

    pub fn callback_path(&self) -> &str {
        self.callback_url.path()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_callback_url() {
        let s = FlowSettings::new(Url::parse("http://localhost:8080").unwrap());
        assert_eq!(s.callback_url.as_str(), "http://localhost:8080/auth/callback");
        assert_eq!(s.callback_path(), DEFAULT_CALLBACK_PATH);
        assert_eq!(s.callback_timeout, Duration::from_secs(30));
    }
}

use anyhow::Context;
use config::{Config, Environment, File};
use meshcall_media::FacingMode;
use meshcall_protocol::ice::IceConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

pub const DEFAULT_SETTINGS_FILE_NAME: &str = "config.toml";
pub const DEFAULT_SIGNALING_PORT: u16 = 3001;
/// Host the deployment is reachable at, used to derive the signaling URL if none is configured.
pub const PUBLIC_HOST_ENV: &str = "MESHCALL_PUBLIC_HOST";

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AppConfig {
    pub signaling: SignalingConfig,
    pub ice: IceConfig,
    pub media: MediaConfig,
    pub negotiation: NegotiationConfig,
}

impl AppConfig {
    pub fn parse(config_dir: &Path) -> anyhow::Result<Self> {
        Config::builder()
            .add_source(Config::try_from(&AppConfig::default())?)
            .add_source(
                File::with_name(
                    config_dir
                        .join(DEFAULT_SETTINGS_FILE_NAME)
                        .to_str()
                        .context("Failed to build config file path")?,
                )
                .required(false),
            )
            .add_source(File::with_name(DEFAULT_SETTINGS_FILE_NAME).required(false))
            .add_source(
                Environment::with_prefix("meshcall")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .context("Failed to build config")?
            .try_deserialize()
            .context("Failed to deserialize config")
    }
}

pub fn config_dir() -> std::path::PathBuf {
    Path::new("/etc").join(env!("CARGO_PKG_NAME").to_lowercase())
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SignalingConfig {
    pub url: Option<String>,
}

impl SignalingConfig {
    /// The configured URL, or one derived from the public host of the deployment.
    pub fn resolve_url(&self) -> String {
        match &self.url {
            Some(url) => url.clone(),
            None => default_signaling_url(std::env::var(PUBLIC_HOST_ENV).ok().as_deref()),
        }
    }
}

pub fn default_signaling_url(public_host: Option<&str>) -> String {
    let host = public_host
        .map(str::trim)
        .filter(|host| !host.is_empty())
        .unwrap_or("localhost");
    format!("ws://{host}:{DEFAULT_SIGNALING_PORT}/ws")
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaConfig {
    pub facing_mode: FacingMode,
    pub switch_grace_ms: u64,
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            facing_mode: FacingMode::User,
            switch_grace_ms: 100,
        }
    }
}

impl MediaConfig {
    pub fn switch_grace(&self) -> Duration {
        Duration::from_millis(self.switch_grace_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct NegotiationConfig {
    /// Unanswered offers are abandoned after this long. Disabled if unset.
    pub timeout_ms: Option<u64>,
}

impl NegotiationConfig {
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meshcall_protocol::ice::DEFAULT_STUN_SERVER;
    use pretty_assertions::assert_eq;

    #[test]
    fn signaling_url_derived_from_host() {
        assert_eq!(default_signaling_url(None), "ws://localhost:3001/ws");
        assert_eq!(default_signaling_url(Some(" ")), "ws://localhost:3001/ws");
        assert_eq!(
            default_signaling_url(Some("192.168.1.10")),
            "ws://192.168.1.10:3001/ws"
        );

        let config = SignalingConfig {
            url: Some("wss://relay.example.org/ws".to_string()),
        };
        assert_eq!(config.resolve_url(), "wss://relay.example.org/ws");
    }

    #[test]
    fn parse_defaults_without_files() {
        let dir = std::env::temp_dir().join(format!("meshcall-{}", uuid::Uuid::new_v4()));
        let config = AppConfig::parse(&dir).unwrap();

        assert_eq!(config.ice.servers.len(), 1);
        assert_eq!(config.ice.servers[0].urls, vec![DEFAULT_STUN_SERVER]);
        assert_eq!(config.media.facing_mode, FacingMode::User);
        assert_eq!(config.media.switch_grace(), Duration::from_millis(100));
        assert_eq!(config.negotiation.timeout(), None);
    }

    #[test]
    fn parse_file_overrides() {
        let dir = std::env::temp_dir().join(format!("meshcall-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(
            dir.join(DEFAULT_SETTINGS_FILE_NAME),
            r#"
[signaling]
url = "ws://relay.internal:3001/ws"

[media]
facing_mode = "environment"

[negotiation]
timeout_ms = 15000

[[ice.servers]]
urls = ["turn:turn.example.org:3478"]
username = "user"
credential = "secret"
"#,
        )
        .unwrap();

        let config = AppConfig::parse(&dir).unwrap();
        std::fs::remove_dir_all(&dir).unwrap();

        assert_eq!(
            config.signaling.url.as_deref(),
            Some("ws://relay.internal:3001/ws")
        );
        assert_eq!(config.media.facing_mode, FacingMode::Environment);
        assert_eq!(config.media.switch_grace_ms, 100);
        assert_eq!(config.negotiation.timeout(), Some(Duration::from_secs(15)));
        assert!(config.ice.has_turn());
    }
}

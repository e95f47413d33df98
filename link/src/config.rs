//! Client configuration file.
//!
//! # Configuration Format
//!
//! ```toml
//! [server]
//! url = "http://localhost:8080"   # Portal backend
//! ws_path = "/ws/websocket"       # Raw WebSocket endpoint of the SockJS registration
//!
//! [connection]
//! auto_reconnect = true
//! reconnect_delay_ms = 1000       # Initial reconnect delay
//! max_reconnect_delay_ms = 30000  # Cap for exponential backoff
//! backoff = "exponential"         # exponential, fixed
//!
//! [timeouts]                      # milliseconds, 0 = no timeout
//! connection_ms = 10000
//! handshake_ms = 5000
//! subscribe_ms = 5000
//! snapshot_ms = 30000
//! keepalive_interval_ms = 4000
//! pong_ms = 4000
//!
//! [auth]
//! jwt_token = "your-jwt-token"    # SMARTCITY_LINK_TOKEN overrides this
//! ```

use crate::{
    auth::AuthProvider,
    client::LinkClientBuilder,
    error::{LinkError, Result},
    models::ConnectionOptions,
    timeouts::LinkTimeouts,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Environment variable that overrides `[auth] jwt_token`.
pub const TOKEN_ENV: &str = "SMARTCITY_LINK_TOKEN";

/// Client configuration loaded from a TOML file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LinkConfig {
    #[serde(default)]
    pub server: ServerConfig,

    /// Reconnection behavior
    #[serde(default)]
    pub connection: ConnectionOptions,

    #[serde(default)]
    pub timeouts: TimeoutsConfig,

    #[serde(default)]
    pub auth: AuthConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Server URL (e.g., http://localhost:8080)
    #[serde(default = "default_url")]
    pub url: String,

    /// Overrides `[connection] ws_path` when set
    #[serde(default)]
    pub ws_path: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            url: default_url(),
            ws_path: None,
        }
    }
}

/// Timeouts in milliseconds. Zero disables a timeout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutsConfig {
    pub connection_ms: u64,
    pub handshake_ms: u64,
    pub subscribe_ms: u64,
    pub snapshot_ms: u64,
    pub keepalive_interval_ms: u64,
    pub pong_ms: u64,
}

impl Default for TimeoutsConfig {
    fn default() -> Self {
        let t = LinkTimeouts::default();
        Self {
            connection_ms: t.connection_timeout.as_millis() as u64,
            handshake_ms: t.handshake_timeout.as_millis() as u64,
            subscribe_ms: t.subscribe_timeout.as_millis() as u64,
            snapshot_ms: t.snapshot_timeout.as_millis() as u64,
            keepalive_interval_ms: t.keepalive_interval.as_millis() as u64,
            pong_ms: t.pong_timeout.as_millis() as u64,
        }
    }
}

impl From<&TimeoutsConfig> for LinkTimeouts {
    fn from(cfg: &TimeoutsConfig) -> Self {
        LinkTimeouts::builder()
            .connection_timeout(Duration::from_millis(cfg.connection_ms))
            .handshake_timeout(Duration::from_millis(cfg.handshake_ms))
            .subscribe_timeout(Duration::from_millis(cfg.subscribe_ms))
            .snapshot_timeout(Duration::from_millis(cfg.snapshot_ms))
            .keepalive_interval(Duration::from_millis(cfg.keepalive_interval_ms))
            .pong_timeout(Duration::from_millis(cfg.pong_ms))
            .build()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthConfig {
    /// JWT authentication token
    #[serde(default)]
    pub jwt_token: Option<String>,
}

fn default_url() -> String {
    "http://localhost:8080".to_string()
}

impl LinkConfig {
    /// Load configuration from file.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            LinkError::ConfigurationError(format!(
                "Failed to read config file {}: {}",
                path.display(),
                e
            ))
        })?;
        Self::from_toml_str(&contents)
    }

    pub fn from_toml_str(contents: &str) -> Result<Self> {
        let config: LinkConfig = toml::from_str(contents)?;
        config.connection.validate()?;
        Ok(config)
    }

    /// Connection options with `[server] ws_path` applied.
    pub fn connection_options(&self) -> ConnectionOptions {
        match &self.server.ws_path {
            Some(path) => self.connection.clone().with_ws_path(path.clone()),
            None => self.connection.clone(),
        }
    }

    pub fn link_timeouts(&self) -> LinkTimeouts {
        LinkTimeouts::from(&self.timeouts)
    }

    fn auth_provider(&self, token_override: Option<String>) -> AuthProvider {
        match token_override.or_else(|| self.auth.jwt_token.clone()) {
            Some(token) => AuthProvider::jwt_token(token),
            None => AuthProvider::none(),
        }
    }

    /// Builder preloaded with this configuration. `SMARTCITY_LINK_TOKEN`
    /// takes precedence over `[auth] jwt_token`.
    pub fn into_builder(self) -> LinkClientBuilder {
        let token = std::env::var(TOKEN_ENV).ok().filter(|t| !t.trim().is_empty());
        self.into_builder_with_token(token)
    }

    fn into_builder_with_token(self, token_override: Option<String>) -> LinkClientBuilder {
        let auth = self.auth_provider(token_override);
        let options = self.connection_options();
        let timeouts = self.link_timeouts();
        LinkClientBuilder::default()
            .base_url(self.server.url)
            .auth(auth)
            .connection_options(options)
            .timeouts(timeouts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::BackoffPolicy;
    use std::io::Write;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = LinkConfig::from_toml_str("").unwrap();
        assert_eq!(config, LinkConfig::default());
        assert_eq!(config.server.url, "http://localhost:8080");
        assert_eq!(config.link_timeouts(), LinkTimeouts::default());
        assert_eq!(config.connection_options(), ConnectionOptions::default());
    }

    #[test]
    fn test_full_config() {
        let config = LinkConfig::from_toml_str(
            r#"
            [server]
            url = "https://portal.example.org"
            ws_path = "/push/websocket"

            [connection]
            auto_reconnect = false
            reconnect_delay_ms = 5000
            backoff = "fixed"

            [timeouts]
            snapshot_ms = 0
            pong_ms = 2500

            [auth]
            jwt_token = "from-file"
            "#,
        )
        .unwrap();

        let options = config.connection_options();
        assert!(!options.auto_reconnect);
        assert_eq!(options.reconnect_delay_ms, 5000);
        assert_eq!(options.max_reconnect_delay_ms, 30000);
        assert_eq!(options.backoff, BackoffPolicy::Fixed);
        assert_eq!(options.ws_path, "/push/websocket");

        let timeouts = config.link_timeouts();
        assert!(LinkTimeouts::is_no_timeout(timeouts.snapshot_timeout));
        assert_eq!(timeouts.pong_timeout, Duration::from_millis(2500));
        assert_eq!(timeouts.handshake_timeout, LinkTimeouts::default().handshake_timeout);
        assert_eq!(config.auth.jwt_token.as_deref(), Some("from-file"));
    }

    #[test]
    fn test_invalid_config_is_configuration_error() {
        let err = LinkConfig::from_toml_str("[connection]\nbackoff = \"linear\"").unwrap_err();
        assert!(matches!(err, LinkError::ConfigurationError(_)));
    }

    #[test]
    fn test_inverted_backoff_bounds_are_rejected() {
        let err = LinkConfig::from_toml_str(
            "[connection]\nreconnect_delay_ms = 5000\nmax_reconnect_delay_ms = 1000",
        )
        .unwrap_err();
        assert!(matches!(err, LinkError::ConfigurationError(_)));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[server]\nurl = \"http://10.0.0.5:8080\"").unwrap();
        let config = LinkConfig::load(file.path()).unwrap();
        assert_eq!(config.server.url, "http://10.0.0.5:8080");

        let missing = LinkConfig::load(Path::new("/definitely/not/here.toml"));
        assert!(matches!(missing, Err(LinkError::ConfigurationError(_))));
    }

    #[test]
    fn test_token_override_wins() {
        let config = LinkConfig::from_toml_str("[auth]\njwt_token = \"from-file\"").unwrap();
        assert_eq!(
            config.auth_provider(Some("from-env".to_string())),
            AuthProvider::jwt_token("from-env".to_string())
        );
        assert_eq!(
            config.auth_provider(None),
            AuthProvider::jwt_token("from-file".to_string())
        );
        assert_eq!(LinkConfig::default().auth_provider(None), AuthProvider::none());
    }

    #[tokio::test]
    async fn test_into_builder_builds_client() {
        let config = LinkConfig::from_toml_str("[server]\nurl = \"http://127.0.0.1:9000/\"").unwrap();
        let client = config.into_builder_with_token(None).build().unwrap();
        assert_eq!(client.base_url(), "http://127.0.0.1:9000");
    }
}

use crate::error::{LinkError, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Growth of the reconnect delay over consecutive failed attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BackoffPolicy {
    /// `reconnect_delay_ms * 2^attempt`, capped at `max_reconnect_delay_ms`.
    #[default]
    Exponential,
    /// Always `reconnect_delay_ms`. The portal's browser client used a flat 5s.
    Fixed,
}

/// Reconnect behaviour and endpoint of the push channel.
///
/// Every field has a serde default, so a partial `[connection]` table is
/// enough:
///
/// ```rust
/// use smartcity_link::{BackoffPolicy, ConnectionOptions};
///
/// let like_the_browser = ConnectionOptions::default()
///     .with_reconnect_delay_ms(5000)
///     .with_backoff(BackoffPolicy::Fixed);
/// assert!(like_the_browser.validate().is_ok());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionOptions {
    /// Retry after unexpected session loss. Default true.
    pub auto_reconnect: bool,
    /// First retry delay. Default 1000.
    pub reconnect_delay_ms: u64,
    /// Ceiling for exponential backoff. Default 30000.
    pub max_reconnect_delay_ms: u64,
    pub backoff: BackoffPolicy,
    /// Raw WebSocket endpoint. The portal registers `/ws` with SockJS, so
    /// the plain transport sits at `/ws/websocket`.
    pub ws_path: String,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            auto_reconnect: true,
            reconnect_delay_ms: 1000,
            max_reconnect_delay_ms: 30_000,
            backoff: BackoffPolicy::Exponential,
            ws_path: "/ws/websocket".to_string(),
        }
    }
}

impl ConnectionOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_auto_reconnect(mut self, enabled: bool) -> Self {
        self.auto_reconnect = enabled;
        self
    }

    pub fn with_reconnect_delay_ms(mut self, delay_ms: u64) -> Self {
        self.reconnect_delay_ms = delay_ms;
        self
    }

    pub fn with_max_reconnect_delay_ms(mut self, max_delay_ms: u64) -> Self {
        self.max_reconnect_delay_ms = max_delay_ms;
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_ws_path(mut self, path: impl Into<String>) -> Self {
        self.ws_path = path.into();
        self
    }

    /// Rejects settings that would spin or never back off.
    pub fn validate(&self) -> Result<()> {
        if self.auto_reconnect && self.reconnect_delay_ms == 0 {
            return Err(LinkError::ConfigurationError(
                "reconnect_delay_ms must be positive when auto_reconnect is on".into(),
            ));
        }
        if self.backoff == BackoffPolicy::Exponential
            && self.max_reconnect_delay_ms < self.reconnect_delay_ms
        {
            return Err(LinkError::ConfigurationError(format!(
                "max_reconnect_delay_ms ({}) is below reconnect_delay_ms ({})",
                self.max_reconnect_delay_ms, self.reconnect_delay_ms
            )));
        }
        Ok(())
    }

    /// Delay before reconnect attempt `attempt`, counting from 0.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let ms = match self.backoff {
            BackoffPolicy::Fixed => self.reconnect_delay_ms,
            BackoffPolicy::Exponential => self
                .reconnect_delay_ms
                .saturating_mul(1u64 << attempt.min(20))
                .min(self.max_reconnect_delay_ms),
        };
        Duration::from_millis(ms)
    }
}

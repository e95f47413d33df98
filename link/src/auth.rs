//! Portal credentials.
//!
//! The portal issues a JWT at login. The same bearer token authorizes REST
//! snapshot fetches, the WebSocket upgrade and the STOMP CONNECT frame; the
//! last one matters behind SockJS proxies that strip upgrade headers.

use crate::error::{LinkError, Result};
use std::fmt;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::http::header::{HeaderValue, AUTHORIZATION};

/// Credentials presented to the portal.
///
/// ```rust
/// use smartcity_link::AuthProvider;
///
/// let owner = AuthProvider::jwt_token("eyJhbGc...");
/// assert!(owner.is_authenticated());
/// // The token never shows up in logs.
/// assert_eq!(format!("{:?}", owner), "JwtToken(<redacted>)");
///
/// // Visitors browsing approved businesses need no login.
/// assert!(!AuthProvider::none().is_authenticated());
/// ```
#[derive(Clone, Default, PartialEq, Eq)]
pub enum AuthProvider {
    JwtToken(String),
    #[default]
    None,
}

impl fmt::Debug for AuthProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::JwtToken(_) => f.write_str("JwtToken(<redacted>)"),
            Self::None => f.write_str("None"),
        }
    }
}

impl AuthProvider {
    pub fn jwt_token(token: impl Into<String>) -> Self {
        Self::JwtToken(token.into())
    }

    pub fn none() -> Self {
        Self::None
    }

    pub fn is_authenticated(&self) -> bool {
        matches!(self, Self::JwtToken(_))
    }

    /// `Bearer <token>`, or `None` for anonymous access.
    pub fn bearer(&self) -> Option<String> {
        match self {
            Self::JwtToken(token) => Some(format!("Bearer {}", token)),
            Self::None => None,
        }
    }

    /// Add the `Authorization` header to a snapshot request.
    pub fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match self {
            Self::JwtToken(token) => request.bearer_auth(token),
            Self::None => request,
        }
    }

    /// Add the `Authorization` header to the WebSocket upgrade.
    ///
    /// Fails when the token holds bytes that are not legal in a header.
    pub fn apply_ws_headers(&self, request: &mut Request) -> Result<()> {
        let Some(bearer) = self.bearer() else {
            return Ok(());
        };
        let value = HeaderValue::from_str(&bearer)
            .map_err(|e| LinkError::ConfigurationError(format!("Invalid JWT token header: {}", e)))?;
        request.headers_mut().insert(AUTHORIZATION, value);
        Ok(())
    }

    /// Headers added to the STOMP CONNECT frame.
    pub fn stomp_headers(&self) -> Vec<(String, String)> {
        self.bearer()
            .map(|bearer| vec![("Authorization".to_string(), bearer)])
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_tungstenite::tungstenite::client::IntoClientRequest;

    fn upgrade_request() -> Request {
        "ws://localhost:8081/ws/websocket".into_client_request().unwrap()
    }

    #[test]
    fn test_default_is_anonymous() {
        assert_eq!(AuthProvider::default(), AuthProvider::None);
        assert_eq!(AuthProvider::none().bearer(), None);
        assert_eq!(AuthProvider::jwt_token("t").bearer().as_deref(), Some("Bearer t"));
    }

    #[test]
    fn test_ws_upgrade_carries_bearer_token() {
        let mut request = upgrade_request();
        AuthProvider::jwt_token("abc.def.ghi")
            .apply_ws_headers(&mut request)
            .unwrap();
        assert_eq!(request.headers().get(AUTHORIZATION).unwrap(), "Bearer abc.def.ghi");
    }

    #[test]
    fn test_anonymous_adds_no_headers() {
        let auth = AuthProvider::none();
        let mut request = upgrade_request();
        auth.apply_ws_headers(&mut request).unwrap();
        assert!(request.headers().get(AUTHORIZATION).is_none());
        assert!(auth.stomp_headers().is_empty());
    }

    #[test]
    fn test_token_with_newline_is_rejected_for_upgrade() {
        let mut request = upgrade_request();
        let err = AuthProvider::jwt_token("abc\ndef")
            .apply_ws_headers(&mut request)
            .unwrap_err();
        assert!(matches!(err, LinkError::ConfigurationError(_)));
    }

    #[test]
    fn test_snapshot_request_gets_bearer() {
        let request = AuthProvider::jwt_token("tok")
            .authorize(reqwest::Client::new().get("http://localhost:8081/api/requests/my"))
            .build()
            .unwrap();
        assert_eq!(request.headers().get("authorization").unwrap(), "Bearer tok");
    }

    #[test]
    fn test_debug_redacts_token() {
        let rendered = format!("{:?}", AuthProvider::jwt_token("secret-jwt"));
        assert!(!rendered.contains("secret-jwt"));
    }
}

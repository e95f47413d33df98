//! Push transport abstraction and its WebSocket implementation.
//!
//! The connection task only talks to a [`Transport`]; production code gets
//! one from [`WsConnector`] and tests plug in an in-memory connector.

use crate::{
    auth::AuthProvider,
    error::{ConnectionError, LinkError, Result},
    models::ConnectionOptions,
};
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::{
    self, client::IntoClientRequest, protocol::frame::coding::CloseCode, protocol::CloseFrame,
    protocol::Message,
};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use url::Url;

/// Maximum text message size (16 MiB).
pub(crate) const MAX_WS_TEXT_MESSAGE_BYTES: usize = 16 << 20;

/// A transport-level message, independent of the WebSocket library.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireMessage {
    Text(String),
    Binary(Vec<u8>),
    Ping(Vec<u8>),
    Pong(Vec<u8>),
    Close(Option<(u16, String)>),
}

/// One open duplex connection.
#[async_trait]
pub trait Transport: Send {
    async fn send(&mut self, msg: WireMessage) -> Result<()>;

    /// Next inbound message; `None` once the stream has ended.
    ///
    /// Must be cancel-safe: the connection task polls it inside `select!`.
    async fn next(&mut self) -> Option<Result<WireMessage>>;

    async fn close(&mut self);
}

/// Opens transports. Called once per (re)connect attempt.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(
        &self,
        auth: &AuthProvider,
    ) -> std::result::Result<Box<dyn Transport>, ConnectionError>;
}

/// Derive the WebSocket URL from the portal's HTTP base URL.
///
/// `http` maps to `ws`, `https` to `wss`, and `ws_path` replaces the path.
pub fn resolve_ws_url(base_url: &str, ws_path: &str) -> Result<String> {
    let base = Url::parse(base_url.trim()).map_err(|e| {
        LinkError::ConfigurationError(format!("Invalid base_url '{}': {}", base_url, e))
    })?;

    let ws_scheme = match base.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => {
            return Err(LinkError::ConfigurationError(format!(
                "Unsupported base_url scheme '{}'; expected http(s) or ws(s)",
                other
            )));
        },
    };
    if base.host_str().is_none() {
        return Err(LinkError::ConfigurationError(format!(
            "base_url '{}' has no host",
            base_url
        )));
    }

    let mut ws_url = base.clone();
    ws_url
        .set_scheme(ws_scheme)
        .map_err(|_| LinkError::ConfigurationError("Failed to set WebSocket scheme".into()))?;

    let prefix = base.path().trim_end_matches('/');
    let suffix = if ws_path.starts_with('/') {
        ws_path.to_string()
    } else {
        format!("/{}", ws_path)
    };
    ws_url.set_path(&format!("{}{}", prefix, suffix));
    ws_url.set_query(None);
    ws_url.set_fragment(None);
    Ok(ws_url.to_string())
}

/// [`Connector`] backed by tokio-tungstenite.
#[derive(Debug, Clone)]
pub struct WsConnector {
    url: String,
}

impl WsConnector {
    pub fn new(base_url: &str, options: &ConnectionOptions) -> Result<Self> {
        Ok(Self {
            url: resolve_ws_url(base_url, &options.ws_path)?,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn connect(
        &self,
        auth: &AuthProvider,
    ) -> std::result::Result<Box<dyn Transport>, ConnectionError> {
        log::debug!("[smartcity-link] Opening WebSocket to {}", self.url);
        let mut request = self.url.as_str().into_client_request().map_err(|e| {
            ConnectionError::new(format!("Failed to build WebSocket request: {}", e), false)
        })?;
        auth.apply_ws_headers(&mut request)
            .map_err(|e| ConnectionError::new(e.to_string(), false))?;

        match tokio_tungstenite::connect_async(request).await {
            Ok((stream, _)) => Ok(Box::new(WsTransport { stream })),
            Err(tungstenite::Error::Http(response)) => {
                let message = match response.status().as_u16() {
                    401 => "Unauthorized: WebSocket requires valid credentials".to_string(),
                    403 => "Forbidden: Access to WebSocket denied".to_string(),
                    code => format!("WebSocket HTTP error: {}", code),
                };
                // A 5xx may be a restarting server; auth failures will not fix themselves.
                let recoverable = response.status().is_server_error();
                Err(ConnectionError::new(message, recoverable))
            },
            Err(e) => Err(ConnectionError::new(format!("Connection failed: {}", e), true)),
        }
    }
}

struct WsTransport {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl Transport for WsTransport {
    async fn send(&mut self, msg: WireMessage) -> Result<()> {
        let msg = match msg {
            WireMessage::Text(text) => Message::Text(text.into()),
            WireMessage::Binary(data) => Message::Binary(Bytes::from(data)),
            WireMessage::Ping(data) => Message::Ping(Bytes::from(data)),
            WireMessage::Pong(data) => Message::Pong(Bytes::from(data)),
            WireMessage::Close(frame) => Message::Close(frame.map(|(code, reason)| CloseFrame {
                code: CloseCode::from(code),
                reason: reason.into(),
            })),
        };
        self.stream
            .send(msg)
            .await
            .map_err(|e| LinkError::WebSocketError(format!("Failed to send frame: {}", e)))
    }

    async fn next(&mut self) -> Option<Result<WireMessage>> {
        loop {
            let msg = match self.stream.next().await? {
                Ok(msg) => msg,
                Err(e) => return Some(Err(LinkError::WebSocketError(e.to_string()))),
            };
            let wire = match msg {
                Message::Text(text) => {
                    if text.len() > MAX_WS_TEXT_MESSAGE_BYTES {
                        log::warn!(
                            "[smartcity-link] Dropping oversized text message ({} bytes)",
                            text.len()
                        );
                        continue;
                    }
                    WireMessage::Text(text.as_str().to_owned())
                },
                Message::Binary(data) => WireMessage::Binary(data.to_vec()),
                Message::Ping(data) => WireMessage::Ping(data.to_vec()),
                Message::Pong(data) => WireMessage::Pong(data.to_vec()),
                Message::Close(frame) => WireMessage::Close(
                    frame.map(|f| (u16::from(f.code), f.reason.as_str().to_owned())),
                ),
                Message::Frame(_) => continue,
            };
            return Some(Ok(wire));
        }
    }

    async fn close(&mut self) {
        let _ = self.stream.close(None).await;
    }
}

//! Push connection management.
//!
//! This module contains:
//! - [`websocket`]: transport traits, URL resolution and the tokio-tungstenite
//!   connector
//! - [`shared`]: the connection task that owns the transport, the STOMP
//!   session and the topic broker, with auto-reconnect

pub mod shared;
pub mod websocket;

pub use shared::ConnectionManager;
pub(crate) use shared::ConnCmd;
pub use websocket::{resolve_ws_url, Connector, Transport, WireMessage, WsConnector};

/// A duration far enough in the future (~100 years) to act as "never" for
/// deadline calculations without overflowing `Instant::now() + dur`.
pub(crate) const FAR_FUTURE: std::time::Duration =
    std::time::Duration::from_secs(100 * 365 * 24 * 3600);

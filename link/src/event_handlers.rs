//! Lifecycle hooks for the push connection.
//!
//! Hooks run on the connection task between frames. Keep them short: a slow
//! hook delays keepalive and message routing for every topic.
//!
//! ```rust
//! use smartcity_link::EventHandlers;
//!
//! let handlers = EventHandlers::new()
//!     .on_connect(|| println!("portal push channel up"))
//!     .on_disconnect(|reason| match reason.reconnect_in {
//!         Some(delay) => println!("{}; retrying in {:?}", reason, delay),
//!         None => println!("{}", reason),
//!     })
//!     .on_error(|error| eprintln!("push channel error: {}", error));
//! assert!(handlers.has_any());
//! ```

use crate::error::ConnectionError;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Why the push session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisconnectReason {
    pub message: String,
    /// WebSocket close code sent by the server, if the socket closed cleanly.
    pub code: Option<u16>,
    /// `true` when `disconnect()` ended the session.
    pub by_client: bool,
    /// Delay until the next connection attempt, when one is armed.
    pub reconnect_in: Option<Duration>,
}

impl DisconnectReason {
    /// Session lost on the transport side.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: None,
            by_client: false,
            reconnect_in: None,
        }
    }

    /// Session closed by the server with a WebSocket close code.
    pub fn with_code(message: impl Into<String>, code: u16) -> Self {
        Self {
            code: Some(code),
            ..Self::new(message)
        }
    }

    /// Session ended by the local `disconnect()` call.
    pub fn client(message: impl Into<String>) -> Self {
        Self {
            by_client: true,
            ..Self::new(message)
        }
    }

    pub(crate) fn reconnecting_in(mut self, delay: Option<Duration>) -> Self {
        self.reconnect_in = delay;
        self
    }
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.code {
            Some(code) => write!(f, "{} (code: {})", self.message, code),
            None => f.write_str(&self.message),
        }
    }
}

type Hook<A> = Arc<dyn Fn(A) + Send + Sync>;
type RawHook = Arc<dyn Fn(&str) + Send + Sync>;

/// Optional callbacks fired by the connection task.
///
/// `on_receive` and `on_send` see every raw STOMP text frame and are meant
/// for debugging only.
#[derive(Clone, Default)]
pub struct EventHandlers {
    connect: Option<Arc<dyn Fn() + Send + Sync>>,
    disconnect: Option<Hook<DisconnectReason>>,
    error: Option<Hook<ConnectionError>>,
    receive: Option<RawHook>,
    send: Option<RawHook>,
}

impl fmt::Debug for EventHandlers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventHandlers")
            .field("on_connect", &self.connect.is_some())
            .field("on_disconnect", &self.disconnect.is_some())
            .field("on_error", &self.error.is_some())
            .field("on_receive", &self.receive.is_some())
            .field("on_send", &self.send.is_some())
            .finish()
    }
}

impl EventHandlers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fired after CONNECTED is received, before topics are re-subscribed.
    pub fn on_connect(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.connect = Some(Arc::new(f));
        self
    }

    /// Fired whenever a live session ends, including explicit disconnects.
    pub fn on_disconnect(mut self, f: impl Fn(DisconnectReason) + Send + Sync + 'static) -> Self {
        self.disconnect = Some(Arc::new(f));
        self
    }

    /// Fired for failed connection attempts and handshake errors.
    pub fn on_error(mut self, f: impl Fn(ConnectionError) + Send + Sync + 'static) -> Self {
        self.error = Some(Arc::new(f));
        self
    }

    pub fn on_receive(mut self, f: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.receive = Some(Arc::new(f));
        self
    }

    pub fn on_send(mut self, f: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.send = Some(Arc::new(f));
        self
    }

    pub fn has_any(&self) -> bool {
        self.connect.is_some()
            || self.disconnect.is_some()
            || self.error.is_some()
            || self.receive.is_some()
            || self.send.is_some()
    }

    pub(crate) fn emit_connect(&self) {
        if let Some(hook) = &self.connect {
            hook();
        }
    }

    pub(crate) fn emit_disconnect(&self, reason: DisconnectReason) {
        if let Some(hook) = &self.disconnect {
            hook(reason);
        }
    }

    pub(crate) fn emit_error(&self, error: ConnectionError) {
        if let Some(hook) = &self.error {
            hook(error);
        }
    }

    pub(crate) fn emit_receive(&self, raw: &str) {
        if let Some(hook) = &self.receive {
            hook(raw);
        }
    }

    pub(crate) fn emit_send(&self, raw: &str) {
        if let Some(hook) = &self.send {
            hook(raw);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_emit_without_hooks_is_noop() {
        let handlers = EventHandlers::new();
        assert!(!handlers.has_any());
        handlers.emit_connect();
        handlers.emit_disconnect(DisconnectReason::new("gone"));
        handlers.emit_error(ConnectionError::new("boom", true));
        handlers.emit_receive("CONNECTED\n\n\0");
    }

    #[test]
    fn test_hooks_fire_per_emit() {
        let connects = Arc::new(AtomicUsize::new(0));
        let errors = Arc::new(AtomicUsize::new(0));
        let c = connects.clone();
        let e = errors.clone();

        let handlers = EventHandlers::new()
            .on_connect(move || {
                c.fetch_add(1, Ordering::SeqCst);
            })
            .on_error(move |err| {
                assert!(err.recoverable);
                e.fetch_add(1, Ordering::SeqCst);
            });

        handlers.emit_connect();
        handlers.emit_connect();
        handlers.emit_error(ConnectionError::new("Connection refused", true));

        assert_eq!(connects.load(Ordering::SeqCst), 2);
        assert_eq!(errors.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_disconnect_reason_variants() {
        let lost = DisconnectReason::new("WebSocket stream ended")
            .reconnecting_in(Some(Duration::from_secs(2)));
        assert!(!lost.by_client);
        assert_eq!(lost.reconnect_in, Some(Duration::from_secs(2)));
        assert_eq!(lost.to_string(), "WebSocket stream ended");

        let closed = DisconnectReason::with_code("Going away", 1001);
        assert_eq!(closed.to_string(), "Going away (code: 1001)");

        let explicit = DisconnectReason::client("Disconnected by client");
        assert!(explicit.by_client);
        assert_eq!(explicit.reconnect_in, None);
    }

    #[test]
    fn test_debug_lists_registered_hooks() {
        let rendered = format!("{:?}", EventHandlers::new().on_send(|_| {}));
        assert!(rendered.contains("on_send: true"));
        assert!(rendered.contains("on_connect: false"));
    }
}

//! Shared push connection for live collections.
//!
//! One background task owns the transport, the STOMP session and the
//! [`TopicSubscriptionBroker`]. The public [`ConnectionManager`] only sends
//! commands to it. The task handles:
//!
//! - Connection state transitions, published on a watch and a broadcast channel
//! - Automatic reconnection with exponential or fixed backoff
//! - Re-subscription of every topic after each reconnect, in subscribe order
//! - Routing of MESSAGE frames to per-topic handlers
//! - Keepalive pings and pong timeouts
//! - Connection lifecycle events (`on_connect`, `on_disconnect`, `on_error`)

use crate::{
    auth::AuthProvider,
    connection::{Connector, Transport, WireMessage, FAR_FUTURE},
    error::{ConnectionError, LinkError, Result, SubscriptionError},
    event_handlers::{DisconnectReason, EventHandlers},
    models::{ConnectionOptions, ConnectionState, DeltaEvent, StateTransition},
    stomp::{decode_frames, decode_frames_partial, StompCommand, StompFrame},
    subscription::{
        SubscriptionHandle, SubscriptionStatus, TopicHandler, TopicInfo,
        TopicSubscriptionBroker,
    },
    timeouts::LinkTimeouts,
};
use chrono::Utc;
use std::sync::{
    atomic::{AtomicU32, AtomicU64, Ordering},
    Arc,
};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant as TokioInstant;

const STATE_CHANNEL_CAPACITY: usize = 64;

/// Current time in millis since Unix epoch.
#[inline]
fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

// ── Commands ────────────────────────────────────────────────────────────────

/// Commands sent from the public API to the background connection task.
pub(crate) enum ConnCmd {
    Connect,
    Disconnect {
        ack: oneshot::Sender<()>,
    },
    Subscribe {
        topic: String,
        handler: TopicHandler,
        result_tx: oneshot::Sender<(u64, watch::Receiver<SubscriptionStatus>)>,
    },
    Cancel {
        topic: String,
        generation: u64,
    },
    ActiveTopics {
        result_tx: oneshot::Sender<Vec<TopicInfo>>,
    },
    Shutdown,
}

// ── ConnectionManager (public handle) ───────────────────────────────────────

/// Owner of the single push connection.
///
/// Cheap to share behind an `Arc`. All methods are non-blocking; the
/// connection itself lives on a background task spawned by
/// [`spawn`](Self::spawn).
pub struct ConnectionManager {
    cmd_tx: mpsc::UnboundedSender<ConnCmd>,
    state_rx: watch::Receiver<ConnectionState>,
    transitions: broadcast::Sender<StateTransition>,
    reconnect_attempts: Arc<AtomicU32>,
    malformed_events: Arc<AtomicU64>,
    subscribe_timeout: Duration,
    _task: JoinHandle<()>,
}

impl ConnectionManager {
    /// Start the connection task. Must be called inside a tokio runtime.
    ///
    /// The task starts idle; nothing is opened until [`connect`](Self::connect).
    pub fn spawn(
        connector: Arc<dyn Connector>,
        auth: AuthProvider,
        stomp_host: String,
        options: ConnectionOptions,
        timeouts: LinkTimeouts,
        handlers: EventHandlers,
    ) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let (transitions, _) = broadcast::channel(STATE_CHANNEL_CAPACITY);
        let reconnect_attempts = Arc::new(AtomicU32::new(0));
        let malformed_events = Arc::new(AtomicU64::new(0));
        let subscribe_timeout = timeouts.subscribe_timeout;

        let task = ConnectionTask {
            cmd_rx,
            connector,
            auth,
            stomp_host,
            options,
            timeouts,
            handlers,
            broker: TopicSubscriptionBroker::new(),
            state_tx,
            transitions: transitions.clone(),
            reconnect_attempts: reconnect_attempts.clone(),
            malformed_events: malformed_events.clone(),
            want_connected: false,
        };
        let handle = tokio::spawn(task.run());

        Self {
            cmd_tx,
            state_rx,
            transitions,
            reconnect_attempts,
            malformed_events,
            subscribe_timeout,
            _task: handle,
        }
    }

    /// Begin connecting. A no-op while connecting or connected.
    pub fn connect(&self) -> Result<()> {
        self.cmd_tx
            .send(ConnCmd::Connect)
            .map_err(|_| LinkError::InternalError("connection task is not running".into()))
    }

    /// Close the connection and stop reconnecting.
    ///
    /// Subscriptions stay registered and are re-issued on the next
    /// [`connect`](Self::connect).
    pub async fn disconnect(&self) -> Result<()> {
        let (ack, ack_rx) = oneshot::channel();
        self.cmd_tx
            .send(ConnCmd::Disconnect { ack })
            .map_err(|_| LinkError::InternalError("connection task is not running".into()))?;
        ack_rx
            .await
            .map_err(|_| LinkError::InternalError("connection task stopped".into()))
    }

    pub fn current_state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.current_state().is_connected()
    }

    /// Stream of state transitions from now on.
    pub fn on_state_change(&self) -> broadcast::Receiver<StateTransition> {
        self.transitions.subscribe()
    }

    /// Latest-value view of the connection state.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    /// Wait until the connection reaches `state`.
    pub async fn wait_for(&self, state: ConnectionState) -> Result<()> {
        let mut rx = self.state_rx.clone();
        rx.wait_for(|s| *s == state)
            .await
            .map(|_| ())
            .map_err(|_| LinkError::InternalError("connection task stopped".into()))
    }

    /// Subscribe `handler` to `topic`.
    ///
    /// Works in any state: while disconnected the request is queued and
    /// flushed on the next successful connect.
    pub async fn subscribe<F>(&self, topic: impl Into<String>, handler: F) -> Result<SubscriptionHandle>
    where
        F: Fn(&DeltaEvent) + Send + Sync + 'static,
    {
        self.subscribe_with(topic.into(), Arc::new(handler)).await
    }

    pub(crate) async fn subscribe_with(
        &self,
        topic: String,
        handler: TopicHandler,
    ) -> Result<SubscriptionHandle> {
        if topic.trim().is_empty() {
            return Err(LinkError::ConfigurationError("topic must not be empty".into()));
        }
        let (result_tx, result_rx) = oneshot::channel();
        self.cmd_tx
            .send(ConnCmd::Subscribe {
                topic: topic.clone(),
                handler,
                result_tx,
            })
            .map_err(|_| SubscriptionError::Closed)?;
        let (generation, status_rx) = result_rx.await.map_err(|_| SubscriptionError::Closed)?;
        Ok(SubscriptionHandle::new(
            topic,
            generation,
            self.cmd_tx.clone(),
            status_rx,
            self.subscribe_timeout,
        ))
    }

    /// Registered topics in subscribe order.
    pub async fn active_topics(&self) -> Vec<TopicInfo> {
        let (result_tx, result_rx) = oneshot::channel();
        if self.cmd_tx.send(ConnCmd::ActiveTopics { result_tx }).is_err() {
            return Vec::new();
        }
        result_rx.await.unwrap_or_default()
    }

    /// Consecutive failed (re)connect attempts since the last success.
    pub fn reconnect_attempts(&self) -> u32 {
        self.reconnect_attempts.load(Ordering::Relaxed)
    }

    /// Pushed messages dropped because they failed validation.
    pub fn malformed_events(&self) -> u64 {
        self.malformed_events.load(Ordering::Relaxed)
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        let _ = self.cmd_tx.send(ConnCmd::Shutdown);
    }
}

// ── Background connection task ──────────────────────────────────────────────

enum Link {
    Idle,
    Backoff(TokioInstant),
    Live(Box<dyn Transport>),
    Closed,
}

struct ConnectionTask {
    cmd_rx: mpsc::UnboundedReceiver<ConnCmd>,
    connector: Arc<dyn Connector>,
    auth: AuthProvider,
    stomp_host: String,
    options: ConnectionOptions,
    timeouts: LinkTimeouts,
    handlers: EventHandlers,
    broker: TopicSubscriptionBroker,
    state_tx: watch::Sender<ConnectionState>,
    transitions: broadcast::Sender<StateTransition>,
    reconnect_attempts: Arc<AtomicU32>,
    malformed_events: Arc<AtomicU64>,
    /// Cleared by `disconnect()`; reconnects only happen while set.
    want_connected: bool,
}

/// What an offline command asks the task to do next.
enum Offline {
    Stay,
    Connect,
    Disconnected,
    Shutdown,
}

impl ConnectionTask {
    async fn run(mut self) {
        let mut link = Link::Idle;
        loop {
            link = match link {
                Link::Idle => match self.cmd_rx.recv().await {
                    Some(cmd) => match self.handle_offline(cmd) {
                        Offline::Stay | Offline::Disconnected => Link::Idle,
                        Offline::Connect => self.establish().await,
                        Offline::Shutdown => Link::Closed,
                    },
                    None => Link::Closed,
                },
                Link::Backoff(deadline) => self.wait_backoff(deadline).await,
                Link::Live(transport) => self.run_live(transport).await,
                Link::Closed => {
                    self.broker.on_disconnected();
                    self.set_state(ConnectionState::Disconnected);
                    log::debug!("[smartcity-link] Connection task stopped");
                    return;
                },
            };
        }
    }

    /// Commands while no transport is open. Subscriptions queue up in the broker.
    fn handle_offline(&mut self, cmd: ConnCmd) -> Offline {
        match cmd {
            ConnCmd::Connect => {
                self.want_connected = true;
                Offline::Connect
            },
            ConnCmd::Disconnect { ack } => {
                self.want_connected = false;
                self.set_state(ConnectionState::Disconnected);
                let _ = ack.send(());
                Offline::Disconnected
            },
            ConnCmd::Shutdown => Offline::Shutdown,
            other => {
                self.handle_bookkeeping(other);
                Offline::Stay
            },
        }
    }

    /// Subscribe/Cancel/ActiveTopics while no frames can be sent.
    fn handle_bookkeeping(&mut self, cmd: ConnCmd) {
        match cmd {
            ConnCmd::Subscribe {
                topic,
                handler,
                result_tx,
            } => {
                let (generation, status_rx, _) = self.broker.subscribe(&topic, handler, now_ms());
                let _ = result_tx.send((generation, status_rx));
            },
            ConnCmd::Cancel { topic, generation } => {
                let _ = self.broker.cancel(&topic, generation);
            },
            ConnCmd::ActiveTopics { result_tx } => {
                let _ = result_tx.send(self.broker.active_topics());
            },
            ConnCmd::Connect | ConnCmd::Disconnect { .. } | ConnCmd::Shutdown => {},
        }
    }

    async fn wait_backoff(&mut self, deadline: TokioInstant) -> Link {
        let sleep = tokio::time::sleep_until(deadline);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                biased;
                cmd = self.cmd_rx.recv() => {
                    let Some(cmd) = cmd else { return Link::Closed };
                    match self.handle_offline(cmd) {
                        Offline::Stay => {},
                        Offline::Connect => return self.establish().await,
                        Offline::Disconnected => {
                            log::info!("[smartcity-link] Reconnect cancelled by disconnect()");
                            return Link::Idle;
                        },
                        Offline::Shutdown => return Link::Closed,
                    }
                }
                _ = &mut sleep => return self.establish().await,
            }
        }
    }

    /// Open the transport and run the STOMP handshake while still serving commands.
    async fn establish(&mut self) -> Link {
        self.set_state(ConnectionState::Connecting);
        let attempt = open_session(
            self.connector.clone(),
            self.auth.clone(),
            self.stomp_host.clone(),
            self.timeouts.clone(),
            self.handlers.clone(),
        );
        tokio::pin!(attempt);

        let outcome = loop {
            tokio::select! {
                biased;
                cmd = self.cmd_rx.recv() => match cmd {
                    Some(ConnCmd::Connect) => {
                        log::debug!("[smartcity-link] connect() ignored: already connecting");
                    },
                    Some(ConnCmd::Disconnect { ack }) => {
                        self.want_connected = false;
                        self.set_state(ConnectionState::Disconnected);
                        let _ = ack.send(());
                        return Link::Idle;
                    },
                    Some(ConnCmd::Shutdown) | None => return Link::Closed,
                    Some(other) => self.handle_bookkeeping(other),
                },
                result = &mut attempt => break result,
            }
        };

        match outcome {
            Ok(transport) => self.on_session_open(transport).await,
            Err(e) => {
                log::warn!("[smartcity-link] Connection attempt failed: {}", e);
                self.handlers.emit_error(e);
                self.set_state(ConnectionState::Disconnected);
                self.schedule_reconnect()
            },
        }
    }

    async fn on_session_open(&mut self, mut transport: Box<dyn Transport>) -> Link {
        let was_retry = self.reconnect_attempts.swap(0, Ordering::SeqCst) > 0;
        if was_retry {
            log::info!("[smartcity-link] Reconnection successful");
        } else {
            log::info!("[smartcity-link] Connected");
        }
        self.set_state(ConnectionState::Connected);
        self.handlers.emit_connect();

        let frames = self.broker.on_connected();
        if !frames.is_empty() {
            log::info!(
                "[smartcity-link] Re-subscribing {} topic(s) after connect",
                frames.len()
            );
        }
        for frame in frames {
            if let Err(e) = self.send_frame(&mut *transport, &frame).await {
                return self.lost(DisconnectReason::new(format!("Failed to subscribe: {}", e)));
            }
        }
        Link::Live(transport)
    }

    async fn run_live(&mut self, mut transport: Box<dyn Transport>) -> Link {
        let heartbeat = self.timeouts.heartbeat();
        let has_keepalive = heartbeat.is_some();
        let keepalive_dur = heartbeat.map_or(FAR_FUTURE, |hb| hb.ping_after);
        let pong_timeout = heartbeat.and_then(|hb| hb.pong_within);
        let has_pong_timeout = pong_timeout.is_some();
        let pong_timeout_dur = pong_timeout.unwrap_or(FAR_FUTURE);

        let mut idle_deadline = TokioInstant::now() + keepalive_dur;
        let mut awaiting_pong = false;
        let mut pong_deadline = TokioInstant::now() + FAR_FUTURE;

        loop {
            let idle_sleep = tokio::time::sleep_until(idle_deadline);
            tokio::pin!(idle_sleep);

            let pong_sleep = tokio::time::sleep_until(pong_deadline);
            tokio::pin!(pong_sleep);

            tokio::select! {
                biased;

                _ = &mut pong_sleep, if has_pong_timeout && awaiting_pong => {
                    log::warn!(
                        "[smartcity-link] Pong timeout ({:?}): server unresponsive",
                        pong_timeout_dur,
                    );
                    return self.lost(DisconnectReason::new(format!(
                        "Pong timeout ({:?}): server unresponsive",
                        pong_timeout_dur,
                    )));
                }

                cmd = self.cmd_rx.recv() => {
                    match cmd {
                        Some(ConnCmd::Connect) => {
                            log::debug!("[smartcity-link] connect() ignored: already connected");
                        },
                        Some(ConnCmd::Disconnect { ack }) => {
                            self.want_connected = false;
                            self.close_session(&mut *transport, "Client disconnected").await;
                            let _ = ack.send(());
                            return Link::Idle;
                        },
                        Some(ConnCmd::Subscribe { topic, handler, result_tx }) => {
                            let (generation, status_rx, frame) =
                                self.broker.subscribe(&topic, handler, now_ms());
                            let _ = result_tx.send((generation, status_rx));
                            if let Some(frame) = frame {
                                if let Err(e) = self.send_frame(&mut *transport, &frame).await {
                                    return self.lost(DisconnectReason::new(format!(
                                        "Failed to send SUBSCRIBE: {}", e
                                    )));
                                }
                            }
                        },
                        Some(ConnCmd::Cancel { topic, generation }) => {
                            if let Some(frame) = self.broker.cancel(&topic, generation) {
                                if let Err(e) = self.send_frame(&mut *transport, &frame).await {
                                    return self.lost(DisconnectReason::new(format!(
                                        "Failed to send UNSUBSCRIBE: {}", e
                                    )));
                                }
                            }
                        },
                        Some(ConnCmd::ActiveTopics { result_tx }) => {
                            let _ = result_tx.send(self.broker.active_topics());
                        },
                        Some(ConnCmd::Shutdown) | None => {
                            self.close_session(&mut *transport, "Client shut down").await;
                            return Link::Closed;
                        },
                    }
                }

                _ = &mut idle_sleep, if has_keepalive && !awaiting_pong => {
                    if let Err(e) = transport.send(WireMessage::Ping(Vec::new())).await {
                        log::warn!("[smartcity-link] Keepalive ping failed: {}", e);
                        return self.lost(DisconnectReason::new(format!(
                            "Keepalive ping failed: {}", e
                        )));
                    }
                    self.handlers.emit_send("[ping]");
                    if has_pong_timeout {
                        awaiting_pong = true;
                        pong_deadline = TokioInstant::now() + pong_timeout_dur;
                    }
                    idle_deadline = TokioInstant::now() + keepalive_dur;
                }

                msg = transport.next() => {
                    // Any inbound traffic proves liveness.
                    idle_deadline = TokioInstant::now() + keepalive_dur;
                    if awaiting_pong {
                        awaiting_pong = false;
                        pong_deadline = TokioInstant::now() + FAR_FUTURE;
                    }

                    match msg {
                        Some(Ok(WireMessage::Text(text))) => {
                            if let Some(reason) = self.handle_text(&text) {
                                return self.lost(reason);
                            }
                        },
                        Some(Ok(WireMessage::Binary(data))) => match String::from_utf8(data) {
                            Ok(text) => {
                                if let Some(reason) = self.handle_text(&text) {
                                    return self.lost(reason);
                                }
                            },
                            Err(_) => log::warn!("[smartcity-link] Ignoring non UTF-8 binary frame"),
                        },
                        Some(Ok(WireMessage::Ping(payload))) => {
                            if let Err(e) = transport.send(WireMessage::Pong(payload)).await {
                                return self.lost(DisconnectReason::new(format!(
                                    "Failed to answer ping: {}", e
                                )));
                            }
                        },
                        Some(Ok(WireMessage::Pong(_))) => {
                            log::debug!("[smartcity-link] Keepalive: received Pong");
                        },
                        Some(Ok(WireMessage::Close(frame))) => {
                            let reason = match frame {
                                Some((code, reason)) => DisconnectReason::with_code(reason, code),
                                None => DisconnectReason::new("Server closed connection"),
                            };
                            return self.lost(reason);
                        },
                        Some(Err(e)) => {
                            let msg = e.to_string();
                            self.handlers.emit_error(ConnectionError::new(&msg, true));
                            return self.lost(DisconnectReason::new(format!(
                                "WebSocket error: {}", msg
                            )));
                        },
                        None => {
                            return self.lost(DisconnectReason::new("WebSocket stream ended"));
                        },
                    }
                }
            }
        }
    }

    /// Process one inbound text message. Returns a reason when the session
    /// must be torn down.
    fn handle_text(&mut self, text: &str) -> Option<DisconnectReason> {
        self.handlers.emit_receive(text);
        let (frames, tail_error) = decode_frames_partial(text);
        if let Some(e) = tail_error {
            log::warn!(
                "[smartcity-link] Failed to parse STOMP frame ({} earlier frame(s) kept): {}",
                frames.len(),
                e
            );
        }

        for frame in frames {
            match frame.command {
                StompCommand::Message => self.route_message(&frame),
                StompCommand::Receipt => {
                    if let Some(id) = frame.get("receipt-id") {
                        if !self.broker.on_receipt(id) {
                            log::debug!("[smartcity-link] Unmatched receipt '{}'", id);
                        }
                    }
                },
                StompCommand::Error => {
                    if let Some(err) = self.broker.on_error(&frame) {
                        log::warn!("[smartcity-link] {}", err);
                        continue;
                    }
                    let message = frame
                        .get("message")
                        .map(str::to_string)
                        .unwrap_or_else(|| frame.body.trim().to_string());
                    let message = format!("Broker error: {}", message);
                    log::warn!("[smartcity-link] {}", message);
                    self.handlers.emit_error(ConnectionError::new(&message, true));
                    return Some(DisconnectReason::new(message));
                },
                other => {
                    log::debug!("[smartcity-link] Ignoring unexpected {} frame", other);
                },
            }
        }
        None
    }

    fn route_message(&mut self, frame: &StompFrame) {
        let delivered = self.broker.deliver(
            frame.get("subscription"),
            frame.get("destination"),
            &frame.body,
            Utc::now(),
        );
        match delivered {
            Ok(true) => {},
            Ok(false) => log::debug!(
                "[smartcity-link] No subscription for MESSAGE to {:?}",
                frame.get("destination")
            ),
            Err(e) => {
                self.malformed_events.fetch_add(1, Ordering::Relaxed);
                log::warn!("[smartcity-link] Dropping malformed event: {}", e);
            },
        }
    }

    async fn send_frame(&mut self, transport: &mut dyn Transport, frame: &StompFrame) -> Result<()> {
        let wire = frame.encode();
        log::debug!("[smartcity-link] >> {}", frame.command);
        self.handlers.emit_send(&wire);
        transport.send(WireMessage::Text(wire)).await
    }

    /// Client-initiated close: best-effort DISCONNECT, then drop the socket.
    async fn close_session(&mut self, transport: &mut dyn Transport, reason: &str) {
        let _ = self.send_frame(transport, &StompFrame::disconnect()).await;
        transport.close().await;
        self.broker.on_disconnected();
        self.set_state(ConnectionState::Disconnected);
        self.handlers.emit_disconnect(DisconnectReason::client(reason));
    }

    /// Unexpected loss of the session. The transport is dropped by the caller.
    fn lost(&mut self, reason: DisconnectReason) -> Link {
        log::info!("[smartcity-link] Connection lost: {}", reason);
        self.broker.on_disconnected();
        self.set_state(ConnectionState::Disconnected);
        let next = self.schedule_reconnect();
        let reconnect_in = match &next {
            Link::Backoff(deadline) => Some(deadline.saturating_duration_since(TokioInstant::now())),
            _ => None,
        };
        self.handlers.emit_disconnect(reason.reconnecting_in(reconnect_in));
        next
    }

    fn schedule_reconnect(&mut self) -> Link {
        if !self.want_connected || !self.options.auto_reconnect {
            return Link::Idle;
        }
        let attempt = self.reconnect_attempts.fetch_add(1, Ordering::SeqCst);
        let delay = self.options.backoff_delay(attempt);
        log::info!(
            "[smartcity-link] Attempting reconnection in {}ms (attempt {})",
            delay.as_millis(),
            attempt + 1
        );
        Link::Backoff(TokioInstant::now() + delay)
    }

    fn set_state(&mut self, next: ConnectionState) {
        let prev = *self.state_tx.borrow();
        if prev == next {
            return;
        }
        self.state_tx.send_replace(next);
        log::debug!("[smartcity-link] State {} -> {}", prev, next);
        let _ = self.transitions.send(StateTransition {
            from: prev,
            to: next,
            at: Utc::now(),
        });
    }
}

/// Connect the transport and complete the STOMP CONNECT/CONNECTED exchange.
async fn open_session(
    connector: Arc<dyn Connector>,
    auth: AuthProvider,
    host: String,
    timeouts: LinkTimeouts,
    handlers: EventHandlers,
) -> std::result::Result<Box<dyn Transport>, ConnectionError> {
    let mut transport = if LinkTimeouts::is_no_timeout(timeouts.connection_timeout) {
        connector.connect(&auth).await?
    } else {
        tokio::time::timeout(timeouts.connection_timeout, connector.connect(&auth))
            .await
            .map_err(|_| {
                ConnectionError::new(
                    format!("Connection timeout ({:?})", timeouts.connection_timeout),
                    true,
                )
            })??
    };

    let connect = StompFrame::connect(&host, &auth).encode();
    handlers.emit_send(&connect);
    transport
        .send(WireMessage::Text(connect))
        .await
        .map_err(|e| ConnectionError::new(format!("Failed to send CONNECT: {}", e), true))?;

    if LinkTimeouts::is_no_timeout(timeouts.handshake_timeout) {
        await_connected(&mut *transport, &handlers).await?;
    } else {
        tokio::time::timeout(
            timeouts.handshake_timeout,
            await_connected(&mut *transport, &handlers),
        )
        .await
        .map_err(|_| {
            ConnectionError::new(
                format!("STOMP handshake timeout ({:?})", timeouts.handshake_timeout),
                true,
            )
        })??;
    }
    Ok(transport)
}

async fn await_connected(
    transport: &mut dyn Transport,
    handlers: &EventHandlers,
) -> std::result::Result<(), ConnectionError> {
    loop {
        match transport.next().await {
            Some(Ok(WireMessage::Text(text))) => {
                handlers.emit_receive(&text);
                let frames = decode_frames(&text)
                    .map_err(|e| ConnectionError::new(format!("Handshake failed: {}", e), true))?;
                for frame in frames {
                    match frame.command {
                        StompCommand::Connected => {
                            log::debug!(
                                "[smartcity-link] STOMP session established (version {:?})",
                                frame.get("version")
                            );
                            return Ok(());
                        },
                        StompCommand::Error => {
                            let message = frame
                                .get("message")
                                .map(str::to_string)
                                .unwrap_or_else(|| frame.body.trim().to_string());
                            return Err(ConnectionError::new(
                                format!("Handshake rejected: {}", message),
                                false,
                            ));
                        },
                        other => {
                            log::debug!("[smartcity-link] Ignoring {} before CONNECTED", other);
                        },
                    }
                }
            },
            Some(Ok(WireMessage::Ping(payload))) => {
                let _ = transport.send(WireMessage::Pong(payload)).await;
            },
            Some(Ok(WireMessage::Close(_))) | None => {
                return Err(ConnectionError::new("Connection closed during handshake", true));
            },
            Some(Ok(_)) => {},
            Some(Err(e)) => {
                return Err(ConnectionError::new(format!("Handshake failed: {}", e), true));
            },
        }
    }
}

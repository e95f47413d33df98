//! In-memory push transport for integration tests.
//!
//! [`MockConnector`] hands every accepted connection's far end to the test
//! as a [`MockPeer`], which plays the STOMP broker.

#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use smartcity_link::{
    stomp::decode_frames, AuthProvider, ConnectionError, Connector, EntityRecord, LinkError,
    LinkTimeouts, SnapshotFetcher, SnapshotLoadError, SnapshotSource, StompCommand, StompFrame,
    Transport, WireMessage,
};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

pub const BASE_URL: &str = "http://portal.test";

/// Timeouts without keepalive, so idle tests never trip the pong timer.
pub fn quiet_timeouts() -> LinkTimeouts {
    LinkTimeouts::builder()
        .keepalive_interval(Duration::ZERO)
        .pong_timeout(Duration::ZERO)
        .build()
}

pub fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

// ── Connector / transport ───────────────────────────────────────────────────

pub struct MockConnector {
    accept_tx: mpsc::UnboundedSender<MockPeer>,
    fail_next: AtomicU32,
    attempts: AtomicU32,
    seen_auth: Mutex<Vec<AuthProvider>>,
}

impl MockConnector {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<MockPeer>) {
        let (accept_tx, accept_rx) = mpsc::unbounded_channel();
        let connector = Arc::new(Self {
            accept_tx,
            fail_next: AtomicU32::new(0),
            attempts: AtomicU32::new(0),
            seen_auth: Mutex::new(Vec::new()),
        });
        (connector, accept_rx)
    }

    /// Refuse the next `n` connection attempts.
    pub fn fail_next(&self, n: u32) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn seen_auth(&self) -> Vec<AuthProvider> {
        self.seen_auth.lock().clone()
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self, auth: &AuthProvider) -> Result<Box<dyn Transport>, ConnectionError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        self.seen_auth.lock().push(auth.clone());

        let refused = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refused {
            return Err(ConnectionError::new("connection refused", true));
        }

        let (to_client, inbound) = mpsc::unbounded_channel();
        let (outbound, from_client) = mpsc::unbounded_channel();
        let _ = self.accept_tx.send(MockPeer {
            to_client,
            from_client,
            pending: VecDeque::new(),
        });
        Ok(Box::new(MockTransport { inbound, outbound }))
    }
}

struct MockTransport {
    inbound: mpsc::UnboundedReceiver<WireMessage>,
    outbound: mpsc::UnboundedSender<WireMessage>,
}

#[async_trait]
impl Transport for MockTransport {
    async fn send(&mut self, msg: WireMessage) -> smartcity_link::Result<()> {
        self.outbound
            .send(msg)
            .map_err(|_| LinkError::WebSocketError("peer went away".into()))
    }

    async fn next(&mut self) -> Option<smartcity_link::Result<WireMessage>> {
        self.inbound.recv().await.map(Ok)
    }

    async fn close(&mut self) {
        self.inbound.close();
    }
}

// ── Broker side ─────────────────────────────────────────────────────────────

pub struct MockPeer {
    to_client: mpsc::UnboundedSender<WireMessage>,
    from_client: mpsc::UnboundedReceiver<WireMessage>,
    pending: VecDeque<StompFrame>,
}

impl MockPeer {
    /// Next raw message from the client, pings included.
    pub async fn recv_raw(&mut self) -> Option<WireMessage> {
        self.from_client.recv().await
    }

    /// Next STOMP frame from the client, skipping pings, pongs and heartbeats.
    pub async fn recv_frame(&mut self) -> Option<StompFrame> {
        loop {
            if let Some(frame) = self.pending.pop_front() {
                return Some(frame);
            }
            match self.from_client.recv().await? {
                WireMessage::Text(text) => {
                    let frames = decode_frames(&text).expect("client sent an invalid frame");
                    self.pending.extend(frames);
                },
                _ => continue,
            }
        }
    }

    /// Next frame, or `None` if nothing arrives within `wait`.
    pub async fn try_recv_frame(&mut self, wait: Duration) -> Option<StompFrame> {
        tokio::time::timeout(wait, self.recv_frame()).await.ok().flatten()
    }

    /// Expect CONNECT and answer CONNECTED. Returns the CONNECT frame.
    pub async fn handshake(&mut self) -> StompFrame {
        let connect = self.recv_frame().await.expect("no CONNECT frame");
        assert_eq!(connect.command, StompCommand::Connect);
        self.send_frame(
            StompFrame::new(StompCommand::Connected)
                .header("version", "1.2")
                .header("heart-beat", "0,0"),
        );
        connect
    }

    /// Expect a SUBSCRIBE frame.
    pub async fn expect_subscribe(&mut self) -> StompFrame {
        let frame = self.recv_frame().await.expect("no SUBSCRIBE frame");
        assert_eq!(frame.command, StompCommand::Subscribe, "got {:?}", frame);
        frame
    }

    pub fn send_frame(&self, frame: StompFrame) {
        let _ = self.to_client.send(WireMessage::Text(frame.encode()));
    }

    pub fn send_raw(&self, msg: WireMessage) {
        let _ = self.to_client.send(msg);
    }

    /// Acknowledge a SUBSCRIBE through its receipt header.
    pub fn receipt(&self, subscribe: &StompFrame) {
        let receipt = subscribe.get("receipt").expect("SUBSCRIBE without receipt");
        self.send_frame(StompFrame::new(StompCommand::Receipt).header("receipt-id", receipt));
    }

    /// Push a MESSAGE to the subscription created by `subscribe`.
    pub fn publish(&self, subscribe: &StompFrame, body: &str) {
        let id = subscribe.get("id").expect("SUBSCRIBE without id");
        let destination = subscribe.get("destination").expect("SUBSCRIBE without destination");
        self.send_frame(
            StompFrame::new(StompCommand::Message)
                .header("subscription", id)
                .header("destination", destination)
                .header("message-id", format!("m-{}", id))
                .header("content-type", "application/json")
                .with_body(body),
        );
    }

    /// Close the socket from the server side.
    pub fn close(&self) {
        let _ = self
            .to_client
            .send(WireMessage::Close(Some((1001, "going away".to_string()))));
    }
}

// ── Snapshot fetcher ────────────────────────────────────────────────────────

pub type FetchReply = oneshot::Sender<Result<Vec<EntityRecord>, SnapshotLoadError>>;

/// Fetcher whose every request is answered by the test.
pub struct GatedFetcher {
    requests: mpsc::UnboundedSender<(SnapshotSource, FetchReply)>,
}

impl GatedFetcher {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<(SnapshotSource, FetchReply)>) {
        let (requests, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { requests }), rx)
    }
}

#[async_trait]
impl SnapshotFetcher for GatedFetcher {
    async fn fetch(&self, source: &SnapshotSource) -> Result<Vec<EntityRecord>, SnapshotLoadError> {
        let (tx, rx) = oneshot::channel();
        let path = source.paths.join(",");
        self.requests
            .send((source.clone(), tx))
            .map_err(|_| SnapshotLoadError::Transport {
                path: path.clone(),
                message: "test dropped the fetcher".into(),
            })?;
        rx.await.map_err(|_| SnapshotLoadError::Transport {
            path,
            message: "test dropped the reply".into(),
        })?
    }
}

/// A `request` JSON body as the portal pushes it on `/topic/requests`.
pub fn request_json(id: &str, status: &str, owner: &str) -> String {
    serde_json::json!({
        "id": id,
        "name": format!("Business {}", id),
        "description": "Family bakery",
        "category": "Food",
        "address": "Main St 1",
        "status": status,
        "ownerId": owner,
        "documents": []
    })
    .to_string()
}

pub fn request_record(id: &str, status: &str, owner: &str) -> EntityRecord {
    let value: serde_json::Value = serde_json::from_str(&request_json(id, status, owner)).unwrap();
    EntityRecord::from_value(value, Some(smartcity_link::EntityKind::Request)).unwrap()
}

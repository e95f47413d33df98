//! Deadlines used by the sync engine.
//!
//! A zero duration (or anything longer than a year) means "wait forever"
//! for that step. See [`LinkTimeouts::is_no_timeout`].

use std::time::Duration;

/// Every deadline the client applies, from socket open to snapshot fetch.
///
/// ```rust
/// use smartcity_link::LinkTimeouts;
/// use std::time::Duration;
///
/// // Kiosk on a slow municipal VPN: generous fetches, slower heartbeat.
/// let kiosk = LinkTimeouts::builder()
///     .snapshot_timeout(Duration::from_secs(90))
///     .heartbeat_secs(15, 10)
///     .build();
/// assert_eq!(kiosk.heartbeat().unwrap().ping_after, Duration::from_secs(15));
///
/// let dev = LinkTimeouts::fast();
/// assert!(dev.connection_timeout < kiosk.connection_timeout);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkTimeouts {
    /// TCP, TLS and WebSocket upgrade together. Default 10s.
    pub connection_timeout: Duration,
    /// CONNECT sent until CONNECTED received. Default 5s.
    pub handshake_timeout: Duration,
    /// How long `SubscriptionHandle::confirmed` waits for a RECEIPT. Default 5s.
    pub subscribe_timeout: Duration,
    /// Whole snapshot fetch, all paths and retries included. Default 30s.
    pub snapshot_timeout: Duration,
    /// Inbound silence before the client pings. Default 4s, like the portal's
    /// browser client.
    pub keepalive_interval: Duration,
    /// Window for any inbound frame after a ping. Default 4s.
    pub pong_timeout: Duration,
}

/// Effective heartbeat settings while a session is live.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Heartbeat {
    pub ping_after: Duration,
    /// `None` keeps pinging without ever declaring the peer dead.
    pub pong_within: Option<Duration>,
}

impl Default for LinkTimeouts {
    fn default() -> Self {
        Self::uniform(5, 30, 4).with_connection(Duration::from_secs(10))
    }
}

impl LinkTimeouts {
    pub fn builder() -> LinkTimeoutsBuilder {
        LinkTimeoutsBuilder::default()
    }

    /// Local portal on localhost.
    pub fn fast() -> Self {
        Self::uniform(2, 5, 2)
    }

    /// High-latency links, e.g. field tablets on mobile data.
    pub fn relaxed() -> Self {
        Self {
            pong_timeout: Duration::from_secs(10),
            ..Self::uniform(15, 120, 20).with_connection(Duration::from_secs(30))
        }
    }

    /// Wait forever at every step and never ping.
    pub fn no_timeouts() -> Self {
        Self::uniform(0, 0, 0)
    }

    /// Zero or absurdly long durations disable the corresponding deadline.
    pub fn is_no_timeout(duration: Duration) -> bool {
        const ONE_YEAR: Duration = Duration::from_secs(365 * 24 * 3600);
        duration.is_zero() || duration > ONE_YEAR
    }

    /// `None` when keepalive pings are disabled.
    pub fn heartbeat(&self) -> Option<Heartbeat> {
        if Self::is_no_timeout(self.keepalive_interval) {
            return None;
        }
        Some(Heartbeat {
            ping_after: self.keepalive_interval,
            pong_within: (!Self::is_no_timeout(self.pong_timeout)).then_some(self.pong_timeout),
        })
    }

    fn uniform(session_secs: u64, snapshot_secs: u64, heartbeat_secs: u64) -> Self {
        let session = Duration::from_secs(session_secs);
        let heartbeat = Duration::from_secs(heartbeat_secs);
        Self {
            connection_timeout: session,
            handshake_timeout: session,
            subscribe_timeout: session,
            snapshot_timeout: Duration::from_secs(snapshot_secs),
            keepalive_interval: heartbeat,
            pong_timeout: heartbeat,
        }
    }

    fn with_connection(mut self, timeout: Duration) -> Self {
        self.connection_timeout = timeout;
        self
    }
}

/// Builder starting from [`LinkTimeouts::default`].
#[derive(Debug, Clone, Default)]
pub struct LinkTimeoutsBuilder {
    timeouts: LinkTimeouts,
}

impl LinkTimeoutsBuilder {
    pub fn connection_timeout(mut self, timeout: Duration) -> Self {
        self.timeouts.connection_timeout = timeout;
        self
    }

    pub fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.timeouts.handshake_timeout = timeout;
        self
    }

    pub fn subscribe_timeout(mut self, timeout: Duration) -> Self {
        self.timeouts.subscribe_timeout = timeout;
        self
    }

    pub fn snapshot_timeout(mut self, timeout: Duration) -> Self {
        self.timeouts.snapshot_timeout = timeout;
        self
    }

    /// Zero disables keepalive pings entirely.
    pub fn keepalive_interval(mut self, interval: Duration) -> Self {
        self.timeouts.keepalive_interval = interval;
        self
    }

    /// Zero keeps pinging but never drops the session for silence.
    pub fn pong_timeout(mut self, timeout: Duration) -> Self {
        self.timeouts.pong_timeout = timeout;
        self
    }

    /// Ping after `ping_after` seconds of silence, give up `pong_within`
    /// seconds later.
    pub fn heartbeat_secs(self, ping_after: u64, pong_within: u64) -> Self {
        self.keepalive_interval(Duration::from_secs(ping_after))
            .pong_timeout(Duration::from_secs(pong_within))
    }

    pub fn build(self) -> LinkTimeouts {
        self.timeouts
    }
}

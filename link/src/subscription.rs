//! Topic subscriptions on the shared push connection.
//!
//! - [`broker`]: sans-IO bookkeeping owned by the connection task
//! - [`SubscriptionHandle`]: caller-side handle returned by every subscribe,
//!   including subscribes issued while disconnected

pub(crate) mod broker;

use crate::{
    connection::ConnCmd,
    error::SubscriptionError,
    models::DeltaEvent,
    timeouts::LinkTimeouts,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};

pub(crate) use broker::TopicSubscriptionBroker;

/// Per-topic callback invoked on the connection task for every valid event.
pub type TopicHandler = Arc<dyn Fn(&DeltaEvent) + Send + Sync>;

/// Lifecycle of one topic subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscriptionStatus {
    /// Waiting for a connection.
    Queued,
    /// SUBSCRIBE sent, receipt pending.
    Requested,
    /// Receipt (or a first message) received.
    Active,
    /// Refused by the broker. Never retried.
    Rejected(SubscriptionError),
    Cancelled,
}

impl SubscriptionStatus {
    /// `true` once the subscription can no longer deliver events.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Rejected(_) | Self::Cancelled)
    }
}

/// Snapshot of one subscription, as listed by `active_topics()`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicInfo {
    pub topic: String,
    pub subscription_id: String,
    pub status: SubscriptionStatus,
    pub generation: u64,
    pub created_at_ms: u64,
    pub last_event_time_ms: Option<u64>,
    pub messages_received: u64,
}

/// Handle for one topic subscription.
///
/// Dropping the handle does not cancel the subscription; call
/// [`cancel`](Self::cancel). A cancel from a handle whose topic has since
/// been cancelled and subscribed again is ignored.
#[derive(Debug, Clone)]
pub struct SubscriptionHandle {
    topic: String,
    generation: u64,
    cmd_tx: mpsc::UnboundedSender<ConnCmd>,
    status_rx: watch::Receiver<SubscriptionStatus>,
    subscribe_timeout: Duration,
}

impl SubscriptionHandle {
    pub(crate) fn new(
        topic: String,
        generation: u64,
        cmd_tx: mpsc::UnboundedSender<ConnCmd>,
        status_rx: watch::Receiver<SubscriptionStatus>,
        subscribe_timeout: Duration,
    ) -> Self {
        Self {
            topic,
            generation,
            cmd_tx,
            status_rx,
            subscribe_timeout,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn status(&self) -> SubscriptionStatus {
        self.status_rx.borrow().clone()
    }

    pub(crate) fn status_watch(&self) -> watch::Receiver<SubscriptionStatus> {
        self.status_rx.clone()
    }

    /// Stop delivery for this topic. Safe to call more than once.
    pub fn cancel(&self) {
        let _ = self.cmd_tx.send(ConnCmd::Cancel {
            topic: self.topic.clone(),
            generation: self.generation,
        });
    }

    /// Wait until the broker acknowledges the subscription.
    ///
    /// Waits through reconnects, bounded by the subscribe timeout.
    pub async fn confirmed(&self) -> Result<(), SubscriptionError> {
        let mut rx = self.status_rx.clone();
        let wait = async {
            let status = rx
                .wait_for(|s| matches!(s, SubscriptionStatus::Active) || s.is_terminal())
                .await
                .map_err(|_| SubscriptionError::Closed)?
                .clone();
            match status {
                SubscriptionStatus::Rejected(err) => Err(err),
                SubscriptionStatus::Cancelled => Err(SubscriptionError::Cancelled {
                    topic: self.topic.clone(),
                }),
                _ => Ok(()),
            }
        };

        if LinkTimeouts::is_no_timeout(self.subscribe_timeout) {
            return wait.await;
        }
        tokio::time::timeout(self.subscribe_timeout, wait)
            .await
            .map_err(|_| SubscriptionError::Timeout {
                topic: self.topic.clone(),
                timeout: self.subscribe_timeout,
            })?
    }
}

//! Topic subscription bookkeeping for the connection task.
//!
//! The broker never touches the network. Every method returns the frames
//! the caller must send, so the connection task stays the single owner of
//! both the transport and this state.

use super::{SubscriptionStatus, TopicHandler, TopicInfo};
use crate::{
    error::{MalformedEventError, SubscriptionError},
    models::DeltaEvent,
    stomp::StompFrame,
};
use chrono::{DateTime, Utc};
use tokio::sync::watch;

struct Entry {
    topic: String,
    sub_id: String,
    receipt: String,
    handler: TopicHandler,
    status: SubscriptionStatus,
    status_tx: watch::Sender<SubscriptionStatus>,
    generation: u64,
    created_at_ms: u64,
    last_event_time_ms: Option<u64>,
    messages_received: u64,
}

impl Entry {
    fn set_status(&mut self, status: SubscriptionStatus) {
        self.status = status.clone();
        self.status_tx.send_replace(status);
    }

    fn subscribe_frame(&self) -> StompFrame {
        StompFrame::subscribe(&self.sub_id, &self.topic, &self.receipt)
    }

    fn info(&self) -> TopicInfo {
        TopicInfo {
            topic: self.topic.clone(),
            subscription_id: self.sub_id.clone(),
            status: self.status.clone(),
            generation: self.generation,
            created_at_ms: self.created_at_ms,
            last_event_time_ms: self.last_event_time_ms,
            messages_received: self.messages_received,
        }
    }
}

/// At most one entry per topic, kept in first-subscribe order.
pub(crate) struct TopicSubscriptionBroker {
    entries: Vec<Entry>,
    connected: bool,
    next_generation: u64,
    next_sub_id: u64,
}

impl Default for TopicSubscriptionBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl TopicSubscriptionBroker {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            connected: false,
            next_generation: 1,
            next_sub_id: 0,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Register `topic`. Returns the SUBSCRIBE frame to send, if any.
    ///
    /// A repeat subscribe to a known topic swaps the handler and keeps the
    /// existing generation and wire subscription.
    pub fn subscribe(
        &mut self,
        topic: &str,
        handler: TopicHandler,
        now_ms: u64,
    ) -> (u64, watch::Receiver<SubscriptionStatus>, Option<StompFrame>) {
        if let Some(entry) = self.entries.iter_mut().find(|e| e.topic == topic) {
            log::debug!(
                "[smartcity-link] Replacing handler for '{}' ({})",
                topic,
                entry.sub_id
            );
            entry.handler = handler;
            return (entry.generation, entry.status_tx.subscribe(), None);
        }

        let generation = self.next_generation;
        self.next_generation += 1;
        let sub_id = format!("sub-{}", self.next_sub_id);
        self.next_sub_id += 1;

        let status = if self.connected {
            SubscriptionStatus::Requested
        } else {
            SubscriptionStatus::Queued
        };
        let (status_tx, status_rx) = watch::channel(status.clone());
        let entry = Entry {
            topic: topic.to_string(),
            receipt: format!("rcpt-{}", sub_id),
            sub_id,
            handler,
            status,
            status_tx,
            generation,
            created_at_ms: now_ms,
            last_event_time_ms: None,
            messages_received: 0,
        };
        let frame = self.connected.then(|| entry.subscribe_frame());
        if frame.is_none() {
            log::debug!("[smartcity-link] Queued subscription to '{}' until connected", topic);
        }
        self.entries.push(entry);
        (generation, status_rx, frame)
    }

    /// Remove `topic` if `generation` is still current.
    ///
    /// Returns UNSUBSCRIBE only when a SUBSCRIBE actually went out.
    pub fn cancel(&mut self, topic: &str, generation: u64) -> Option<StompFrame> {
        let pos = self
            .entries
            .iter()
            .position(|e| e.topic == topic && e.generation == generation);
        let Some(pos) = pos else {
            log::debug!(
                "[smartcity-link] Ignoring stale cancel for '{}' (gen={})",
                topic,
                generation
            );
            return None;
        };

        let mut entry = self.entries.remove(pos);
        let was_sent = matches!(
            entry.status,
            SubscriptionStatus::Requested | SubscriptionStatus::Active
        );
        entry.set_status(SubscriptionStatus::Cancelled);
        if was_sent && self.connected {
            Some(StompFrame::unsubscribe(&entry.sub_id))
        } else {
            None
        }
    }

    /// Session established: SUBSCRIBE every known topic in insertion order.
    pub fn on_connected(&mut self) -> Vec<StompFrame> {
        self.connected = true;
        self.entries
            .iter_mut()
            .map(|entry| {
                entry.set_status(SubscriptionStatus::Requested);
                entry.subscribe_frame()
            })
            .collect()
    }

    /// Session lost: everything waits for the next connect.
    pub fn on_disconnected(&mut self) {
        self.connected = false;
        for entry in &mut self.entries {
            entry.set_status(SubscriptionStatus::Queued);
        }
    }

    pub fn on_receipt(&mut self, receipt_id: &str) -> bool {
        match self.entries.iter_mut().find(|e| e.receipt == receipt_id) {
            Some(entry) if entry.status == SubscriptionStatus::Requested => {
                entry.set_status(SubscriptionStatus::Active);
                true
            },
            _ => false,
        }
    }

    /// ERROR frame answering one of our SUBSCRIBEs. The topic is dropped
    /// and will not be re-issued on reconnect.
    pub fn on_error(&mut self, frame: &StompFrame) -> Option<SubscriptionError> {
        let receipt_id = frame.get("receipt-id")?;
        let pos = self.entries.iter().position(|e| e.receipt == receipt_id)?;
        let mut entry = self.entries.remove(pos);

        let reason = frame
            .get("message")
            .map(str::to_string)
            .unwrap_or_else(|| frame.body.trim().to_string());
        let error = SubscriptionError::Rejected {
            topic: entry.topic.clone(),
            reason,
        };
        entry.set_status(SubscriptionStatus::Rejected(error.clone()));
        Some(error)
    }

    /// Route a MESSAGE body by `subscription` header, else `destination`.
    ///
    /// Returns `Ok(false)` when no topic matches.
    pub fn deliver(
        &mut self,
        subscription: Option<&str>,
        destination: Option<&str>,
        body: &str,
        received_at: DateTime<Utc>,
    ) -> Result<bool, MalformedEventError> {
        let by_id = subscription.and_then(|id| self.entries.iter().position(|e| e.sub_id == id));
        let pos = by_id.or_else(|| {
            destination.and_then(|dest| self.entries.iter().position(|e| e.topic == dest))
        });
        let Some(pos) = pos else {
            return Ok(false);
        };

        let entry = &mut self.entries[pos];
        let event = DeltaEvent::decode(&entry.topic, body, received_at)?;
        entry.messages_received += 1;
        entry.last_event_time_ms = Some(received_at.timestamp_millis().max(0) as u64);
        // Brokers that never send RECEIPT still prove the subscription live.
        if entry.status == SubscriptionStatus::Requested {
            entry.set_status(SubscriptionStatus::Active);
        }
        let handler = entry.handler.clone();
        handler(&event);
        Ok(true)
    }

    pub fn active_topics(&self) -> Vec<TopicInfo> {
        self.entries.iter().map(Entry::info).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stomp::StompCommand;
    use parking_lot::Mutex;
    use std::sync::Arc;

    fn noop() -> TopicHandler {
        Arc::new(|_: &DeltaEvent| {})
    }

    fn recording(log: &Arc<Mutex<Vec<String>>>) -> TopicHandler {
        let log = log.clone();
        Arc::new(move |event: &DeltaEvent| log.lock().push(event.entity_id.clone()))
    }

    fn destinations(frames: &[StompFrame]) -> Vec<&str> {
        frames.iter().filter_map(|f| f.get("destination")).collect()
    }

    #[test]
    fn test_subscribe_while_disconnected_is_queued() {
        let mut broker = TopicSubscriptionBroker::new();
        let (gen, status, frame) = broker.subscribe("/topic/requests", noop(), 0);
        assert_eq!(gen, 1);
        assert!(frame.is_none());
        assert_eq!(*status.borrow(), SubscriptionStatus::Queued);
    }

    #[test]
    fn test_subscribe_while_connected_sends_immediately() {
        let mut broker = TopicSubscriptionBroker::new();
        assert!(broker.on_connected().is_empty());
        let (_, status, frame) = broker.subscribe("/topic/requests", noop(), 0);
        let frame = frame.expect("SUBSCRIBE expected");
        assert_eq!(frame.command, StompCommand::Subscribe);
        assert_eq!(frame.get("id"), Some("sub-0"));
        assert_eq!(frame.get("receipt"), Some("rcpt-sub-0"));
        assert_eq!(*status.borrow(), SubscriptionStatus::Requested);

        assert!(broker.on_receipt("rcpt-sub-0"));
        assert_eq!(*status.borrow(), SubscriptionStatus::Active);
    }

    #[test]
    fn test_duplicate_subscribe_replaces_handler_without_frame() {
        let mut broker = TopicSubscriptionBroker::new();
        broker.on_connected();
        let first = Arc::new(Mutex::new(Vec::new()));
        let second = Arc::new(Mutex::new(Vec::new()));

        let (gen1, _, frame1) = broker.subscribe("/topic/requests", recording(&first), 0);
        let (gen2, _, frame2) = broker.subscribe("/topic/requests", recording(&second), 5);
        assert!(frame1.is_some());
        assert!(frame2.is_none());
        assert_eq!(gen1, gen2);
        assert_eq!(broker.len(), 1);

        broker
            .deliver(Some("sub-0"), None, r#"{"id":"r1","status":"APPROVED"}"#, Utc::now())
            .unwrap();
        assert!(first.lock().is_empty());
        assert_eq!(*second.lock(), vec!["r1".to_string()]);
    }

    #[test]
    fn test_cancel_of_queued_subscription_has_no_network_effect() {
        let mut broker = TopicSubscriptionBroker::new();
        let (gen, status, _) = broker.subscribe("/topic/requests", noop(), 0);
        assert!(broker.cancel("/topic/requests", gen).is_none());
        assert_eq!(*status.borrow(), SubscriptionStatus::Cancelled);
        // Nothing left to flush after connecting.
        assert!(broker.on_connected().is_empty());
    }

    #[test]
    fn test_cancel_of_sent_subscription_unsubscribes() {
        let mut broker = TopicSubscriptionBroker::new();
        broker.on_connected();
        let (gen, _, _) = broker.subscribe("/topic/requests", noop(), 0);
        let frame = broker.cancel("/topic/requests", gen).expect("UNSUBSCRIBE expected");
        assert_eq!(frame.command, StompCommand::Unsubscribe);
        assert_eq!(frame.get("id"), Some("sub-0"));
        assert!(broker.active_topics().is_empty());
    }

    #[test]
    fn test_stale_cancel_is_ignored() {
        let mut broker = TopicSubscriptionBroker::new();
        broker.on_connected();
        let (old_gen, _, _) = broker.subscribe("/topic/requests", noop(), 0);
        broker.cancel("/topic/requests", old_gen);
        let (new_gen, _, _) = broker.subscribe("/topic/requests", noop(), 0);
        assert_ne!(old_gen, new_gen);

        assert!(broker.cancel("/topic/requests", old_gen).is_none());
        assert_eq!(broker.len(), 1, "stale cancel must not remove the new subscription");
    }

    #[test]
    fn test_resubscribe_order_flushes_queued_topic_once() {
        let mut broker = TopicSubscriptionBroker::new();
        broker.on_connected();
        broker.subscribe("/topic/requests", noop(), 0);
        broker.subscribe("/topic/conversations/u1", noop(), 0);

        broker.on_disconnected();
        let (_, status, frame) = broker.subscribe("/topic/categories", noop(), 0);
        assert!(frame.is_none());
        assert_eq!(*status.borrow(), SubscriptionStatus::Queued);

        let frames = broker.on_connected();
        assert_eq!(
            destinations(&frames),
            vec!["/topic/requests", "/topic/conversations/u1", "/topic/categories"]
        );
        assert_eq!(*status.borrow(), SubscriptionStatus::Requested);
    }

    #[test]
    fn test_rejected_subscription_is_not_retried() {
        let mut broker = TopicSubscriptionBroker::new();
        broker.on_connected();
        broker.subscribe("/topic/requests", noop(), 0);
        let (_, status, _) = broker.subscribe("/topic/admin-only", noop(), 0);

        let error_frame = StompFrame::new(StompCommand::Error)
            .header("receipt-id", "rcpt-sub-1")
            .header("message", "Access denied");
        let err = broker.on_error(&error_frame).expect("rejection expected");
        assert_eq!(
            err,
            SubscriptionError::Rejected {
                topic: "/topic/admin-only".to_string(),
                reason: "Access denied".to_string(),
            }
        );
        assert!(matches!(*status.borrow(), SubscriptionStatus::Rejected(_)));

        broker.on_disconnected();
        let frames = broker.on_connected();
        assert_eq!(destinations(&frames), vec!["/topic/requests"]);
    }

    #[test]
    fn test_error_without_matching_receipt_is_not_a_rejection() {
        let mut broker = TopicSubscriptionBroker::new();
        broker.on_connected();
        broker.subscribe("/topic/requests", noop(), 0);
        let frame = StompFrame::new(StompCommand::Error).header("message", "Session closed");
        assert!(broker.on_error(&frame).is_none());
        assert_eq!(broker.len(), 1);
    }

    #[test]
    fn test_deliver_routes_by_destination_and_counts() {
        let mut broker = TopicSubscriptionBroker::new();
        broker.on_connected();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let (_, status, _) = broker.subscribe("/topic/requests", recording(&seen), 0);

        let delivered = broker
            .deliver(None, Some("/topic/requests"), r#"{"id":"r7"}"#, Utc::now())
            .unwrap();
        assert!(delivered);
        assert_eq!(*seen.lock(), vec!["r7".to_string()]);
        assert_eq!(*status.borrow(), SubscriptionStatus::Active);

        let info = &broker.active_topics()[0];
        assert_eq!(info.messages_received, 1);
        assert!(info.last_event_time_ms.is_some());

        let unknown = broker
            .deliver(Some("sub-99"), Some("/topic/other"), r#"{"id":"x"}"#, Utc::now())
            .unwrap();
        assert!(!unknown);
    }

    #[test]
    fn test_deliver_rejects_malformed_without_invoking_handler() {
        let mut broker = TopicSubscriptionBroker::new();
        broker.on_connected();
        let seen = Arc::new(Mutex::new(Vec::new()));
        broker.subscribe("/topic/requests", recording(&seen), 0);

        let err = broker
            .deliver(Some("sub-0"), None, r#"{"status":"APPROVED"}"#, Utc::now())
            .unwrap_err();
        assert!(matches!(err, MalformedEventError::MissingEntityId { .. }));
        assert!(seen.lock().is_empty());
        assert_eq!(broker.active_topics()[0].messages_received, 0);
    }
}

//! In-process fan-out of delta events.
//!
//! Many live collections can watch the same topic while only one transport
//! subscription exists. Delivery is synchronous, in attach order, on the
//! publishing task. The handler list is snapshotted before dispatch, so
//! handlers may attach or detach (including themselves) while running.

use crate::models::DeltaEvent;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

pub type BusHandler = Arc<dyn Fn(&DeltaEvent) + Send + Sync>;

/// Identifies one attachment. Returned by [`EventBus::attach`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AttachToken {
    id: u64,
    topic: String,
}

impl AttachToken {
    pub fn topic(&self) -> &str {
        &self.topic
    }
}

#[derive(Default)]
struct Registry {
    next_id: u64,
    topics: HashMap<String, Vec<(u64, BusHandler)>>,
}

#[derive(Default)]
pub struct EventBus {
    inner: Mutex<Registry>,
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("topics", &self.topics())
            .finish()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attach<F>(&self, topic: &str, handler: F) -> AttachToken
    where
        F: Fn(&DeltaEvent) + Send + Sync + 'static,
    {
        let mut inner = self.inner.lock();
        let id = inner.next_id;
        inner.next_id += 1;
        inner
            .topics
            .entry(topic.to_string())
            .or_default()
            .push((id, Arc::new(handler)));
        AttachToken {
            id,
            topic: topic.to_string(),
        }
    }

    /// Remove an attachment. Returns `false` if it was already gone.
    pub fn detach(&self, token: &AttachToken) -> bool {
        let mut inner = self.inner.lock();
        let Some(handlers) = inner.topics.get_mut(&token.topic) else {
            return false;
        };
        let before = handlers.len();
        handlers.retain(|(id, _)| *id != token.id);
        let removed = handlers.len() != before;
        if handlers.is_empty() {
            inner.topics.remove(&token.topic);
        }
        removed
    }

    /// Deliver `event` to every handler attached to `topic`.
    ///
    /// Returns the number of handlers invoked.
    pub fn publish(&self, topic: &str, event: &DeltaEvent) -> usize {
        let handlers: Vec<BusHandler> = {
            let inner = self.inner.lock();
            match inner.topics.get(topic) {
                Some(list) => list.iter().map(|(_, h)| h.clone()).collect(),
                None => return 0,
            }
        };
        for handler in &handlers {
            handler(event);
        }
        handlers.len()
    }

    pub fn handler_count(&self, topic: &str) -> usize {
        self.inner.lock().topics.get(topic).map_or(0, Vec::len)
    }

    /// Topics with at least one handler, sorted.
    pub fn topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self.inner.lock().topics.keys().cloned().collect();
        topics.sort();
        topics
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{EntityRecord, ServiceRequest};
    use chrono::Utc;

    fn event(id: &str) -> DeltaEvent {
        let record = EntityRecord::Request(ServiceRequest {
            id: id.to_string(),
            name: None,
            description: None,
            category: None,
            address: None,
            lat: None,
            lng: None,
            status: "APPROVED".to_string(),
            owner_id: None,
            comments: None,
            documents: Vec::new(),
        });
        DeltaEvent::from_record("/topic/requests", record, Utc::now()).unwrap()
    }

    #[test]
    fn test_publish_in_attach_order() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        for label in ["a", "b", "c"] {
            let seen = seen.clone();
            bus.attach("/topic/requests", move |e: &DeltaEvent| {
                seen.lock().push(format!("{}:{}", label, e.entity_id))
            });
        }
        assert_eq!(bus.publish("/topic/requests", &event("r1")), 3);
        assert_eq!(*seen.lock(), vec!["a:r1", "b:r1", "c:r1"]);
        assert_eq!(bus.publish("/topic/other", &event("r1")), 0);
    }

    #[test]
    fn test_detach_is_idempotent() {
        let bus = EventBus::new();
        let token = bus.attach("/topic/requests", |_: &DeltaEvent| {});
        assert_eq!(bus.handler_count("/topic/requests"), 1);
        assert!(bus.detach(&token));
        assert!(!bus.detach(&token));
        assert_eq!(bus.handler_count("/topic/requests"), 0);
        assert!(bus.topics().is_empty());
    }

    #[test]
    fn test_detach_during_dispatch_does_not_affect_current_pass() {
        let bus = Arc::new(EventBus::new());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let second: Arc<Mutex<Option<AttachToken>>> = Arc::new(Mutex::new(None));

        {
            let bus_ref = Arc::downgrade(&bus);
            let second = second.clone();
            let seen = seen.clone();
            bus.attach("/topic/requests", move |_: &DeltaEvent| {
                seen.lock().push("first");
                // Detach the second handler mid-dispatch.
                if let (Some(bus), Some(token)) = (bus_ref.upgrade(), second.lock().as_ref()) {
                    bus.detach(token);
                }
            });
        }
        {
            let seen = seen.clone();
            let token = bus.attach("/topic/requests", move |_: &DeltaEvent| {
                seen.lock().push("second");
            });
            *second.lock() = Some(token);
        }

        // Snapshot taken before dispatch: both run this time.
        assert_eq!(bus.publish("/topic/requests", &event("r1")), 2);
        assert_eq!(*seen.lock(), vec!["first", "second"]);

        // Second was detached during the first pass.
        assert_eq!(bus.publish("/topic/requests", &event("r2")), 1);
        assert_eq!(bus.handler_count("/topic/requests"), 1);
    }

    #[test]
    fn test_attach_during_dispatch_joins_next_pass() {
        let bus = Arc::new(EventBus::new());
        let count = Arc::new(Mutex::new(0usize));
        {
            let bus_ref = Arc::downgrade(&bus);
            let count = count.clone();
            bus.attach("/topic/requests", move |_: &DeltaEvent| {
                if let Some(bus) = bus_ref.upgrade() {
                    let count = count.clone();
                    bus.attach("/topic/requests", move |_: &DeltaEvent| *count.lock() += 1);
                }
            });
        }
        assert_eq!(bus.publish("/topic/requests", &event("r1")), 1);
        assert_eq!(*count.lock(), 0);
        assert_eq!(bus.publish("/topic/requests", &event("r2")), 2);
        assert_eq!(*count.lock(), 1);
    }
}

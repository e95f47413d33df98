//! Live collections: snapshot + delta views driven by their consumer.
//!
//! A [`LiveCollection`] owns one [`LiveCollectionSynchronizer`], one
//! [`TopicAttachment`] per topic of its [`CollectionConfig`] and the
//! in-flight snapshot fetch. Deltas reach it over a channel fed by the
//! event bus, so the collection itself is never shared or locked.
//!
//! ```rust,no_run
//! use smartcity_link::{CollectionConfig, LinkClient};
//!
//! # async fn example() -> smartcity_link::Result<()> {
//! let client = LinkClient::builder()
//!     .base_url("http://localhost:8080")
//!     .build()?;
//! client.connect()?;
//!
//! let mut listing = client.open_collection(CollectionConfig::public_listing()).await?;
//! while let Some(change) = listing.next().await {
//!     match change {
//!         Ok(_) => println!("{} approved businesses", listing.collection().len()),
//!         Err(e) => eprintln!("snapshot failed: {}", e),
//!     }
//! }
//! # Ok(())
//! # }
//! ```

pub mod snapshot;
pub mod synchronizer;

pub use snapshot::{HttpSnapshotFetcher, SnapshotFetcher};
pub use synchronizer::{LiveCollectionSynchronizer, MergeOutcome, ReplaySummary, SnapshotTicket};

use crate::{
    client::TopicAttachment,
    error::{SnapshotLoadError, SubscriptionError},
    models::{
        CollectionConfig, CollectionEntry, ConnectionState, DeltaEvent, EntityKind, EntityRecord,
        StateTransition,
    },
    subscription::{SubscriptionHandle, SubscriptionStatus},
    timeouts::LinkTimeouts,
};
use chrono::Utc;
use futures_util::future::select_all;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;

/// One observable change of a [`LiveCollection`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CollectionChange {
    /// A snapshot replaced the collection and buffered events were replayed.
    SnapshotLoaded {
        generation: u64,
        entries: usize,
        replayed: usize,
        discarded: usize,
    },
    /// A delta event changed the collection.
    Delta {
        entity_id: String,
        outcome: MergeOutcome,
    },
    /// The connection came back; a fresh snapshot is being fetched.
    Resyncing,
    /// The broker refused one of the collection's topics. No deltas will
    /// arrive for it; reported once per topic.
    SubscriptionRejected(SubscriptionError),
}

type FetchResult = Result<Vec<EntityRecord>, SnapshotLoadError>;

struct PendingFetch {
    ticket: SnapshotTicket,
    task: JoinHandle<FetchResult>,
}

/// Consumer-owned live view of one collection.
///
/// Created by [`LinkClient::open_collection`](crate::LinkClient::open_collection).
/// Dropping it detaches every topic and abandons the in-flight fetch.
pub struct LiveCollection {
    config: CollectionConfig,
    sync: LiveCollectionSynchronizer,
    fetcher: Arc<dyn SnapshotFetcher>,
    snapshot_timeout: Duration,
    events_rx: mpsc::UnboundedReceiver<DeltaEvent>,
    attachments: Vec<TopicAttachment>,
    /// Statuses not yet seen to end; drained as they do.
    status_watches: Vec<watch::Receiver<SubscriptionStatus>>,
    pending: Option<PendingFetch>,
    state_rx: Option<broadcast::Receiver<StateTransition>>,
    saw_disconnect: bool,
    closed: bool,
}

impl std::fmt::Debug for LiveCollection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LiveCollection")
            .field("name", &self.config.name)
            .field("generation", &self.sync.generation())
            .field("entries", &self.sync.len())
            .field("pending", &self.pending.is_some())
            .field("closed", &self.closed)
            .finish()
    }
}

impl LiveCollection {
    pub(crate) fn new(
        config: CollectionConfig,
        fetcher: Arc<dyn SnapshotFetcher>,
        snapshot_timeout: Duration,
        events_rx: mpsc::UnboundedReceiver<DeltaEvent>,
        attachments: Vec<TopicAttachment>,
        state_rx: broadcast::Receiver<StateTransition>,
    ) -> Self {
        let sync = LiveCollectionSynchronizer::new(
            config.visible.clone(),
            config.insert_policy,
            config.max_buffered_events,
        );
        let status_watches = attachments
            .iter()
            .filter_map(|a| a.subscription().map(SubscriptionHandle::status_watch))
            .collect();
        Self {
            config,
            sync,
            fetcher,
            snapshot_timeout,
            events_rx,
            attachments,
            status_watches,
            pending: None,
            state_rx: Some(state_rx),
            saw_disconnect: false,
            closed: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &CollectionConfig {
        &self.config
    }

    /// Ordered view of the collection.
    pub fn collection(&self) -> &[CollectionEntry] {
        self.sync.collection()
    }

    pub fn get(&self, id: &str) -> Option<&CollectionEntry> {
        self.sync.get(id)
    }

    pub fn generation(&self) -> u64 {
        self.sync.generation()
    }

    /// `true` while a snapshot fetch is in flight.
    pub fn is_loading(&self) -> bool {
        self.pending.is_some()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn synchronizer(&self) -> &LiveCollectionSynchronizer {
        &self.sync
    }

    /// Transport subscriptions behind the collection's topics.
    pub fn subscriptions(&self) -> impl Iterator<Item = &SubscriptionHandle> {
        self.attachments.iter().filter_map(|a| a.subscription())
    }

    /// Start a new snapshot fetch. Any fetch still in flight becomes stale.
    pub fn refresh(&mut self) {
        if self.closed {
            return;
        }
        if let Some(previous) = self.pending.take() {
            previous.task.abort();
        }

        let ticket = self.sync.begin_snapshot(Utc::now());
        let fetcher = self.fetcher.clone();
        let source = self.config.source.clone();
        let timeout = self.snapshot_timeout;
        log::debug!(
            "[smartcity-link] Collection '{}': fetching snapshot (gen {})",
            self.config.name,
            ticket.generation
        );

        let task = tokio::spawn(async move {
            if LinkTimeouts::is_no_timeout(timeout) {
                return fetcher.fetch(&source).await;
            }
            match tokio::time::timeout(timeout, fetcher.fetch(&source)).await {
                Ok(result) => result,
                Err(_) => Err(SnapshotLoadError::Timeout {
                    path: source.paths.join(","),
                    timeout,
                }),
            }
        });
        self.pending = Some(PendingFetch { ticket, task });
    }

    /// Wait for the next change.
    ///
    /// Returns `None` once the collection is closed.
    pub async fn next(&mut self) -> Option<Result<CollectionChange, SnapshotLoadError>> {
        loop {
            if self.closed {
                return None;
            }

            tokio::select! {
                biased;

                (ticket, result) = wait_fetch(&mut self.pending), if self.pending.is_some() => {
                    self.pending = None;
                    match self.finish_fetch(ticket, result) {
                        Some(change) => return Some(change),
                        None => continue,
                    }
                }

                transition = recv_transition(&mut self.state_rx), if self.state_rx.is_some() => {
                    if let Some(change) = self.on_transition(transition) {
                        return Some(Ok(change));
                    }
                }

                err = wait_rejection(&mut self.status_watches), if !self.status_watches.is_empty() => {
                    log::warn!(
                        "[smartcity-link] Collection '{}': {}",
                        self.config.name,
                        err
                    );
                    return Some(Ok(CollectionChange::SubscriptionRejected(err)));
                }

                event = self.events_rx.recv() => {
                    let Some(event) = event else {
                        return None;
                    };
                    if let Some(change) = self.on_event(event) {
                        return Some(Ok(change));
                    }
                }
            }
        }
    }

    /// Detach every topic and abandon the in-flight fetch.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.sync.detach();
        if let Some(pending) = self.pending.take() {
            pending.task.abort();
        }
        self.attachments.clear();
        self.status_watches.clear();
        log::debug!("[smartcity-link] Collection '{}' closed", self.config.name);
    }

    fn finish_fetch(
        &mut self,
        ticket: SnapshotTicket,
        result: FetchResult,
    ) -> Option<Result<CollectionChange, SnapshotLoadError>> {
        match result {
            Ok(items) => match self.sync.complete_snapshot(ticket, items) {
                Ok(summary) => {
                    log::info!(
                        "[smartcity-link] Collection '{}': snapshot gen {} loaded ({} entries)",
                        self.config.name,
                        summary.generation,
                        summary.entries
                    );
                    Some(Ok(CollectionChange::SnapshotLoaded {
                        generation: summary.generation,
                        entries: summary.entries,
                        replayed: summary.replayed,
                        discarded: summary.discarded,
                    }))
                },
                Err(e) => {
                    log::debug!("[smartcity-link] Discarding snapshot: {}", e);
                    None
                },
            },
            Err(e) => {
                if self.sync.fail_snapshot(ticket) {
                    log::warn!(
                        "[smartcity-link] Collection '{}': snapshot failed: {}",
                        self.config.name,
                        e
                    );
                    Some(Err(e))
                } else {
                    None
                }
            },
        }
    }

    fn on_transition(
        &mut self,
        transition: Option<StateTransition>,
    ) -> Option<CollectionChange> {
        let Some(transition) = transition else {
            // Missed transitions: a disconnect may be among them.
            self.saw_disconnect = true;
            return None;
        };
        match transition.to {
            ConnectionState::Disconnected => {
                self.saw_disconnect = true;
                None
            },
            ConnectionState::Connected if self.saw_disconnect => {
                self.saw_disconnect = false;
                if !self.config.resync_on_reconnect {
                    return None;
                }
                log::info!(
                    "[smartcity-link] Collection '{}': reconnected, resyncing",
                    self.config.name
                );
                self.refresh();
                Some(CollectionChange::Resyncing)
            },
            _ => None,
        }
    }

    fn on_event(&mut self, event: DeltaEvent) -> Option<CollectionChange> {
        if !self.in_scope(&event) {
            return None;
        }
        let entity_id = event.entity_id.clone();
        match self.sync.apply_delta(event) {
            Ok(outcome) if outcome.changed() => {
                Some(CollectionChange::Delta { entity_id, outcome })
            },
            Ok(outcome) => {
                log::debug!(
                    "[smartcity-link] Collection '{}': {} -> {:?}",
                    self.config.name,
                    entity_id,
                    outcome
                );
                None
            },
            Err(e) => {
                log::warn!("[smartcity-link] Skipping malformed event: {}", e);
                None
            },
        }
    }

    fn in_scope(&self, event: &DeltaEvent) -> bool {
        match &self.config.owner_scope {
            Some(owner) if event.payload.kind() == EntityKind::Request => {
                event.payload.owner_id() == Some(owner.as_str())
            },
            _ => true,
        }
    }
}

impl Drop for LiveCollection {
    fn drop(&mut self) {
        if let Some(pending) = self.pending.take() {
            pending.task.abort();
        }
    }
}

async fn wait_fetch(pending: &mut Option<PendingFetch>) -> (SnapshotTicket, FetchResult) {
    match pending {
        Some(fetch) => {
            let result = match (&mut fetch.task).await {
                Ok(result) => result,
                Err(e) => Err(SnapshotLoadError::Transport {
                    path: String::new(),
                    message: format!("snapshot task failed: {}", e),
                }),
            };
            (fetch.ticket, result)
        },
        None => std::future::pending().await,
    }
}

/// Resolves with the first rejection among `watches`, removing that watch.
/// Watches that end any other way are dropped silently.
async fn wait_rejection(watches: &mut Vec<watch::Receiver<SubscriptionStatus>>) -> SubscriptionError {
    loop {
        if let Some(index) = watches.iter().position(|rx| rx.borrow().is_terminal()) {
            let status = watches.remove(index).borrow().clone();
            if let SubscriptionStatus::Rejected(err) = status {
                return err;
            }
            continue;
        }
        if watches.is_empty() {
            return std::future::pending().await;
        }
        let (changed, index, rest) =
            select_all(watches.iter_mut().map(|rx| Box::pin(rx.changed()))).await;
        drop(rest);
        if changed.is_err() {
            // Connection manager gone; the status can no longer change.
            watches.remove(index);
        }
    }
}

/// `None` when transitions were missed; the receiver is dropped once the
/// connection manager is gone.
async fn recv_transition(
    rx: &mut Option<broadcast::Receiver<StateTransition>>,
) -> Option<StateTransition> {
    let receiver = rx.as_mut()?;
    match receiver.recv().await {
        Ok(transition) => Some(transition),
        Err(broadcast::error::RecvError::Lagged(n)) => {
            log::warn!("[smartcity-link] Missed {} connection state transition(s)", n);
            None
        },
        Err(broadcast::error::RecvError::Closed) => {
            *rx = None;
            std::future::pending().await
        },
    }
}

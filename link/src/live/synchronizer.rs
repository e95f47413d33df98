//! Keyed, ordered collection kept consistent with snapshots and deltas.
//!
//! Pure and synchronous: the owning [`LiveCollection`](crate::LiveCollection)
//! feeds it snapshot results and delta events from a single task.
//!
//! Merge rule for one event, given the visible statuses:
//! - visible status: update the entry in place, or insert it per the
//!   insert policy
//! - anything else, including `DELETED`: remove the entry if present
//!
//! While a snapshot fetch is in flight, events are buffered. When the
//! snapshot lands, buffered events received at or after the fetch start are
//! replayed in order and older ones are discarded, because the snapshot
//! already reflects them.

use crate::{
    error::{LinkError, MalformedEventError},
    models::{
        CollectionEntry, DeltaEvent, EntityRecord, InsertPolicy, VisibleStatusSet,
        STATUS_DELETED,
    },
};
use chrono::{DateTime, Utc};
use std::collections::VecDeque;

/// Result of applying one delta event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    Inserted { index: usize },
    Updated { index: usize },
    Removed { index: usize },
    /// The collection already reflected the event.
    Unchanged,
    /// Held until the pending snapshot lands.
    Buffered,
    /// Older than the loaded snapshot, or arrived after detach.
    Stale,
}

impl MergeOutcome {
    pub fn changed(self) -> bool {
        matches!(
            self,
            Self::Inserted { .. } | Self::Updated { .. } | Self::Removed { .. }
        )
    }
}

/// Token for one snapshot fetch. Only the newest ticket can complete.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnapshotTicket {
    pub generation: u64,
    pub fetch_started_at: DateTime<Utc>,
}

/// What `complete_snapshot` did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplaySummary {
    pub generation: u64,
    pub entries: usize,
    pub replayed: usize,
    pub discarded: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    /// No snapshot requested yet; deltas apply directly.
    Empty,
    Fetching(SnapshotTicket),
    /// Last fetch failed; keep buffering until the next ticket.
    Failed,
    /// Snapshot taken at `baseline` is loaded.
    Live { baseline: Option<DateTime<Utc>> },
    Detached,
}

#[derive(Debug)]
pub struct LiveCollectionSynchronizer {
    visible: VisibleStatusSet,
    policy: InsertPolicy,
    max_buffered: usize,
    entries: Vec<CollectionEntry>,
    generation: u64,
    phase: Phase,
    /// Survives failed fetches; replay filters on `received_at` alone.
    buffer: VecDeque<DeltaEvent>,
    dropped_from_buffer: u64,
    rejected: u64,
    last_error: Option<MalformedEventError>,
}

impl LiveCollectionSynchronizer {
    pub fn new(visible: VisibleStatusSet, policy: InsertPolicy, max_buffered: usize) -> Self {
        Self {
            visible,
            policy,
            max_buffered: max_buffered.max(1),
            entries: Vec::new(),
            generation: 0,
            phase: Phase::Empty,
            buffer: VecDeque::new(),
            dropped_from_buffer: 0,
            rejected: 0,
            last_error: None,
        }
    }

    /// Replace the collection wholesale and advance the generation.
    ///
    /// Any in-flight ticket becomes stale.
    pub fn load_snapshot(&mut self, items: Vec<EntityRecord>) -> u64 {
        self.generation += 1;
        self.replace_entries(items);
        self.buffer.clear();
        self.phase = Phase::Live { baseline: None };
        self.generation
    }

    /// Record a fetch started at `fetch_started_at`. Deltas are buffered
    /// until the returned ticket completes.
    pub fn begin_snapshot(&mut self, fetch_started_at: DateTime<Utc>) -> SnapshotTicket {
        self.generation += 1;
        let ticket = SnapshotTicket {
            generation: self.generation,
            fetch_started_at,
        };
        self.phase = Phase::Fetching(ticket);
        ticket
    }

    /// Load the snapshot for `ticket` and replay the buffer.
    pub fn complete_snapshot(
        &mut self,
        ticket: SnapshotTicket,
        items: Vec<EntityRecord>,
    ) -> Result<ReplaySummary, LinkError> {
        if self.phase != Phase::Fetching(ticket) {
            return Err(LinkError::StaleSnapshot {
                generation: ticket.generation,
                current: self.generation,
            });
        }

        self.replace_entries(items);
        self.phase = Phase::Live {
            baseline: Some(ticket.fetch_started_at),
        };

        let mut replayed = 0;
        let mut discarded = 0;
        while let Some(event) = self.buffer.pop_front() {
            if event.received_at >= ticket.fetch_started_at {
                self.merge(&event);
                replayed += 1;
            } else {
                discarded += 1;
            }
        }
        if replayed + discarded > 0 {
            log::debug!(
                "[smartcity-link] Snapshot gen {}: replayed {} buffered event(s), discarded {}",
                ticket.generation,
                replayed,
                discarded
            );
        }

        Ok(ReplaySummary {
            generation: ticket.generation,
            entries: self.entries.len(),
            replayed,
            discarded,
        })
    }

    /// Mark `ticket` failed. Buffered events wait for the next ticket.
    ///
    /// Returns `false` if the ticket was already stale.
    pub fn fail_snapshot(&mut self, ticket: SnapshotTicket) -> bool {
        if self.phase != Phase::Fetching(ticket) {
            return false;
        }
        self.phase = Phase::Failed;
        true
    }

    /// Stop tracking: in-flight tickets go stale and later events are ignored.
    pub fn detach(&mut self) {
        self.generation += 1;
        self.buffer.clear();
        self.phase = Phase::Detached;
    }

    pub fn apply_delta(&mut self, event: DeltaEvent) -> Result<MergeOutcome, MalformedEventError> {
        if event.entity_id.trim().is_empty() {
            let err = MalformedEventError::MissingEntityId {
                topic: event.topic.clone(),
            };
            self.rejected += 1;
            self.last_error = Some(err.clone());
            return Err(err);
        }

        match self.phase {
            Phase::Detached => Ok(MergeOutcome::Stale),
            Phase::Fetching(_) | Phase::Failed => {
                self.push_buffer(event);
                Ok(MergeOutcome::Buffered)
            },
            Phase::Live {
                baseline: Some(baseline),
            } if event.received_at < baseline => Ok(MergeOutcome::Stale),
            Phase::Empty | Phase::Live { .. } => Ok(self.merge(&event)),
        }
    }

    /// Ordered view of the collection.
    pub fn collection(&self) -> &[CollectionEntry] {
        &self.entries
    }

    pub fn get(&self, id: &str) -> Option<&CollectionEntry> {
        self.entries.iter().find(|e| e.id == id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// `true` while a fetch is in flight.
    pub fn is_pending(&self) -> bool {
        matches!(self.phase, Phase::Fetching(_))
    }

    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }

    /// Buffered events dropped because the buffer was full.
    pub fn dropped_from_buffer(&self) -> u64 {
        self.dropped_from_buffer
    }

    pub fn rejected_count(&self) -> u64 {
        self.rejected
    }

    pub fn last_error(&self) -> Option<&MalformedEventError> {
        self.last_error.as_ref()
    }

    fn is_visible(&self, status: &str) -> bool {
        !status.eq_ignore_ascii_case(STATUS_DELETED) && self.visible.contains(status)
    }

    fn position(&self, id: &str) -> Option<usize> {
        self.entries.iter().position(|e| e.id == id)
    }

    /// Visible items only, de-duplicated by id: a later duplicate overwrites
    /// the earlier one in the earlier one's position.
    fn replace_entries(&mut self, items: Vec<EntityRecord>) {
        self.entries.clear();
        for record in items {
            if record.id().trim().is_empty() {
                log::warn!("[smartcity-link] Skipping snapshot item without id");
                continue;
            }
            if !self.is_visible(record.status()) {
                continue;
            }
            let entry = CollectionEntry::from_record(record);
            match self.position(&entry.id) {
                Some(i) => self.entries[i] = entry,
                None => self.entries.push(entry),
            }
        }
    }

    fn merge(&mut self, event: &DeltaEvent) -> MergeOutcome {
        let pos = self.position(&event.entity_id);
        if !self.is_visible(&event.status) {
            return match pos {
                Some(index) => {
                    self.entries.remove(index);
                    MergeOutcome::Removed { index }
                },
                None => MergeOutcome::Unchanged,
            };
        }

        match pos {
            Some(index) => {
                let entry = &mut self.entries[index];
                if entry.status == event.status && entry.record == event.payload {
                    return MergeOutcome::Unchanged;
                }
                entry.status = event.status.clone();
                entry.record = event.payload.clone();
                MergeOutcome::Updated { index }
            },
            None => {
                let entry = CollectionEntry {
                    id: event.entity_id.clone(),
                    status: event.status.clone(),
                    record: event.payload.clone(),
                };
                let index = match self.policy {
                    InsertPolicy::Append => {
                        self.entries.push(entry);
                        self.entries.len() - 1
                    },
                    InsertPolicy::Prepend => {
                        self.entries.insert(0, entry);
                        0
                    },
                };
                MergeOutcome::Inserted { index }
            },
        }
    }

    fn push_buffer(&mut self, event: DeltaEvent) {
        if self.buffer.len() >= self.max_buffered {
            self.buffer.pop_front();
            self.dropped_from_buffer += 1;
            log::warn!(
                "[smartcity-link] Delta buffer full ({} events); dropping oldest",
                self.max_buffered
            );
        }
        self.buffer.push_back(event);
    }
}

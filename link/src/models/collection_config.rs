use serde::{Deserialize, Serialize};

use super::visible_status::VisibleStatusSet;

/// Where newly visible entities land in a collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum InsertPolicy {
    #[default]
    Append,
    Prepend,
}

/// REST endpoints that make up one collection's baseline.
///
/// Results of all paths are concatenated in order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotSource {
    /// Paths relative to the server base URL, e.g. `/api/requests/my`.
    pub paths: Vec<String>,
    /// Field holding the array when the response is an object.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub envelope: Option<String>,
}

impl SnapshotSource {
    pub fn path(path: impl Into<String>) -> Self {
        Self {
            paths: vec![path.into()],
            envelope: None,
        }
    }

    pub fn paths<I, S>(paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            paths: paths.into_iter().map(Into::into).collect(),
            envelope: None,
        }
    }

    pub fn with_envelope(mut self, field: impl Into<String>) -> Self {
        self.envelope = Some(field.into());
        self
    }
}

fn default_resync_on_reconnect() -> bool {
    true
}

fn default_max_buffered_events() -> usize {
    10_000
}

/// Everything a [`LiveCollection`](crate::LiveCollection) needs to know
/// about one consumer view.
///
/// # Example
///
/// ```rust
/// use smartcity_link::{CollectionConfig, InsertPolicy};
///
/// let config = CollectionConfig::moderation_queue();
/// assert_eq!(config.insert_policy, InsertPolicy::Prepend);
/// assert!(config.visible.contains("pending"));
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionConfig {
    /// Label used in log lines.
    pub name: String,
    pub topics: Vec<String>,
    pub source: SnapshotSource,
    pub visible: VisibleStatusSet,
    #[serde(default)]
    pub insert_policy: InsertPolicy,
    /// Drop request events owned by someone else.
    #[serde(default)]
    pub owner_scope: Option<String>,
    /// Refetch the snapshot after the connection comes back.
    #[serde(default = "default_resync_on_reconnect")]
    pub resync_on_reconnect: bool,
    /// Bound on events buffered while a snapshot is in flight.
    #[serde(default = "default_max_buffered_events")]
    pub max_buffered_events: usize,
}

impl CollectionConfig {
    pub fn new(
        name: impl Into<String>,
        topics: Vec<String>,
        source: SnapshotSource,
        visible: VisibleStatusSet,
    ) -> Self {
        Self {
            name: name.into(),
            topics,
            source,
            visible,
            insert_policy: InsertPolicy::default(),
            owner_scope: None,
            resync_on_reconnect: default_resync_on_reconnect(),
            max_buffered_events: default_max_buffered_events(),
        }
    }

    /// Approved businesses shown on the public home page.
    pub fn public_listing() -> Self {
        Self::new(
            "public-listing",
            vec!["/topic/requests".to_string()],
            SnapshotSource::path("/api/requests/approved/public"),
            VisibleStatusSet::new(["APPROVED"]),
        )
    }

    /// Moderator view over every request, newest first.
    pub fn moderation_queue() -> Self {
        Self::new(
            "moderation-queue",
            vec!["/topic/requests".to_string()],
            SnapshotSource::paths([
                "/api/requests/pending",
                "/api/requests/approved",
                "/api/requests/rejected",
            ]),
            VisibleStatusSet::new(["PENDING", "APPROVED", "REJECTED"]),
        )
        .with_insert_policy(InsertPolicy::Prepend)
    }

    /// An owner's own submissions.
    pub fn owner_requests(owner_id: impl Into<String>) -> Self {
        Self::new(
            "owner-requests",
            vec!["/topic/requests".to_string()],
            SnapshotSource::path("/api/requests/my"),
            VisibleStatusSet::new(["PENDING", "APPROVED", "REJECTED"]),
        )
        .with_owner_scope(owner_id)
    }

    /// The conversation between one owner and the moderators.
    pub fn conversation(owner_id: &str) -> Self {
        Self::new(
            format!("conversation-{}", owner_id),
            vec![format!("/topic/conversations/{}", owner_id)],
            SnapshotSource::path(format!("/api/conversations/{}", owner_id))
                .with_envelope("messages"),
            VisibleStatusSet::new(["SENT"]),
        )
    }

    pub fn categories() -> Self {
        Self::new(
            "categories",
            vec!["/topic/categories".to_string()],
            SnapshotSource::path("/api/categories"),
            VisibleStatusSet::new(["ACTIVE"]),
        )
    }

    pub fn with_insert_policy(mut self, policy: InsertPolicy) -> Self {
        self.insert_policy = policy;
        self
    }

    pub fn with_owner_scope(mut self, owner_id: impl Into<String>) -> Self {
        self.owner_scope = Some(owner_id.into());
        self
    }

    pub fn with_resync_on_reconnect(mut self, enabled: bool) -> Self {
        self.resync_on_reconnect = enabled;
        self
    }

    pub fn with_max_buffered_events(mut self, max: usize) -> Self {
        self.max_buffered_events = max;
        self
    }
}

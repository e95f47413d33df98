use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// Status the portal assigns to a freshly submitted request.
pub const STATUS_PENDING: &str = "PENDING";
/// Status every conversation message carries unless told otherwise.
pub const STATUS_SENT: &str = "SENT";
/// Status every category carries unless told otherwise.
pub const STATUS_ACTIVE: &str = "ACTIVE";
/// Explicit deletion signal, always removes the entry.
pub const STATUS_DELETED: &str = "DELETED";

fn default_pending() -> String {
    STATUS_PENDING.to_string()
}

fn default_sent() -> String {
    STATUS_SENT.to_string()
}

fn default_active() -> String {
    STATUS_ACTIVE.to_string()
}

/// A business or service request submitted by an owner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceRequest {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub address: Option<String>,
    /// Set by a moderator when approving.
    #[serde(default)]
    pub lat: Option<f64>,
    #[serde(default)]
    pub lng: Option<f64>,
    #[serde(default = "default_pending")]
    pub status: String,
    #[serde(default)]
    pub owner_id: Option<String>,
    #[serde(default)]
    pub comments: Option<String>,
    #[serde(default)]
    pub documents: Vec<String>,
}

/// One message of an owner/moderator conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationMessage {
    /// Messages are stored inline in their conversation and have no id of
    /// their own on the wire; see [`ConversationMessage::derived_id`].
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub sender_id: Option<String>,
    #[serde(default)]
    pub sender_role: Option<String>,
    #[serde(default)]
    pub content: String,
    /// ISO-8601 local date-time as serialized by the server.
    #[serde(default)]
    pub timestamp: Option<String>,
    #[serde(default = "default_sent")]
    pub status: String,
}

impl ConversationMessage {
    /// `senderId@timestamp`, unique within one conversation.
    pub fn derived_id(&self) -> Option<String> {
        match (&self.sender_id, &self.timestamp) {
            (Some(sender), Some(ts)) if !sender.is_empty() && !ts.is_empty() => {
                Some(format!("{}@{}", sender, ts))
            },
            _ => None,
        }
    }
}

/// A listing category.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Category {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default = "default_active")]
    pub status: String,
}

/// Discriminant of [`EntityRecord`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Request,
    Message,
    Category,
}

impl EntityKind {
    /// Kind carried by a topic when the payload has no `kind` field.
    ///
    /// `/topic/requests` carries requests, `/topic/conversations/<owner>`
    /// carries messages and `/topic/categories` carries categories.
    pub fn for_topic(topic: &str) -> Option<Self> {
        let mut parts = topic.trim_start_matches('/').split('/');
        if parts.next() != Some("topic") {
            return None;
        }
        match parts.next()? {
            "requests" => Some(Self::Request),
            "conversations" => Some(Self::Message),
            "categories" => Some(Self::Category),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Request => "request",
            Self::Message => "message",
            Self::Category => "category",
        }
    }
}

/// A pushed or fetched entity, tagged by kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EntityRecord {
    Request(ServiceRequest),
    Message(ConversationMessage),
    Category(Category),
}

impl EntityRecord {
    /// Parse a JSON value, injecting `kind` when the wire body has none.
    ///
    /// Ids are trimmed. Conversation messages without an `id` get their
    /// derived id.
    pub fn from_value(
        mut value: JsonValue,
        kind: Option<EntityKind>,
    ) -> Result<Self, serde_json::Error> {
        if let (JsonValue::Object(map), Some(kind)) = (&mut value, kind) {
            map.entry("kind")
                .or_insert_with(|| JsonValue::String(kind.as_str().to_string()));
        }
        let mut record: EntityRecord = serde_json::from_value(value)?;
        record.normalize_id();
        if let EntityRecord::Message(msg) = &mut record {
            if msg.id.is_empty() {
                if let Some(id) = msg.derived_id() {
                    msg.id = id;
                }
            }
        }
        record.normalize_status();
        Ok(record)
    }

    pub fn kind(&self) -> EntityKind {
        match self {
            Self::Request(_) => EntityKind::Request,
            Self::Message(_) => EntityKind::Message,
            Self::Category(_) => EntityKind::Category,
        }
    }

    pub fn id(&self) -> &str {
        match self {
            Self::Request(r) => &r.id,
            Self::Message(m) => &m.id,
            Self::Category(c) => &c.id,
        }
    }

    /// Upper-cased status.
    pub fn status(&self) -> &str {
        match self {
            Self::Request(r) => &r.status,
            Self::Message(m) => &m.status,
            Self::Category(c) => &c.status,
        }
    }

    /// Owner of the entity, for requests only.
    pub fn owner_id(&self) -> Option<&str> {
        match self {
            Self::Request(r) => r.owner_id.as_deref(),
            _ => None,
        }
    }

    fn normalize_id(&mut self) {
        let id = match self {
            Self::Request(r) => &mut r.id,
            Self::Message(m) => &mut m.id,
            Self::Category(c) => &mut c.id,
        };
        if id.trim().len() != id.len() {
            *id = id.trim().to_string();
        }
    }

    fn normalize_status(&mut self) {
        let (status, fallback) = match self {
            Self::Request(r) => (&mut r.status, STATUS_PENDING),
            Self::Message(m) => (&mut m.status, STATUS_SENT),
            Self::Category(c) => (&mut c.status, STATUS_ACTIVE),
        };
        let normalized = status.trim().to_ascii_uppercase();
        *status = if normalized.is_empty() {
            fallback.to_string()
        } else {
            normalized
        };
    }
}

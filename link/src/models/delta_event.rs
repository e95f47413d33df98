use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;

use super::entity::{EntityKind, EntityRecord};
use crate::error::MalformedEventError;

/// An asynchronous update pushed for one entity.
///
/// Only [`DeltaEvent::decode`] builds events from wire data, so every event
/// past the transport boundary has a non-empty `entity_id`.
#[derive(Debug, Clone, PartialEq)]
pub struct DeltaEvent {
    pub topic: String,
    pub entity_id: String,
    /// Upper-cased status, e.g. `APPROVED` or `DELETED`.
    pub status: String,
    pub payload: EntityRecord,
    /// Local receive time, compared against snapshot fetch start times.
    pub received_at: DateTime<Utc>,
}

impl DeltaEvent {
    /// Decode a MESSAGE body received on `topic`.
    pub fn decode(
        topic: &str,
        body: &str,
        received_at: DateTime<Utc>,
    ) -> Result<Self, MalformedEventError> {
        let value: JsonValue =
            serde_json::from_str(body).map_err(|e| MalformedEventError::InvalidJson {
                topic: topic.to_string(),
                reason: e.to_string(),
            })?;
        if !value.is_object() {
            return Err(MalformedEventError::InvalidPayload {
                topic: topic.to_string(),
                reason: "expected a JSON object".to_string(),
            });
        }

        let kind = EntityKind::for_topic(topic);
        if kind.is_none() && value.get("kind").is_none() {
            return Err(MalformedEventError::UnknownTopic {
                topic: topic.to_string(),
            });
        }

        let payload = EntityRecord::from_value(value, kind).map_err(|e| {
            MalformedEventError::InvalidPayload {
                topic: topic.to_string(),
                reason: e.to_string(),
            }
        })?;
        Self::from_record(topic, payload, received_at)
    }

    /// Wrap an already-parsed record, enforcing the non-empty id rule.
    pub fn from_record(
        topic: &str,
        payload: EntityRecord,
        received_at: DateTime<Utc>,
    ) -> Result<Self, MalformedEventError> {
        let entity_id = payload.id().trim().to_string();
        if entity_id.is_empty() {
            return Err(MalformedEventError::MissingEntityId {
                topic: topic.to_string(),
            });
        }
        Ok(Self {
            topic: topic.to_string(),
            entity_id,
            status: payload.status().to_string(),
            payload,
            received_at,
        })
    }
}

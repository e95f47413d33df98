use serde::{Deserialize, Serialize};

use super::entity::EntityRecord;

/// One materialized row of a live collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionEntry {
    pub id: String,
    pub status: String,
    pub record: EntityRecord,
}

impl CollectionEntry {
    /// `id` is the record id with surrounding whitespace removed, the same
    /// key [`DeltaEvent`](super::DeltaEvent) uses.
    pub fn from_record(record: EntityRecord) -> Self {
        Self {
            id: record.id().trim().to_string(),
            status: record.status().to_string(),
            record,
        }
    }
}

//! Data models for smartcity-link.
//!
//! Entities pushed and fetched from the portal, the delta event envelope,
//! per-consumer collection configuration and connection options.

pub mod collection_config;
pub mod collection_entry;
pub mod connection_options;
pub mod connection_state;
pub mod delta_event;
pub mod entity;
pub mod visible_status;


pub use collection_config::{CollectionConfig, InsertPolicy, SnapshotSource};
pub use collection_entry::CollectionEntry;
pub use connection_options::{BackoffPolicy, ConnectionOptions};
pub use connection_state::{ConnectionState, StateTransition};
pub use delta_event::DeltaEvent;
pub use entity::{
    Category, ConversationMessage, EntityKind, EntityRecord, ServiceRequest, STATUS_ACTIVE,
    STATUS_DELETED, STATUS_PENDING, STATUS_SENT,
};
pub use visible_status::VisibleStatusSet;

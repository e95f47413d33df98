//! # smartcity-link
//!
//! Client-side data layer for the SmartCity municipal-services portal.
//!
//! Keeps in-memory collections of service requests, conversation messages,
//! approved-business listings and categories consistent with the server by
//! combining REST snapshots with delta events pushed over STOMP/WebSocket.
//!
//! ## Pieces
//!
//! - [`ConnectionManager`]: one background task owning the push connection,
//!   with auto-reconnect, keepalive and re-subscription after every connect
//! - [`SubscriptionHandle`]: returned by every subscribe, connected or not
//! - [`EventBus`]: in-process fan-out so many views share one subscription
//! - [`LiveCollectionSynchronizer`]: status-driven merge of snapshots and
//!   deltas, with generation-token buffering while a fetch is in flight
//! - [`LiveCollection`]: consumer-owned view driven by `next().await`
//! - [`LinkClient`]: wires it all together
//!
//! ## Example
//!
//! ```rust,no_run
//! use smartcity_link::{CollectionChange, CollectionConfig, LinkClient};
//!
//! # async fn example() -> smartcity_link::Result<()> {
//! let client = LinkClient::builder()
//!     .base_url("http://localhost:8080")
//!     .jwt_token("eyJhbGc...")
//!     .build()?;
//! client.connect()?;
//!
//! let mut mine = client
//!     .open_collection(CollectionConfig::owner_requests("owner-42"))
//!     .await?;
//! while let Some(change) = mine.next().await {
//!     if let Ok(CollectionChange::Delta { entity_id, .. }) = change {
//!         println!("request {} changed", entity_id);
//!     }
//! }
//! # Ok(())
//! # }
//! ```

pub mod auth;
pub mod client;
pub mod config;
pub mod connection;
pub mod error;
pub mod event_bus;
pub mod event_handlers;
pub mod live;
pub mod models;
pub mod stomp;
pub mod subscription;
pub mod timeouts;

pub use auth::AuthProvider;
pub use client::{LinkClient, LinkClientBuilder, TopicAttachment};
pub use config::LinkConfig;
pub use connection::{
    resolve_ws_url, ConnectionManager, Connector, Transport, WireMessage, WsConnector,
};
pub use error::{
    ConnectionError, LinkError, MalformedEventError, Result, SnapshotLoadError, SubscriptionError,
};
pub use event_bus::{AttachToken, EventBus};
pub use event_handlers::{DisconnectReason, EventHandlers};
pub use live::{
    CollectionChange, HttpSnapshotFetcher, LiveCollection, LiveCollectionSynchronizer,
    MergeOutcome, ReplaySummary, SnapshotFetcher, SnapshotTicket,
};
pub use models::{
    BackoffPolicy, Category, CollectionConfig, CollectionEntry, ConnectionOptions,
    ConnectionState, ConversationMessage, DeltaEvent, EntityKind, EntityRecord, InsertPolicy,
    ServiceRequest, SnapshotSource, StateTransition, VisibleStatusSet,
};
pub use stomp::{StompCommand, StompFrame};
pub use subscription::{SubscriptionHandle, SubscriptionStatus, TopicHandler, TopicInfo};
pub use timeouts::{Heartbeat, LinkTimeouts, LinkTimeoutsBuilder};

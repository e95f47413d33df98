//! Main smartcity-link client with builder pattern.
//!
//! Wires one [`ConnectionManager`], one [`EventBus`] and a snapshot fetcher
//! together and hands out [`LiveCollection`]s.

use crate::{
    auth::AuthProvider,
    connection::{ConnectionManager, Connector, WsConnector},
    error::{LinkError, Result},
    event_bus::{AttachToken, EventBus},
    event_handlers::EventHandlers,
    live::{HttpSnapshotFetcher, LiveCollection, SnapshotFetcher},
    models::{CollectionConfig, ConnectionOptions, DeltaEvent},
    subscription::{SubscriptionHandle, TopicInfo},
    timeouts::LinkTimeouts,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Main smartcity-link client.
///
/// Use [`LinkClientBuilder`] to construct instances. Cloning is cheap; all
/// clones share the same push connection.
///
/// # Examples
///
/// ```rust,no_run
/// use smartcity_link::{CollectionConfig, LinkClient};
///
/// # async fn example() -> smartcity_link::Result<()> {
/// let client = LinkClient::builder()
///     .base_url("http://localhost:8080")
///     .jwt_token("eyJhbGc...")
///     .build()?;
/// client.connect()?;
///
/// let mut queue = client.open_collection(CollectionConfig::moderation_queue()).await?;
/// queue.next().await;
/// println!("{} requests to review", queue.collection().len());
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct LinkClient {
    base_url: String,
    connection: Arc<ConnectionManager>,
    topics: Arc<TopicRegistry>,
    fetcher: Arc<dyn SnapshotFetcher>,
    timeouts: LinkTimeouts,
}

impl std::fmt::Debug for LinkClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LinkClient")
            .field("base_url", &self.base_url)
            .field("state", &self.connection.current_state())
            .field("timeouts", &self.timeouts)
            .finish()
    }
}

impl LinkClient {
    /// Create a new builder for configuring the client
    pub fn builder() -> LinkClientBuilder {
        LinkClientBuilder::new()
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Get the configured timeouts
    pub fn timeouts(&self) -> &LinkTimeouts {
        &self.timeouts
    }

    /// The shared push connection.
    pub fn connection(&self) -> &Arc<ConnectionManager> {
        &self.connection
    }

    pub fn event_bus(&self) -> &Arc<EventBus> {
        &self.topics.bus
    }

    /// Open the push connection. Reconnects automatically afterwards.
    pub fn connect(&self) -> Result<()> {
        self.connection.connect()
    }

    /// Close the push connection. Open collections keep their topics and
    /// resume on the next [`connect`](Self::connect).
    pub async fn disconnect(&self) -> Result<()> {
        self.connection.disconnect().await
    }

    /// Subscribe directly on the connection, bypassing the event bus.
    pub async fn subscribe<F>(&self, topic: &str, handler: F) -> Result<SubscriptionHandle>
    where
        F: Fn(&DeltaEvent) + Send + Sync + 'static,
    {
        self.connection.subscribe(topic, handler).await
    }

    /// Attach `handler` to `topic` through the event bus.
    ///
    /// The first attachment of a topic subscribes on the connection; the
    /// last one to detach cancels.
    pub async fn attach<F>(&self, topic: &str, handler: F) -> Result<TopicAttachment>
    where
        F: Fn(&DeltaEvent) + Send + Sync + 'static,
    {
        TopicRegistry::attach(&self.topics, topic, handler).await
    }

    /// Registered transport subscriptions in subscribe order.
    pub async fn active_topics(&self) -> Vec<TopicInfo> {
        self.connection.active_topics().await
    }

    /// Attach to every topic of `config` and start the first snapshot fetch.
    pub async fn open_collection(&self, config: CollectionConfig) -> Result<LiveCollection> {
        if config.visible.is_empty() {
            return Err(LinkError::ConfigurationError(format!(
                "collection '{}' has no visible statuses",
                config.name
            )));
        }

        // Subscribe to transitions before attaching so no reconnect is missed.
        let state_rx = self.connection.on_state_change();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let mut attachments = Vec::with_capacity(config.topics.len());
        for topic in &config.topics {
            let tx = events_tx.clone();
            let attachment = self
                .attach(topic, move |event: &DeltaEvent| {
                    let _ = tx.send(event.clone());
                })
                .await?;
            attachments.push(attachment);
        }

        log::debug!(
            "[smartcity-link] Opened collection '{}' on {} topic(s)",
            config.name,
            attachments.len()
        );

        let mut collection = LiveCollection::new(
            config,
            self.fetcher.clone(),
            self.timeouts.snapshot_timeout,
            events_rx,
            attachments,
            state_rx,
        );
        collection.refresh();
        Ok(collection)
    }
}

/// Reference-counts event bus attachments per topic and owns the single
/// transport subscription behind them.
pub(crate) struct TopicRegistry {
    connection: Arc<ConnectionManager>,
    bus: Arc<EventBus>,
    handles: Mutex<HashMap<String, SubscriptionHandle>>,
}

impl TopicRegistry {
    fn new(connection: Arc<ConnectionManager>) -> Self {
        Self {
            connection,
            bus: Arc::new(EventBus::new()),
            handles: Mutex::new(HashMap::new()),
        }
    }

    async fn attach<F>(registry: &Arc<Self>, topic: &str, handler: F) -> Result<TopicAttachment>
    where
        F: Fn(&DeltaEvent) + Send + Sync + 'static,
    {
        if topic.trim().is_empty() {
            return Err(LinkError::ConfigurationError("topic must not be empty".into()));
        }

        let (token, existing) = {
            let handles = registry.handles.lock();
            let token = registry.bus.attach(topic, handler);
            let existing = handles
                .get(topic)
                .filter(|h| !h.status().is_terminal())
                .cloned();
            (token, existing)
        };

        let mut attachment = TopicAttachment {
            registry: registry.clone(),
            token: Some(token),
            subscription: existing,
        };
        if attachment.subscription.is_some() {
            return Ok(attachment);
        }

        let bus = Arc::downgrade(&registry.bus);
        let bus_topic = topic.to_string();
        let handle = registry
            .connection
            .subscribe(topic, move |event: &DeltaEvent| {
                if let Some(bus) = bus.upgrade() {
                    bus.publish(&bus_topic, event);
                }
            })
            .await?;
        log::debug!(
            "[smartcity-link] Topic {} subscribed (gen {})",
            topic,
            handle.generation()
        );
        registry
            .handles
            .lock()
            .insert(topic.to_string(), handle.clone());
        attachment.subscription = Some(handle);
        Ok(attachment)
    }

    fn detach(&self, token: &AttachToken) {
        let mut handles = self.handles.lock();
        if !self.bus.detach(token) {
            return;
        }
        if self.bus.handler_count(token.topic()) == 0 {
            if let Some(handle) = handles.remove(token.topic()) {
                log::debug!(
                    "[smartcity-link] Last consumer of {} left, unsubscribing",
                    token.topic()
                );
                handle.cancel();
            }
        }
    }

    #[cfg(test)]
    fn has_subscription(&self, topic: &str) -> bool {
        self.handles.lock().contains_key(topic)
    }
}

/// One consumer's attachment to a topic. Detaches on drop.
pub struct TopicAttachment {
    registry: Arc<TopicRegistry>,
    token: Option<AttachToken>,
    subscription: Option<SubscriptionHandle>,
}

impl std::fmt::Debug for TopicAttachment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TopicAttachment")
            .field("topic", &self.topic())
            .field("attached", &self.token.is_some())
            .finish()
    }
}

impl TopicAttachment {
    pub fn topic(&self) -> Option<&str> {
        self.token.as_ref().map(|t| t.topic())
    }

    /// The transport subscription shared by every attachment of this topic.
    pub fn subscription(&self) -> Option<&SubscriptionHandle> {
        self.subscription.as_ref()
    }

    pub fn detach(&mut self) {
        if let Some(token) = self.token.take() {
            self.registry.detach(&token);
        }
    }
}

impl Drop for TopicAttachment {
    fn drop(&mut self) {
        self.detach();
    }
}

/// Builder for configuring [`LinkClient`] instances.
pub struct LinkClientBuilder {
    base_url: Option<String>,
    auth: AuthProvider,
    timeouts: LinkTimeouts,
    connection_options: ConnectionOptions,
    event_handlers: EventHandlers,
    connector: Option<Arc<dyn Connector>>,
    snapshot_fetcher: Option<Arc<dyn SnapshotFetcher>>,
}

impl Default for LinkClientBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl LinkClientBuilder {
    fn new() -> Self {
        Self {
            base_url: None,
            auth: AuthProvider::none(),
            timeouts: LinkTimeouts::default(),
            connection_options: ConnectionOptions::default(),
            event_handlers: EventHandlers::default(),
            connector: None,
            snapshot_fetcher: None,
        }
    }

    /// Set the base URL of the portal backend, e.g. `http://localhost:8080`
    pub fn base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = Some(url.into());
        self
    }

    /// Set JWT token authentication
    pub fn jwt_token(mut self, token: impl Into<String>) -> Self {
        self.auth = AuthProvider::jwt_token(token.into());
        self
    }

    /// Set authentication provider directly
    pub fn auth(mut self, auth: AuthProvider) -> Self {
        self.auth = auth;
        self
    }

    /// Set timeout configuration for all operations
    ///
    /// # Example
    ///
    /// ```rust,no_run
    /// use smartcity_link::{LinkClient, LinkTimeouts};
    ///
    /// # async fn example() -> smartcity_link::Result<()> {
    /// let client = LinkClient::builder()
    ///     .base_url("http://localhost:8080")
    ///     .timeouts(LinkTimeouts::fast())
    ///     .build()?;
    /// # Ok(())
    /// # }
    /// ```
    pub fn timeouts(mut self, timeouts: LinkTimeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    /// Set reconnection behavior and the WebSocket path
    pub fn connection_options(mut self, options: ConnectionOptions) -> Self {
        self.connection_options = options;
        self
    }

    /// Set connection lifecycle handlers
    pub fn event_handlers(mut self, handlers: EventHandlers) -> Self {
        self.event_handlers = handlers;
        self
    }

    /// Replace the WebSocket connector, e.g. with an in-memory transport.
    pub fn connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = Some(connector);
        self
    }

    /// Replace the REST snapshot fetcher.
    pub fn snapshot_fetcher(mut self, fetcher: Arc<dyn SnapshotFetcher>) -> Self {
        self.snapshot_fetcher = Some(fetcher);
        self
    }

    /// Build the client and start its (idle) connection task.
    ///
    /// Must be called inside a tokio runtime.
    pub fn build(self) -> Result<LinkClient> {
        let base_url = self
            .base_url
            .ok_or_else(|| LinkError::ConfigurationError("base_url is required".into()))?;
        let base_url = base_url.trim_end_matches('/').to_string();
        self.connection_options.validate()?;

        let parsed = url::Url::parse(&base_url).map_err(|e| {
            LinkError::ConfigurationError(format!("Invalid base_url '{}': {}", base_url, e))
        })?;
        let stomp_host = parsed
            .host_str()
            .ok_or_else(|| {
                LinkError::ConfigurationError(format!("base_url '{}' has no host", base_url))
            })?
            .to_string();

        if tokio::runtime::Handle::try_current().is_err() {
            return Err(LinkError::ConfigurationError(
                "LinkClient must be built inside a tokio runtime".into(),
            ));
        }

        let connector: Arc<dyn Connector> = match self.connector {
            Some(connector) => connector,
            None => Arc::new(WsConnector::new(&base_url, &self.connection_options)?),
        };

        let fetcher: Arc<dyn SnapshotFetcher> = match self.snapshot_fetcher {
            Some(fetcher) => fetcher,
            None => {
                let mut client_builder = reqwest::Client::builder()
                    .pool_max_idle_per_host(10)
                    .pool_idle_timeout(Duration::from_secs(90));
                if !LinkTimeouts::is_no_timeout(self.timeouts.connection_timeout) {
                    client_builder = client_builder.connect_timeout(self.timeouts.connection_timeout);
                }
                let http_client = client_builder
                    .build()
                    .map_err(|e| LinkError::ConfigurationError(e.to_string()))?;
                Arc::new(HttpSnapshotFetcher::new(
                    base_url.clone(),
                    http_client,
                    self.auth.clone(),
                    self.timeouts.snapshot_timeout,
                ))
            },
        };

        let connection = Arc::new(ConnectionManager::spawn(
            connector,
            self.auth,
            stomp_host,
            self.connection_options,
            self.timeouts.clone(),
            self.event_handlers,
        ));

        Ok(LinkClient {
            base_url,
            topics: Arc::new(TopicRegistry::new(connection.clone())),
            connection,
            fetcher,
            timeouts: self.timeouts,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::subscription::SubscriptionStatus;

    #[test]
    fn test_builder_missing_url() {
        let result = LinkClient::builder().build();
        assert!(matches!(result, Err(LinkError::ConfigurationError(_))));
    }

    #[test]
    fn test_builder_requires_runtime() {
        let result = LinkClient::builder().base_url("http://localhost:8080").build();
        assert!(matches!(result, Err(LinkError::ConfigurationError(_))));
    }

    #[tokio::test]
    async fn test_builder_pattern() {
        let client = LinkClient::builder()
            .base_url("http://localhost:8080/")
            .jwt_token("test_token")
            .timeouts(LinkTimeouts::fast())
            .build()
            .unwrap();
        assert_eq!(client.base_url(), "http://localhost:8080");
        assert!(!client.connection().is_connected());
    }

    #[tokio::test]
    async fn test_builder_rejects_bad_url() {
        let result = LinkClient::builder().base_url("not a url").build();
        assert!(matches!(result, Err(LinkError::ConfigurationError(_))));
    }

    #[tokio::test]
    async fn test_attachments_share_one_subscription() {
        let client = LinkClient::builder()
            .base_url("http://localhost:8080")
            .build()
            .unwrap();

        let first = client.attach("/topic/requests", |_: &DeltaEvent| {}).await.unwrap();
        let mut second = client.attach("/topic/requests", |_: &DeltaEvent| {}).await.unwrap();
        assert_eq!(
            first.subscription().unwrap().generation(),
            second.subscription().unwrap().generation()
        );
        assert_eq!(client.event_bus().handler_count("/topic/requests"), 2);

        second.detach();
        assert!(client.topics.has_subscription("/topic/requests"));

        let handle = first.subscription().unwrap().clone();
        drop(first);
        assert!(!client.topics.has_subscription("/topic/requests"));
        assert_eq!(client.event_bus().handler_count("/topic/requests"), 0);

        // The cancel reaches the connection task asynchronously.
        let mut status = handle.status();
        for _ in 0..50 {
            if status == SubscriptionStatus::Cancelled {
                break;
            }
            tokio::task::yield_now().await;
            status = handle.status();
        }
        assert_eq!(status, SubscriptionStatus::Cancelled);
        assert!(client.active_topics().await.is_empty());
    }

    #[tokio::test]
    async fn test_open_collection_rejects_empty_visible_set() {
        let client = LinkClient::builder()
            .base_url("http://localhost:8080")
            .build()
            .unwrap();
        let mut config = CollectionConfig::categories();
        config.visible = crate::models::VisibleStatusSet::new(Vec::<String>::new());
        let err = client.open_collection(config).await.unwrap_err();
        assert!(matches!(err, LinkError::ConfigurationError(_)));
    }
}

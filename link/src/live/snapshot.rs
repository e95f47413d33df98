//! Baseline fetch for live collections.

use crate::{
    auth::AuthProvider,
    error::SnapshotLoadError,
    models::{EntityKind, EntityRecord, SnapshotSource},
    timeouts::LinkTimeouts,
};
use async_trait::async_trait;
use log::{debug, warn};
use serde_json::Value as JsonValue;
use std::time::{Duration, Instant};

/// Loads the point-in-time contents of a collection.
#[async_trait]
pub trait SnapshotFetcher: Send + Sync {
    async fn fetch(&self, source: &SnapshotSource) -> Result<Vec<EntityRecord>, SnapshotLoadError>;
}

/// `GET <base_url><path>` for every path of the source, over reqwest.
#[derive(Clone)]
pub struct HttpSnapshotFetcher {
    base_url: String,
    http_client: reqwest::Client,
    auth: AuthProvider,
    timeout: Duration,
}

impl HttpSnapshotFetcher {
    pub fn new(
        base_url: impl Into<String>,
        http_client: reqwest::Client,
        auth: AuthProvider,
        timeout: Duration,
    ) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http_client,
            auth,
            timeout,
        }
    }

    async fn fetch_path(
        &self,
        path: &str,
        envelope: Option<&str>,
    ) -> Result<Vec<EntityRecord>, SnapshotLoadError> {
        let url = format!("{}{}", self.base_url, path);
        let mut retries = 0;
        let max_retries = 3;
        let overall_start = Instant::now();

        loop {
            let mut req_builder = self.http_client.get(&url);
            if !LinkTimeouts::is_no_timeout(self.timeout) {
                req_builder = req_builder.timeout(self.timeout);
            }
            req_builder = self.auth.authorize(req_builder);

            debug!(
                "[smartcity-link] GET {} (attempt {}/{})",
                url,
                retries + 1,
                max_retries + 1
            );

            match req_builder.send().await {
                Ok(response) => {
                    let status = response.status();
                    if !status.is_success() {
                        let message = response
                            .text()
                            .await
                            .unwrap_or_else(|_| "Unknown error".to_string());
                        warn!(
                            "[smartcity-link] Snapshot fetch failed: status={} path={}",
                            status, path
                        );
                        return Err(SnapshotLoadError::Http {
                            path: path.to_string(),
                            status: status.as_u16(),
                            message,
                        });
                    }

                    let body: JsonValue = response.json().await.map_err(|e| {
                        SnapshotLoadError::Decode {
                            path: path.to_string(),
                            message: e.to_string(),
                        }
                    })?;
                    let records = decode_snapshot(path, body, envelope)?;
                    debug!(
                        "[smartcity-link] Snapshot {} loaded: {} item(s) in {}ms",
                        path,
                        records.len(),
                        overall_start.elapsed().as_millis()
                    );
                    return Ok(records);
                },
                Err(e) if retries < max_retries && Self::is_retriable(&e) => {
                    warn!(
                        "[smartcity-link] Retriable snapshot error (attempt {}/{}): {}",
                        retries + 1,
                        max_retries + 1,
                        e
                    );
                    retries += 1;
                    tokio::time::sleep(Duration::from_millis(100 * retries as u64)).await;
                    continue;
                },
                Err(e) if e.is_timeout() => {
                    return Err(SnapshotLoadError::Timeout {
                        path: path.to_string(),
                        timeout: self.timeout,
                    });
                },
                Err(e) => {
                    warn!(
                        "[smartcity-link] Snapshot fetch error: {} total_ms={}",
                        e,
                        overall_start.elapsed().as_millis()
                    );
                    return Err(SnapshotLoadError::Transport {
                        path: path.to_string(),
                        message: e.to_string(),
                    });
                },
            }
        }
    }

    fn is_retriable(err: &reqwest::Error) -> bool {
        err.is_timeout() || err.is_connect()
    }
}

#[async_trait]
impl SnapshotFetcher for HttpSnapshotFetcher {
    async fn fetch(&self, source: &SnapshotSource) -> Result<Vec<EntityRecord>, SnapshotLoadError> {
        let mut all = Vec::new();
        for path in &source.paths {
            let mut records = self.fetch_path(path, source.envelope.as_deref()).await?;
            all.append(&mut records);
        }
        Ok(all)
    }
}

/// Entity kind served by a REST path, e.g. `/api/requests/my`.
pub(crate) fn kind_for_path(path: &str) -> Option<EntityKind> {
    path.split(['/', '?'])
        .filter(|s| !s.is_empty())
        .find_map(|segment| match segment {
            "requests" => Some(EntityKind::Request),
            "conversations" | "messages" => Some(EntityKind::Message),
            "categories" => Some(EntityKind::Category),
            _ => None,
        })
}

/// Turn a response body into records.
///
/// The body is either an array or an object holding the array under
/// `envelope`.
pub(crate) fn decode_snapshot(
    path: &str,
    body: JsonValue,
    envelope: Option<&str>,
) -> Result<Vec<EntityRecord>, SnapshotLoadError> {
    let decode_err = |message: String| SnapshotLoadError::Decode {
        path: path.to_string(),
        message,
    };

    let items = match (body, envelope) {
        (JsonValue::Array(items), _) => items,
        (JsonValue::Object(mut map), Some(field)) => match map.remove(field) {
            Some(JsonValue::Array(items)) => items,
            Some(JsonValue::Null) | None => Vec::new(),
            Some(_) => return Err(decode_err(format!("'{}' is not an array", field))),
        },
        (JsonValue::Null, _) => Vec::new(),
        _ => return Err(decode_err("expected a JSON array".to_string())),
    };

    let kind = kind_for_path(path);
    items
        .into_iter()
        .map(|item| EntityRecord::from_value(item, kind).map_err(|e| decode_err(e.to_string())))
        .collect()
}

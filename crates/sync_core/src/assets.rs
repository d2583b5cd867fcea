use std::{collections::HashMap, sync::Arc, time::Duration};

use anyhow::Result;
use async_trait::async_trait;
use reqwest::Client;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::transport::http_client;

/// Fetches raw asset bytes (sticker images and similar) from wherever the
/// service keeps them.
#[async_trait]
pub trait AssetFetcher: Send + Sync {
    async fn fetch(&self, asset_id: &str) -> Result<Vec<u8>>;
}

/// Per-session cache of rich-media payloads referenced by incoming messages.
/// Explicitly constructed and injected; lifecycle is one app session.
pub struct AssetCache {
    fetcher: Arc<dyn AssetFetcher>,
    entries: RwLock<HashMap<String, Arc<Vec<u8>>>>,
}

impl AssetCache {
    pub fn new(fetcher: Arc<dyn AssetFetcher>) -> Arc<Self> {
        Arc::new(Self {
            fetcher,
            entries: RwLock::new(HashMap::new()),
        })
    }

    pub async fn get(&self, asset_id: &str) -> Option<Arc<Vec<u8>>> {
        self.entries.read().await.get(asset_id).cloned()
    }

    pub async fn contains(&self, asset_id: &str) -> bool {
        self.entries.read().await.contains_key(asset_id)
    }

    /// Fetch-and-cache in the background. Failures are logged and never
    /// block message ingestion.
    pub fn prefetch(self: &Arc<Self>, asset_id: String) {
        let cache = Arc::clone(self);
        tokio::spawn(async move {
            if cache.contains(&asset_id).await {
                return;
            }
            match cache.fetcher.fetch(&asset_id).await {
                Ok(bytes) => {
                    debug!(asset_id, size = bytes.len(), "cached asset");
                    cache
                        .entries
                        .write()
                        .await
                        .insert(asset_id, Arc::new(bytes));
                }
                Err(err) => {
                    warn!(asset_id, "asset fetch failed: {err:#}");
                }
            }
        });
    }
}

/// Fetcher backed by the service's HTTP asset endpoint.
pub struct HttpAssetFetcher {
    http: Client,
    server_url: String,
}

impl HttpAssetFetcher {
    pub fn new(server_url: impl Into<String>, request_timeout: Duration) -> Self {
        Self {
            http: http_client(request_timeout),
            server_url: server_url.into(),
        }
    }
}

#[async_trait]
impl AssetFetcher for HttpAssetFetcher {
    async fn fetch(&self, asset_id: &str) -> Result<Vec<u8>> {
        let bytes = self
            .http
            .get(format!("{}/assets/{asset_id}", self.server_url))
            .send()
            .await?
            .error_for_status()?
            .bytes()
            .await?;
        Ok(bytes.to_vec())
    }
}

// Resource providers and their registry

use crate::context::RequestContext;
use crate::protocol::{ReadResourceResult, Resource, ResourceContents};
use anyhow::Result;
use chrono::{DateTime, Utc};
use geoscope_core::{CacheStore, DispatchError, FetchedPage, HttpFetcher};
use std::collections::HashMap;
use std::sync::Arc;
use url::Url;

/// A readable resource identified by a URI
#[async_trait::async_trait]
pub trait ResourceProvider: Send + Sync {
    fn descriptor(&self) -> Resource;

    async fn read(&self, ctx: RequestContext) -> Result<ReadResourceResult>;
}

/// Resource registry keeping registration order
#[derive(Default, Clone)]
pub struct ResourceRegistry {
    providers: Vec<Arc<dyn ResourceProvider>>,
    by_uri: HashMap<String, usize>,
}

impl ResourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, provider: Arc<dyn ResourceProvider>) -> Result<(), DispatchError> {
        let uri = provider.descriptor().uri;
        if self.by_uri.contains_key(&uri) {
            return Err(DispatchError::Internal(format!(
                "resource '{}' is already registered",
                uri
            )));
        }
        self.by_uri.insert(uri, self.providers.len());
        self.providers.push(provider);
        Ok(())
    }

    pub fn get(&self, uri: &str) -> Option<Arc<dyn ResourceProvider>> {
        self.by_uri.get(uri).map(|&index| self.providers[index].clone())
    }

    pub fn list(&self) -> Vec<Resource> {
        self.providers.iter().map(|p| p.descriptor()).collect()
    }

    pub fn uris(&self) -> Vec<String> {
        self.providers.iter().map(|p| p.descriptor().uri).collect()
    }

    pub fn len(&self) -> usize {
        self.providers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }
}

fn json_contents(uri: &str, value: &serde_json::Value) -> Result<ReadResourceResult> {
    Ok(ReadResourceResult {
        contents: vec![ResourceContents {
            uri: uri.to_string(),
            mime_type: Some("application/json".to_string()),
            text: serde_json::to_string_pretty(value)?,
        }],
        meta: None,
    })
}

/// `geoscope://server/status`: identity and uptime of this server
pub struct ServerStatusResource {
    name: String,
    version: String,
    started_at: DateTime<Utc>,
}

impl ServerStatusResource {
    pub const URI: &'static str = "geoscope://server/status";

    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            started_at: Utc::now(),
        }
    }
}

#[async_trait::async_trait]
impl ResourceProvider for ServerStatusResource {
    fn descriptor(&self) -> Resource {
        Resource {
            uri: Self::URI.to_string(),
            name: "Server status".to_string(),
            description: Some("Server identity, version and uptime".to_string()),
            mime_type: Some("application/json".to_string()),
        }
    }

    async fn read(&self, ctx: RequestContext) -> Result<ReadResourceResult> {
        let uptime = Utc::now().signed_duration_since(self.started_at);
        json_contents(
            Self::URI,
            &serde_json::json!({
                "name": self.name,
                "version": self.version,
                "startedAt": self.started_at.to_rfc3339(),
                "uptimeSeconds": uptime.num_seconds(),
                "logLevel": ctx.logger.level(),
            }),
        )
    }
}

/// `geoscope://cache/stats`: occupancy of the outbound response cache
pub struct CacheStatsResource {
    cache: Arc<CacheStore<FetchedPage>>,
}

impl CacheStatsResource {
    pub const URI: &'static str = "geoscope://cache/stats";

    pub fn new(cache: Arc<CacheStore<FetchedPage>>) -> Self {
        Self { cache }
    }
}

#[async_trait::async_trait]
impl ResourceProvider for CacheStatsResource {
    fn descriptor(&self) -> Resource {
        Resource {
            uri: Self::URI.to_string(),
            name: "Cache statistics".to_string(),
            description: Some("Fresh, stale and expired entries in the outbound cache".to_string()),
            mime_type: Some("application/json".to_string()),
        }
    }

    async fn read(&self, _ctx: RequestContext) -> Result<ReadResourceResult> {
        json_contents(Self::URI, &serde_json::to_value(self.cache.stats())?)
    }
}

/// A pinned remote page, read through the resilient fetcher
pub struct PageResource {
    url: Url,
    fetcher: Arc<HttpFetcher>,
}

impl PageResource {
    pub fn new(url: Url, fetcher: Arc<HttpFetcher>) -> Self {
        Self { url, fetcher }
    }
}

#[async_trait::async_trait]
impl ResourceProvider for PageResource {
    fn descriptor(&self) -> Resource {
        Resource {
            uri: self.url.to_string(),
            name: self
                .url
                .host_str()
                .map(|host| format!("{}{}", host, self.url.path()))
                .unwrap_or_else(|| self.url.to_string()),
            description: Some("Pinned page fetched on read".to_string()),
            mime_type: None,
        }
    }

    async fn read(&self, ctx: RequestContext) -> Result<ReadResourceResult> {
        let outcome = self.fetcher.get(&self.url, None, Some(ctx.cancel.clone())).await?;

        if outcome.is_stale() {
            ctx.logger
                .warn("resources", format!("Serving stale copy of {}", self.url));
        }

        Ok(ReadResourceResult {
            contents: vec![ResourceContents {
                uri: self.url.to_string(),
                mime_type: outcome.value.content_type.clone(),
                text: outcome.value.body.clone(),
            }],
            meta: Some(serde_json::json!({
                "cacheStatus": outcome.cache_status(),
                "degraded": outcome.is_stale(),
                "attempts": outcome.attempts,
            })),
        })
    }
}

// MCP server assembly: registries, outbound stack and transport

use crate::config::McpConfig;
use crate::dispatcher::Dispatcher;
use crate::prompts::{AnalyzePagePrompt, ComparePagesPrompt, PromptRegistry};
use crate::protocol::ServerInfo;
use crate::resources::{CacheStatsResource, PageResource, ResourceRegistry, ServerStatusResource};
use crate::tools::{CacheStatusTool, ToolRegistry, WebFetchTool};
use crate::transport;
use anyhow::{Context, Result};
use geoscope_core::{CacheStore, HttpFetcher};
use std::sync::Arc;

pub const SERVER_NAME: &str = "geoscope";
pub const SERVER_VERSION: &str = env!("CARGO_PKG_VERSION");

pub fn server_info() -> ServerInfo {
    ServerInfo {
        name: SERVER_NAME.to_string(),
        version: SERVER_VERSION.to_string(),
    }
}

pub struct McpServer {
    dispatcher: Arc<Dispatcher>,
}

impl McpServer {
    pub fn new(dispatcher: Dispatcher) -> Self {
        Self {
            dispatcher: Arc::new(dispatcher),
        }
    }

    /// Build the dispatcher with every built-in tool, resource and prompt
    pub fn from_config(config: &McpConfig) -> Result<Self> {
        Ok(Self::new(build_dispatcher(config)?))
    }

    pub fn dispatcher(&self) -> Arc<Dispatcher> {
        self.dispatcher.clone()
    }

    /// Serve over stdio until stdin closes
    pub async fn start(&self) -> Result<()> {
        tracing::info!(
            tools = self.dispatcher.tools().len(),
            resources = self.dispatcher.resources().len(),
            prompts = self.dispatcher.prompts().len(),
            "MCP server starting on stdio"
        );
        transport::serve_stdio(self.dispatcher.clone()).await
    }
}

pub fn build_dispatcher(config: &McpConfig) -> Result<Dispatcher> {
    let cache = Arc::new(CacheStore::with_policy(config.cache.policy()));

    let mut fetcher = HttpFetcher::new(cache.clone(), config.outbound.retry_config())?;
    if let Some(limit) = config.outbound.concurrency_limit() {
        fetcher = fetcher.with_concurrency_limit(limit);
    }
    let fetcher = Arc::new(fetcher);

    let mut tools = ToolRegistry::new();
    tools.register(Arc::new(WebFetchTool::new(
        fetcher.clone(),
        config.web.allowed_domains.clone(),
    )))?;
    tools.register(Arc::new(CacheStatusTool::new(cache.clone())))?;

    let mut resources = ResourceRegistry::new();
    resources.register(Arc::new(ServerStatusResource::new(SERVER_NAME, SERVER_VERSION)))?;
    resources.register(Arc::new(CacheStatsResource::new(cache)))?;
    for url in &config.web.pinned_pages {
        resources
            .register(Arc::new(PageResource::new(url.clone(), fetcher.clone())))
            .with_context(|| format!("Failed to pin page {}", url))?;
    }

    let mut prompts = PromptRegistry::new();
    prompts.register(Arc::new(AnalyzePagePrompt))?;
    prompts.register(Arc::new(ComparePagesPrompt))?;

    tracing::debug!(
        tools = tools.len(),
        resources = resources.len(),
        prompts = prompts.len(),
        "Registered handlers"
    );

    Ok(Dispatcher::new(server_info())
        .with_tools(tools)
        .with_resources(resources)
        .with_prompts(prompts)
        .with_log_level(config.logging.level))
}

// Web tools for fetching external content

use crate::context::RequestContext;
use crate::protocol::{CallToolResult, ToolContent, ToolSchema};
use crate::tools::{json_schema_boolean, json_schema_object, json_schema_string, Tool};
use anyhow::{Context, Result};
use geoscope_core::{CallError, HttpFetcher};
use serde::Deserialize;
use std::sync::Arc;
use url::Url;

/// Output larger than this is cut before it reaches the client
const MAX_OUTPUT_CHARS: usize = 100_000;

/// Tool to fetch content from web URLs
pub struct WebFetchTool {
    fetcher: Arc<HttpFetcher>,
    allowed_domains: Vec<String>,
}

impl WebFetchTool {
    /// An empty allow-list permits every domain
    pub fn new(fetcher: Arc<HttpFetcher>, allowed_domains: Vec<String>) -> Self {
        Self {
            fetcher,
            allowed_domains,
        }
    }

    fn is_domain_allowed(&self, url: &Url) -> bool {
        if self.allowed_domains.is_empty() {
            return true;
        }

        if let Some(host) = url.host_str() {
            // Exact match or subdomain of an allowed domain
            for allowed in &self.allowed_domains {
                if host == allowed || host.ends_with(&format!(".{}", allowed)) {
                    return true;
                }
            }
        }
        false
    }
}

#[derive(Debug, Deserialize)]
struct WebFetchArgs {
    url: String,
    #[serde(default)]
    include_headers: bool,
}

#[async_trait::async_trait]
impl Tool for WebFetchTool {
    fn schema(&self) -> ToolSchema {
        let scope = if self.allowed_domains.is_empty() {
            "any domain".to_string()
        } else {
            format!("allowed domains: {}", self.allowed_domains.join(", "))
        };

        ToolSchema {
            name: "web_fetch".to_string(),
            description: format!(
                "Fetch a web page for analysis. Falls back to a recent cached copy when the site is down ({})",
                scope
            ),
            input_schema: json_schema_object(
                serde_json::json!({
                    "url": json_schema_string("The URL to fetch"),
                    "include_headers": json_schema_boolean("Include status and content type in output (default: false)")
                }),
                vec!["url"],
            ),
        }
    }

    async fn execute(&self, arguments: serde_json::Value, ctx: RequestContext) -> Result<CallToolResult> {
        let args: WebFetchArgs = serde_json::from_value(arguments)
            .context("Invalid arguments for web_fetch")?;

        // Parse and validate URL
        let url = match Url::parse(&args.url) {
            Ok(url) => url,
            Err(e) => return Ok(CallToolResult::error(format!("Invalid URL: {}", e))),
        };

        // Only allow HTTP/HTTPS
        if url.scheme() != "http" && url.scheme() != "https" {
            return Ok(CallToolResult::error(format!(
                "Only HTTP/HTTPS URLs are supported, got: {}",
                url.scheme()
            )));
        }

        if !self.is_domain_allowed(&url) {
            return Ok(CallToolResult::error(format!(
                "Domain not allowed: {}. Allowed domains: {}",
                url.host_str().unwrap_or("unknown"),
                self.allowed_domains.join(", ")
            )));
        }

        ctx.logger.debug("web_fetch", format!("Fetching {}", url));

        let outcome = match self.fetcher.get(&url, None, Some(ctx.cancel.clone())).await {
            Ok(outcome) => outcome,
            Err(CallError::Rejected { last_error, .. }) => {
                return Ok(CallToolResult::error(format!("{:#}", last_error)));
            }
            Err(e) => return Err(e.into()),
        };

        if outcome.is_stale() {
            ctx.logger.warn(
                "web_fetch",
                format!("{} unreachable, serving cached copy", url),
            );
        }

        let page = &outcome.value;
        let mut output = String::new();
        if args.include_headers {
            output.push_str(&format!("HTTP Status: {}\n", page.status));
            if let Some(content_type) = &page.content_type {
                output.push_str(&format!("Content-Type: {}\n", content_type));
            }
            output.push_str("\nBody:\n");
        }
        output.push_str(&page.body);

        if output.chars().count() > MAX_OUTPUT_CHARS {
            output = output.chars().take(MAX_OUTPUT_CHARS).collect();
            output.push_str("\n\n... (truncated, content too large)");
        }

        Ok(CallToolResult {
            content: vec![ToolContent::text(output)],
            is_error: None,
            meta: Some(serde_json::json!({
                "cacheStatus": outcome.cache_status(),
                "degraded": outcome.is_stale(),
                "attempts": outcome.attempts,
            })),
        })
    }
}

// Cache inspection tool

use crate::context::RequestContext;
use crate::protocol::{CallToolResult, ToolSchema};
use crate::tools::{json_schema_boolean, json_schema_object, Tool};
use anyhow::{Context, Result};
use geoscope_core::{CacheStore, FetchedPage};
use serde::Deserialize;
use std::sync::Arc;

/// Reports occupancy of the outbound cache and optionally clears it
pub struct CacheStatusTool {
    cache: Arc<CacheStore<FetchedPage>>,
}

impl CacheStatusTool {
    pub fn new(cache: Arc<CacheStore<FetchedPage>>) -> Self {
        Self { cache }
    }
}

#[derive(Debug, Default, Deserialize)]
struct CacheStatusArgs {
    #[serde(default)]
    clear: bool,
    #[serde(default)]
    purge_expired: bool,
}

#[async_trait::async_trait]
impl Tool for CacheStatusTool {
    fn schema(&self) -> ToolSchema {
        ToolSchema {
            name: "cache_status".to_string(),
            description: "Show fresh, stale and expired entries of the outbound response cache".to_string(),
            input_schema: json_schema_object(
                serde_json::json!({
                    "clear": json_schema_boolean("Drop every cached response after reporting (default: false)"),
                    "purge_expired": json_schema_boolean("Remove entries past their stale window (default: false)")
                }),
                vec![],
            ),
        }
    }

    async fn execute(&self, arguments: serde_json::Value, ctx: RequestContext) -> Result<CallToolResult> {
        let args: CacheStatusArgs = if arguments.is_null() {
            CacheStatusArgs::default()
        } else {
            serde_json::from_value(arguments).context("Invalid arguments for cache_status")?
        };

        let stats = self.cache.stats();
        let purged = if args.purge_expired {
            self.cache.purge_expired()
        } else {
            0
        };
        let cleared = if args.clear {
            let removed = self.cache.clear();
            ctx.logger
                .info("cache_status", format!("Cleared {} cached responses", removed));
            removed
        } else {
            0
        };

        let report = serde_json::json!({
            "entries": stats.entries,
            "fresh": stats.fresh,
            "stale": stats.stale,
            "expired": stats.expired,
            "purged": purged,
            "cleared": cleared,
        });

        Ok(CallToolResult::text(serde_json::to_string_pretty(&report)?))
    }
}

// MCP tool trait and registry

use crate::context::RequestContext;
use crate::protocol::{CallToolResult, ToolSchema};
use anyhow::Result;
use geoscope_core::DispatchError;
use std::collections::HashMap;
use std::sync::Arc;

/// Tool executor trait
#[async_trait::async_trait]
pub trait Tool: Send + Sync {
    /// Get the tool schema for MCP
    fn schema(&self) -> ToolSchema;

    /// Execute the tool with given arguments. Long-running tools should
    /// watch `ctx.cancel` and return early once it fires.
    async fn execute(&self, arguments: serde_json::Value, ctx: RequestContext) -> Result<CallToolResult>;
}

/// Tool registry keeping registration order for listing and completion
#[derive(Default, Clone)]
pub struct ToolRegistry {
    tools: Vec<Arc<dyn Tool>>,
    by_name: HashMap<String, usize>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool; names must be unique
    pub fn register(&mut self, tool: Arc<dyn Tool>) -> Result<(), DispatchError> {
        let name = tool.schema().name;
        if self.by_name.contains_key(&name) {
            return Err(DispatchError::Internal(format!(
                "tool '{}' is already registered",
                name
            )));
        }
        self.by_name.insert(name, self.tools.len());
        self.tools.push(tool);
        Ok(())
    }

    /// Get a tool by name
    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.by_name.get(name).map(|&index| self.tools[index].clone())
    }

    /// List all tool schemas
    pub fn list_schemas(&self) -> Vec<ToolSchema> {
        self.tools.iter().map(|t| t.schema()).collect()
    }

    /// Tool names in registration order
    pub fn names(&self) -> Vec<String> {
        self.tools.iter().map(|t| t.schema().name).collect()
    }

    /// Check if a tool exists
    pub fn contains(&self, name: &str) -> bool {
        self.by_name.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

// Helper functions for creating tool schemas

pub fn json_schema_object(properties: serde_json::Value, required: Vec<&str>) -> serde_json::Value {
    serde_json::json!({
        "type": "object",
        "properties": properties,
        "required": required
    })
}

pub fn json_schema_string(description: &str) -> serde_json::Value {
    serde_json::json!({
        "type": "string",
        "description": description
    })
}

pub fn json_schema_boolean(description: &str) -> serde_json::Value {
    serde_json::json!({
        "type": "boolean",
        "description": description
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Named(&'static str);

    #[async_trait::async_trait]
    impl Tool for Named {
        fn schema(&self) -> ToolSchema {
            ToolSchema {
                name: self.0.to_string(),
                description: String::new(),
                input_schema: json_schema_object(serde_json::json!({}), vec![]),
            }
        }

        async fn execute(&self, _arguments: serde_json::Value, _ctx: RequestContext) -> Result<CallToolResult> {
            Ok(CallToolResult::text(self.0))
        }
    }

    #[test]
    fn test_registration_order_is_kept() {
        let mut registry = ToolRegistry::new();
        for name in ["zeta", "alpha", "mid"] {
            registry.register(Arc::new(Named(name))).unwrap();
        }

        assert_eq!(registry.names(), vec!["zeta", "alpha", "mid"]);
        assert!(registry.contains("alpha"));
        assert!(registry.get("missing").is_none());
    }

    #[test]
    fn test_duplicate_registration_rejected() {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(Named("web_fetch"))).unwrap();

        assert!(registry.register(Arc::new(Named("web_fetch"))).is_err());
        assert_eq!(registry.len(), 1);
    }
}

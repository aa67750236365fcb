//! The tool surface exposed to AI assistants.
//!
//! Tools are a uniform request/response contract: a name, a JSON schema for
//! input, and an execution returning typed content. Failures come back as
//! content with `is_error` set, never as protocol errors, so callers can
//! reason about them.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use serde::Serialize;

pub mod cluster;
pub mod prompts;

/// Content item in a tool result.
#[derive(Clone, Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ToolContent {
    Text { text: String },
}

#[derive(Clone, Debug, Serialize)]
pub struct ToolResult {
    pub content: Vec<ToolContent>,
    #[serde(rename = "isError")]
    pub is_error: bool,
}

impl ToolResult {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            content: vec![ToolContent::Text { text: text.into() }],
            is_error: false,
        }
    }

    /// Pretty-printed JSON payload.
    pub fn json<T: Serialize>(value: &T) -> Self {
        match serde_json::to_string_pretty(value) {
            Ok(text) => Self::text(text),
            Err(error) => Self::error(format!("failed to serialize result: {error}")),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            content: vec![ToolContent::Text {
                text: message.into(),
            }],
            is_error: true,
        }
    }
}

#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> String;
    fn description(&self) -> String;
    fn input_schema(&self) -> serde_json::Value;
    async fn execute(&self, args: serde_json::Value) -> ToolResult;
}

/// Listing entry for `tools/list`.
#[derive(Clone, Debug, Serialize)]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    #[serde(rename = "inputSchema")]
    pub input_schema: serde_json::Value,
}

/// Process-wide tool registry. Integrations register tools on start and
/// deregister them on stop.
#[derive(Default)]
pub struct ToolRegistry {
    tools: RwLock<HashMap<String, Arc<dyn Tool>>>,
}

impl ToolRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn register(&self, tool: Arc<dyn Tool>) {
        let name = tool.name();
        debug!(message = "registering tool", tool = %name);
        self.tools
            .write()
            .expect("tool registry poisoned")
            .insert(name, tool);
    }

    pub fn deregister(&self, name: &str) {
        debug!(message = "deregistering tool", tool = %name);
        self.tools.write().expect("tool registry poisoned").remove(name);
    }

    /// Removes every tool whose name starts with `prefix`. Integration
    /// instances deregister this way on stop.
    pub fn deregister_prefix(&self, prefix: &str) {
        self.tools
            .write()
            .expect("tool registry poisoned")
            .retain(|name, _| !name.starts_with(prefix));
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools
            .read()
            .expect("tool registry poisoned")
            .get(name)
            .cloned()
    }

    pub fn list(&self) -> Vec<ToolDescriptor> {
        let mut descriptors: Vec<ToolDescriptor> = self
            .tools
            .read()
            .expect("tool registry poisoned")
            .values()
            .map(|tool| ToolDescriptor {
                name: tool.name(),
                description: tool.description(),
                input_schema: tool.input_schema(),
            })
            .collect();
        descriptors.sort_by(|a, b| a.name.cmp(&b.name));
        descriptors
    }

    /// Executes a tool by name. Unknown tools and panics surface as error
    /// results, never as protocol failures.
    pub async fn call(&self, name: &str, args: serde_json::Value) -> ToolResult {
        let Some(tool) = self.get(name) else {
            return ToolResult::error(format!("unknown tool: {name}"));
        };
        let execution = tokio::spawn(async move { tool.execute(args).await });
        match execution.await {
            Ok(result) => result,
            Err(join_error) => {
                error!(message = "tool execution panicked", tool = %name, %join_error);
                ToolResult::error(format!("tool {name} failed internally"))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Echo;

    #[async_trait]
    impl Tool for Echo {
        fn name(&self) -> String {
            "echo".into()
        }
        fn description(&self) -> String {
            "echoes its input".into()
        }
        fn input_schema(&self) -> serde_json::Value {
            json!({"type": "object"})
        }
        async fn execute(&self, args: serde_json::Value) -> ToolResult {
            ToolResult::text(args.to_string())
        }
    }

    struct Panicky;

    #[async_trait]
    impl Tool for Panicky {
        fn name(&self) -> String {
            "panicky".into()
        }
        fn description(&self) -> String {
            String::new()
        }
        fn input_schema(&self) -> serde_json::Value {
            json!({"type": "object"})
        }
        async fn execute(&self, _args: serde_json::Value) -> ToolResult {
            panic!("boom");
        }
    }

    #[tokio::test]
    async fn register_call_deregister() {
        let registry = ToolRegistry::new();
        registry.register(Arc::new(Echo));

        let result = registry.call("echo", json!({"a": 1})).await;
        assert!(!result.is_error);

        registry.deregister("echo");
        let result = registry.call("echo", json!({})).await;
        assert!(result.is_error);
    }

    #[tokio::test]
    async fn prefix_deregistration() {
        let registry = ToolRegistry::new();
        registry.register(Arc::new(Echo));
        registry.deregister_prefix("ec");
        assert!(registry.get("echo").is_none());
    }

    #[tokio::test]
    async fn panics_become_error_results() {
        let registry = ToolRegistry::new();
        registry.register(Arc::new(Panicky));
        let result = registry.call("panicky", json!({})).await;
        assert!(result.is_error);
    }
}

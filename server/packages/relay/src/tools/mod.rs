//! Uniform tool capability and the startup-built lookup table the agent
//! runtime dispatches through.

mod live_data;

pub use live_data::{CollectValuesTool, CurrentValueTool};

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{json, Value};
use thiserror::Error;
use utoipa::ToSchema;

/// Read-only snapshot of one registered tool.
#[derive(Debug, Clone, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    #[schema(value_type = Object)]
    pub input_schema: Value,
}

/// Read-only snapshot of one documentation resource the agent can cite.
#[derive(Debug, Clone, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ResourceDescriptor {
    pub name: String,
    pub description: String,
    pub uri: String,
    pub url: String,
    pub mime_type: String,
}

#[derive(Debug, Error)]
pub enum ToolError {
    /// Bad arguments; reported back to the agent as the tool outcome.
    #[error("{0}")]
    Invalid(String),
    /// Execution failure; reported back to the agent as the tool outcome.
    #[error("{0}")]
    Failed(String),
}

/// A named capability with a uniform invoke surface. The runtime never
/// depends on a closed set of implementations, only on this trait and the
/// registry below.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    fn input_schema(&self) -> Value;
    async fn invoke(&self, args: Value) -> Result<Value, ToolError>;
}

pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
    order: Vec<String>,
    resources: Vec<ResourceDescriptor>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
            order: Vec::new(),
            resources: documentation_resources(),
        }
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        let name = tool.name().to_string();
        if self.tools.insert(name.clone(), tool).is_none() {
            self.order.push(name);
        }
    }

    pub fn descriptors(&self) -> Vec<ToolDescriptor> {
        self.order
            .iter()
            .filter_map(|name| self.tools.get(name))
            .map(|tool| ToolDescriptor {
                name: tool.name().to_string(),
                description: tool.description().to_string(),
                input_schema: tool.input_schema(),
            })
            .collect()
    }

    pub fn resources(&self) -> Vec<ResourceDescriptor> {
        self.resources.clone()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Dispatch one invocation. Unknown tools and tool failures come back as
    /// an `{"error": ...}` payload for the agent; they are never process
    /// errors.
    pub async fn invoke(&self, name: &str, args: Value) -> Value {
        let Some(tool) = self.tools.get(name) else {
            return json!({ "error": format!("unknown tool: {name}") });
        };
        match tool.invoke(args).await {
            Ok(result) => result,
            Err(err) => {
                tracing::warn!(tool = name, error = %err, "tool invocation failed");
                json!({ "error": err.to_string() })
            }
        }
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

const DOCS_BASE: &str = "https://docs.edgerelay.dev";

fn documentation_resources() -> Vec<ResourceDescriptor> {
    let entries = [
        (
            "edge://docs/overview",
            "Platform Overview",
            "High-level overview of the edge data platform",
            "",
        ),
        (
            "edge://docs/devicehub",
            "DeviceHub Documentation",
            "Connecting and managing industrial devices",
            "/devicehub",
        ),
        (
            "edge://docs/datahub",
            "DataHub Documentation",
            "Pub/sub messaging and live topic data",
            "/datahub",
        ),
        (
            "edge://docs/digital-twins",
            "Digital Twins Documentation",
            "Creating and managing digital twin models and instances",
            "/digital-twins",
        ),
        (
            "edge://docs/marketplace",
            "Marketplace Documentation",
            "Deploying and managing containerized applications",
            "/marketplace",
        ),
    ];
    entries
        .iter()
        .map(|(uri, name, description, path)| ResourceDescriptor {
            name: name.to_string(),
            description: description.to_string(),
            uri: uri.to_string(),
            url: format!("{DOCS_BASE}{path}"),
            mime_type: "text/html".to_string(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    struct EchoTool;

    #[async_trait]
    impl Tool for EchoTool {
        fn name(&self) -> &str {
            "echo"
        }
        fn description(&self) -> &str {
            "Echoes its arguments."
        }
        fn input_schema(&self) -> Value {
            json!({ "type": "object", "properties": {}, "required": [] })
        }
        async fn invoke(&self, args: Value) -> Result<Value, ToolError> {
            Ok(args)
        }
    }

    #[tokio::test]
    async fn unknown_tool_reports_an_error_payload() {
        let registry = ToolRegistry::new();
        let result = registry.invoke("nope", json!({})).await;
        assert!(result["error"].as_str().unwrap().contains("unknown tool"));
    }

    #[tokio::test]
    async fn registered_tool_is_listed_and_dispatchable() {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(EchoTool));

        let descriptors = registry.descriptors();
        assert_eq!(descriptors.len(), 1);
        assert_eq!(descriptors[0].name, "echo");

        let result = registry.invoke("echo", json!({ "x": 1 })).await;
        assert_eq!(result, json!({ "x": 1 }));
    }
}

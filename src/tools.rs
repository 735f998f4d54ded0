//! Tool gateway: typed outcomes for remote tool invocation.
//!
//! Tool augmentation is an optional enhancement. Nothing in this module
//! raises past its boundary; every failure materializes as a
//! [`ToolOutcome`] variant that callers handle as ordinary control flow.

pub mod mcp;
pub mod web;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

/// Cap on tool output carried into a prompt.
pub const MAX_TOOL_OUTPUT_BYTES: usize = 16 * 1024;

/// Result of one attempted tool invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", content = "detail", rename_all = "snake_case")]
pub enum ToolOutcome {
    /// The tool ran and produced output.
    Success(String),
    /// The tool service could not be reached (transport failure, timeout).
    Unavailable(String),
    /// The service responded with a well-formed error.
    Failed(String),
}

impl ToolOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, ToolOutcome::Success(_))
    }
}

/// A tool invocation attempted for one request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolInvocation {
    pub tool_name: String,
    pub outcome: ToolOutcome,
}

/// A discovered tool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDescriptor {
    /// Which MCP server exposes the tool.
    pub server: String,
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

/// Uniform access to remote tools. Implementations never return errors;
/// discovery failures yield an empty list and invocation failures yield
/// non-success outcomes.
#[async_trait]
pub trait ToolGateway: Send + Sync {
    /// Invoke a tool by name with JSON arguments.
    async fn invoke(&self, tool_name: &str, arguments: Value) -> ToolInvocation;

    /// List every currently reachable tool. Empty on registry failure.
    async fn list_tools(&self) -> Vec<ToolDescriptor>;
}

/// Fans invocations out across several gateways: builtin tools and MCP
/// servers present one registry to the engine. A tool routes to the first
/// gateway exposing its name.
pub struct CompositeGateway {
    gateways: Vec<Arc<dyn ToolGateway>>,
}

impl CompositeGateway {
    pub fn new(gateways: Vec<Arc<dyn ToolGateway>>) -> Self {
        Self { gateways }
    }
}

#[async_trait]
impl ToolGateway for CompositeGateway {
    async fn invoke(&self, tool_name: &str, arguments: Value) -> ToolInvocation {
        for gateway in &self.gateways {
            let owns_tool = gateway
                .list_tools()
                .await
                .iter()
                .any(|tool| tool.name == tool_name);
            if owns_tool {
                return gateway.invoke(tool_name, arguments).await;
            }
        }

        ToolInvocation {
            tool_name: tool_name.to_string(),
            outcome: ToolOutcome::Unavailable(format!(
                "tool '{tool_name}' is not exposed by any gateway"
            )),
        }
    }

    async fn list_tools(&self) -> Vec<ToolDescriptor> {
        let mut tools = Vec::new();
        for gateway in &self.gateways {
            tools.extend(gateway.list_tools().await);
        }
        tools
    }
}

/// Validate arguments against a tool's input schema: unknown keys are
/// dropped, missing required parameters get type-appropriate defaults.
pub fn validate_arguments(schema: &Value, provided: &Value) -> Value {
    let properties = schema.get("properties").and_then(Value::as_object);
    let Some(properties) = properties else {
        return provided.clone();
    };

    let mut validated = serde_json::Map::new();
    if let Some(provided_map) = provided.as_object() {
        for (key, value) in provided_map {
            if properties.contains_key(key) {
                validated.insert(key.clone(), value.clone());
            }
        }
    }

    let required = schema
        .get("required")
        .and_then(Value::as_array)
        .map(|names| {
            names
                .iter()
                .filter_map(Value::as_str)
                .collect::<Vec<&str>>()
        })
        .unwrap_or_default();

    for name in required {
        if validated.contains_key(name) {
            continue;
        }
        let default = match properties
            .get(name)
            .and_then(|p| p.get("type"))
            .and_then(Value::as_str)
        {
            Some("boolean") => Value::Bool(true),
            Some("number") | Some("integer") => Value::from(0),
            Some("array") => Value::Array(Vec::new()),
            Some("object") => Value::Object(serde_json::Map::new()),
            _ => Value::String(String::new()),
        };
        validated.insert(name.to_string(), default);
    }

    Value::Object(validated)
}

/// Clamp tool output to `max_bytes` on a char boundary, marking the cut.
pub fn truncate_output(output: &str, max_bytes: usize) -> String {
    if output.len() <= max_bytes {
        return output.to_string();
    }

    let mut end = max_bytes;
    while end > 0 && !output.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}\n[output truncated]", &output[..end])
}

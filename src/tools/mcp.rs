//! MCP-backed tool gateway: client connections, discovery, and invocation.

use crate::config::{McpServerConfig, McpTransport};
use crate::tools::{
    MAX_TOOL_OUTPUT_BYTES, ToolDescriptor, ToolGateway, ToolInvocation, ToolOutcome,
    truncate_output, validate_arguments,
};

use anyhow::{Context as _, Result, anyhow};
use async_trait::async_trait;
use axum::http::{HeaderName, HeaderValue};
use rmcp::ClientHandler;
use rmcp::service::{NotificationContext, RoleClient, RunningService, ServiceError};
use std::borrow::Cow;
use std::collections::HashMap;
use std::future::Future;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};

type McpClientSession = RunningService<RoleClient, McpClientHandler>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum McpConnectionState {
    Connecting,
    Connected,
    Failed(String),
    Disconnected,
}

#[derive(Clone)]
struct McpClientHandler {
    tool_list_changed: Arc<AtomicBool>,
    client_info: rmcp::model::ClientInfo,
}

impl McpClientHandler {
    fn new(tool_list_changed: Arc<AtomicBool>) -> Self {
        let client_info = rmcp::model::ClientInfo::new(
            rmcp::model::ClientCapabilities::default(),
            rmcp::model::Implementation::new("webqa", env!("CARGO_PKG_VERSION"))
                .with_description("Web QA agent MCP client"),
        )
        .with_protocol_version(rmcp::model::ProtocolVersion::default());

        Self {
            tool_list_changed,
            client_info,
        }
    }
}

impl ClientHandler for McpClientHandler {
    fn on_tool_list_changed(
        &self,
        _context: NotificationContext<RoleClient>,
    ) -> impl Future<Output = ()> + Send + '_ {
        self.tool_list_changed.store(true, Ordering::SeqCst);
        std::future::ready(())
    }

    fn get_info(&self) -> rmcp::model::ClientInfo {
        self.client_info.clone()
    }
}

/// One connected MCP server.
pub struct McpConnection {
    name: String,
    config: McpServerConfig,
    state: RwLock<McpConnectionState>,
    client: Mutex<Option<McpClientSession>>,
    tools: RwLock<Vec<rmcp::model::Tool>>,
    tool_list_changed: Arc<AtomicBool>,
}

impl McpConnection {
    pub fn new(config: McpServerConfig) -> Self {
        Self {
            name: config.name.clone(),
            config,
            state: RwLock::new(McpConnectionState::Disconnected),
            client: Mutex::new(None),
            tools: RwLock::new(Vec::new()),
            tool_list_changed: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn state(&self) -> McpConnectionState {
        self.state.read().await.clone()
    }

    pub async fn is_connected(&self) -> bool {
        matches!(self.state().await, McpConnectionState::Connected)
    }

    pub async fn connect(&self) -> Result<()> {
        {
            let mut state = self.state.write().await;
            *state = McpConnectionState::Connecting;
        }

        let session_result = self.connect_session().await;
        let mut client_guard = self.client.lock().await;

        match session_result {
            Ok(session) => {
                let tools_result = session
                    .list_all_tools()
                    .await
                    .with_context(|| format!("failed to list tools for '{}'", self.name));

                let tools = match tools_result {
                    Ok(tools) => tools,
                    Err(error) => {
                        *client_guard = None;
                        drop(client_guard);

                        {
                            let mut cached_tools = self.tools.write().await;
                            cached_tools.clear();
                        }

                        let error_message = error.to_string();
                        let mut state = self.state.write().await;
                        *state = McpConnectionState::Failed(error_message.clone());
                        return Err(anyhow!(error_message));
                    }
                };
                *client_guard = Some(session);
                drop(client_guard);

                tracing::info!(
                    server = %self.name,
                    transport = self.config.transport.kind(),
                    tools = tools.len(),
                    "mcp server connected"
                );

                {
                    let mut cached_tools = self.tools.write().await;
                    *cached_tools = tools;
                }
                self.tool_list_changed.store(false, Ordering::SeqCst);

                let mut state = self.state.write().await;
                *state = McpConnectionState::Connected;
                Ok(())
            }
            Err(error) => {
                *client_guard = None;
                drop(client_guard);

                {
                    let mut cached_tools = self.tools.write().await;
                    cached_tools.clear();
                }

                let error_message = error.to_string();
                let mut state = self.state.write().await;
                *state = McpConnectionState::Failed(error_message.clone());
                Err(anyhow!(error_message))
            }
        }
    }

    pub async fn disconnect(&self) {
        let mut client_guard = self.client.lock().await;
        let mut session = client_guard.take();
        drop(client_guard);

        if let Some(client) = session.as_mut() {
            if let Err(error) = client.close().await {
                tracing::warn!(
                    server = %self.name,
                    %error,
                    "failed to close mcp session"
                );
            }
        }

        {
            let mut cached_tools = self.tools.write().await;
            cached_tools.clear();
        }
        self.tool_list_changed.store(false, Ordering::SeqCst);

        let mut state = self.state.write().await;
        *state = McpConnectionState::Disconnected;
    }

    pub async fn list_tools(&self) -> Vec<rmcp::model::Tool> {
        if self.tool_list_changed.swap(false, Ordering::SeqCst) {
            if let Err(error) = self.refresh_tools().await {
                tracing::warn!(server = %self.name, %error, "failed to refresh mcp tools");
            }
        }

        self.tools.read().await.clone()
    }

    pub async fn call_tool(
        &self,
        tool_name: &str,
        arguments: serde_json::Value,
    ) -> Result<rmcp::model::CallToolResult> {
        let arguments = match arguments {
            serde_json::Value::Object(map) => Some(map),
            serde_json::Value::Null => None,
            _ => {
                return Err(anyhow!("mcp tool arguments must be a JSON object or null"));
            }
        };

        let client_guard = self.client.lock().await;
        let Some(client) = client_guard.as_ref() else {
            return Err(anyhow!("mcp server '{}' is not connected", self.name));
        };

        let mut params =
            rmcp::model::CallToolRequestParams::new(Cow::Owned(tool_name.to_string()));
        params.arguments = arguments;

        client
            .call_tool(params)
            .await
            .map_err(service_error_to_anyhow)
    }

    async fn refresh_tools(&self) -> Result<()> {
        let client_guard = self.client.lock().await;
        let Some(client) = client_guard.as_ref() else {
            return Err(anyhow!("mcp server '{}' is not connected", self.name));
        };
        let tools = client
            .list_all_tools()
            .await
            .map_err(service_error_to_anyhow)?;
        drop(client_guard);

        let mut cached_tools = self.tools.write().await;
        *cached_tools = tools;
        Ok(())
    }

    async fn connect_session(&self) -> Result<McpClientSession> {
        let handler = McpClientHandler::new(self.tool_list_changed.clone());

        match &self.config.transport {
            McpTransport::Stdio { command, args, env } => {
                let resolved_command = interpolate_env_placeholders(command);
                let resolved_args = args
                    .iter()
                    .map(|arg| interpolate_env_placeholders(arg))
                    .collect::<Vec<_>>();
                let resolved_env = env
                    .iter()
                    .map(|(key, value)| (key.clone(), interpolate_env_placeholders(value)))
                    .collect::<HashMap<_, _>>();

                let mut child_command = tokio::process::Command::new(&resolved_command);
                child_command.args(&resolved_args);
                child_command.envs(&resolved_env);

                let transport = rmcp::transport::TokioChildProcess::new(child_command)
                    .with_context(|| format!("failed to spawn stdio mcp server '{}'", self.name))?;

                rmcp::serve_client(handler, transport)
                    .await
                    .with_context(|| format!("failed to initialize mcp server '{}'", self.name))
            }
            McpTransport::Http { url, headers } => {
                let resolved_url = interpolate_env_placeholders(url);
                let mut custom_headers = HashMap::new();
                for (header_name, header_value) in headers {
                    let resolved_value = interpolate_env_placeholders(header_value)
                        .trim()
                        .to_string();
                    let parsed_name = HeaderName::from_str(header_name).with_context(|| {
                        format!(
                            "invalid mcp header name '{}' for server '{}'",
                            header_name, self.name
                        )
                    })?;
                    let parsed_value = HeaderValue::from_str(&resolved_value).with_context(|| {
                        format!(
                            "invalid mcp header value for '{}' on server '{}'",
                            header_name, self.name
                        )
                    })?;
                    custom_headers.insert(parsed_name, parsed_value);
                }

                let transport_config =
                    rmcp::transport::streamable_http_client::StreamableHttpClientTransportConfig::with_uri(
                        resolved_url,
                    )
                    .custom_headers(custom_headers);

                let transport =
                    rmcp::transport::StreamableHttpClientTransport::from_config(transport_config);

                rmcp::serve_client(handler, transport)
                    .await
                    .with_context(|| format!("failed to initialize mcp server '{}'", self.name))
            }
        }
    }
}

/// Gateway over every configured MCP server.
///
/// Discovery failures are absorbed: an unreachable server contributes no
/// tools and the agent keeps answering without augmentation.
pub struct McpGateway {
    connections: Vec<Arc<McpConnection>>,
    call_timeout: Duration,
}

impl McpGateway {
    pub fn new(configs: Vec<McpServerConfig>, call_timeout: Duration) -> Self {
        let connections = configs
            .into_iter()
            .filter(|config| config.enabled)
            .map(|config| Arc::new(McpConnection::new(config)))
            .collect();

        Self {
            connections,
            call_timeout,
        }
    }

    /// Connect every enabled server. Failures are logged and skipped.
    pub async fn connect_all(&self) {
        for connection in &self.connections {
            if let Err(error) = connection.connect().await {
                tracing::warn!(
                    server = %connection.name(),
                    %error,
                    "failed to connect mcp server"
                );
            }
        }
    }

    pub async fn disconnect_all(&self) {
        for connection in &self.connections {
            connection.disconnect().await;
        }
    }

    /// Resolve a tool name to the first connected server exposing it.
    async fn resolve(&self, tool_name: &str) -> Option<(Arc<McpConnection>, rmcp::model::Tool)> {
        for connection in &self.connections {
            if !connection.is_connected().await {
                continue;
            }
            for tool in connection.list_tools().await {
                if tool.name.as_ref() == tool_name {
                    return Some((connection.clone(), tool));
                }
            }
        }
        None
    }
}

#[async_trait]
impl ToolGateway for McpGateway {
    async fn invoke(&self, tool_name: &str, arguments: serde_json::Value) -> ToolInvocation {
        let Some((connection, tool)) = self.resolve(tool_name).await else {
            return ToolInvocation {
                tool_name: tool_name.to_string(),
                outcome: ToolOutcome::Unavailable(format!(
                    "tool '{tool_name}' is not exposed by any connected server"
                )),
            };
        };

        let schema = tool.schema_as_json_value();
        let validated = validate_arguments(&schema, &arguments);

        let call = connection.call_tool(tool_name, validated);
        let outcome = match tokio::time::timeout(self.call_timeout, call).await {
            Err(_elapsed) => ToolOutcome::Unavailable(format!(
                "tool call timed out after {}s",
                self.call_timeout.as_secs()
            )),
            Ok(Err(error)) => ToolOutcome::Unavailable(error.to_string()),
            Ok(Ok(result)) => {
                let text = truncate_output(&collect_result_text(&result), MAX_TOOL_OUTPUT_BYTES);
                if result.is_error.unwrap_or(false) {
                    let message = if text.is_empty() {
                        format!(
                            "server '{}' reported an error calling '{}'",
                            connection.name(),
                            tool_name
                        )
                    } else {
                        text
                    };
                    ToolOutcome::Failed(message)
                } else if text.is_empty() {
                    ToolOutcome::Success("[tool returned no content]".to_string())
                } else {
                    ToolOutcome::Success(text)
                }
            }
        };

        ToolInvocation {
            tool_name: tool_name.to_string(),
            outcome,
        }
    }

    async fn list_tools(&self) -> Vec<ToolDescriptor> {
        let mut descriptors = Vec::new();
        for connection in &self.connections {
            if !connection.is_connected().await {
                continue;
            }

            let server_name = connection.name().to_string();
            for tool in connection.list_tools().await {
                let input_schema = tool.schema_as_json_value();
                let description = tool
                    .description
                    .map(|description| description.into_owned())
                    .unwrap_or_default();

                descriptors.push(ToolDescriptor {
                    server: server_name.clone(),
                    name: tool.name.into_owned(),
                    description,
                    input_schema,
                });
            }
        }
        descriptors
    }
}

/// Flatten an MCP call result into plain text for the prompt.
fn collect_result_text(result: &rmcp::model::CallToolResult) -> String {
    let mut blocks = result
        .content
        .iter()
        .map(|content| match &content.raw {
            rmcp::model::RawContent::Text(text) => text.text.clone(),
            rmcp::model::RawContent::Resource(resource) => match &resource.resource {
                rmcp::model::ResourceContents::TextResourceContents { text, .. } => text.clone(),
                _ => serde_json::to_string(&content.raw)
                    .unwrap_or_else(|_| "[unsupported resource content]".to_string()),
            },
            other => serde_json::to_string(other)
                .unwrap_or_else(|_| "[unsupported mcp content]".to_string()),
        })
        .collect::<Vec<_>>();

    if let Some(structured_content) = &result.structured_content {
        blocks.push(structured_content.to_string());
    }

    if blocks.is_empty() {
        String::new()
    } else {
        blocks.join("\n")
    }
}

fn service_error_to_anyhow(error: ServiceError) -> anyhow::Error {
    anyhow!(error.to_string())
}

fn interpolate_env_placeholders(value: &str) -> String {
    let mut output = String::with_capacity(value.len());
    let mut cursor = 0;

    while let Some(start_offset) = value[cursor..].find("${") {
        let start = cursor + start_offset;
        output.push_str(&value[cursor..start]);

        let placeholder_start = start + 2;
        let Some(end_offset) = value[placeholder_start..].find('}') else {
            output.push_str(&value[start..]);
            return output;
        };

        let end = placeholder_start + end_offset;
        let var_name = &value[placeholder_start..end];
        if var_name.is_empty() {
            output.push_str("${}");
        } else {
            let resolved = std::env::var(var_name).unwrap_or_default();
            output.push_str(&resolved);
        }

        cursor = end + 1;
    }

    output.push_str(&value[cursor..]);
    output
}

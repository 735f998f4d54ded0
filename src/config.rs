//! Configuration loading and validation.

use crate::error::{ConfigError, Result};

use anyhow::Context as _;
use serde::Deserialize;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;

/// QA agent configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Address the HTTP server binds to.
    pub bind: SocketAddr,

    /// LLM provider configuration.
    pub llm: LlmConfig,

    /// QA engine behavior settings.
    pub engine: EngineConfig,

    /// Identity advertised on the agent card.
    pub agent: AgentIdentity,

    /// Configured MCP tool servers.
    pub mcp_servers: Vec<McpServerConfig>,
}

/// Supported LLM platforms.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    Anthropic,
    OpenAi,
}

impl Platform {
    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Anthropic => "anthropic",
            Platform::OpenAi => "openai",
        }
    }
}

/// LLM provider configuration.
#[derive(Debug, Clone)]
pub struct LlmConfig {
    /// Which provider API to speak.
    pub platform: Platform,

    /// Model name for completions.
    pub model: String,

    /// Provider API key.
    pub api_key: String,

    /// Provider base URL (override for proxies/self-hosted gateways).
    pub base_url: String,

    /// Sampling temperature.
    pub temperature: f64,

    /// Maximum tokens per completion.
    pub max_tokens: u64,

    /// Request timeout in seconds.
    pub request_timeout_secs: u64,
}

/// QA engine behavior configuration.
#[derive(Debug, Clone, Copy)]
pub struct EngineConfig {
    /// Most recent turns included when composing a prompt.
    pub history_window: usize,

    /// Turns retained per conversation before the oldest are dropped.
    pub max_history_turns: usize,

    /// Character budget for a composed prompt.
    pub prompt_budget_chars: usize,

    /// Timeout for a single tool invocation in seconds.
    pub tool_timeout_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            history_window: 10,
            max_history_turns: 20,
            prompt_budget_chars: 24_000,
            tool_timeout_secs: 30,
        }
    }
}

/// Identity advertised on the agent discovery card.
#[derive(Debug, Clone)]
pub struct AgentIdentity {
    pub name: String,
    pub description: String,
    pub version: String,
    /// Public base URL for the card (defaults to the bind address).
    pub public_url: String,
}

/// One configured MCP server.
#[derive(Debug, Clone, PartialEq)]
pub struct McpServerConfig {
    pub name: String,
    pub enabled: bool,
    pub transport: McpTransport,
}

/// MCP transport variants.
#[derive(Debug, Clone, PartialEq)]
pub enum McpTransport {
    Stdio {
        command: String,
        args: Vec<String>,
        env: HashMap<String, String>,
    },
    Http {
        url: String,
        headers: HashMap<String, String>,
    },
}

impl McpTransport {
    pub fn kind(&self) -> &'static str {
        match self {
            McpTransport::Stdio { .. } => "stdio",
            McpTransport::Http { .. } => "http",
        }
    }
}

/// Raw `mcpservers.json` shape: `{ "mcpServers": { name: { ... } } }`.
#[derive(Debug, Deserialize)]
struct McpServerFile {
    #[serde(rename = "mcpServers", default)]
    mcp_servers: HashMap<String, RawMcpServer>,
}

#[derive(Debug, Deserialize)]
struct RawMcpServer {
    #[serde(default)]
    command: Option<String>,
    #[serde(default)]
    args: Vec<String>,
    #[serde(default)]
    env: HashMap<String, String>,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    headers: HashMap<String, String>,
    #[serde(default = "default_enabled")]
    enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl Config {
    /// Load configuration from environment variables and the optional
    /// MCP server file.
    pub fn load() -> Result<Self> {
        let host = std::env::var("WEBQA_HOST").unwrap_or_else(|_| "0.0.0.0".into());
        let port = std::env::var("WEBQA_PORT")
            .ok()
            .map(|raw| {
                raw.parse::<u16>()
                    .map_err(|_| ConfigError::Invalid(format!("WEBQA_PORT is not a port: {raw}")))
            })
            .transpose()?
            .unwrap_or(8000);

        let bind: SocketAddr = format!("{host}:{port}")
            .parse()
            .map_err(|_| ConfigError::Invalid(format!("invalid bind address {host}:{port}")))?;

        let llm = LlmConfig::load()?;

        let engine = EngineConfig {
            history_window: env_usize("WEBQA_HISTORY_WINDOW", 10)?,
            max_history_turns: env_usize("WEBQA_MAX_HISTORY_TURNS", 20)?,
            prompt_budget_chars: env_usize("WEBQA_PROMPT_BUDGET_CHARS", 24_000)?,
            tool_timeout_secs: env_usize("WEBQA_TOOL_TIMEOUT_SECS", 30)? as u64,
        };

        let agent = AgentIdentity {
            name: std::env::var("WEBQA_AGENT_NAME").unwrap_or_else(|_| "Web QA Agent".into()),
            description: std::env::var("WEBQA_AGENT_DESCRIPTION")
                .unwrap_or_else(|_| "Context-aware question answering agent".into()),
            version: env!("CARGO_PKG_VERSION").to_string(),
            public_url: std::env::var("WEBQA_PUBLIC_URL")
                .unwrap_or_else(|_| format!("http://{bind}/")),
        };

        let mcp_path = std::env::var("WEBQA_MCP_CONFIG").unwrap_or_else(|_| "mcpservers.json".into());
        let mcp_servers = load_mcp_servers(Path::new(&mcp_path))?;

        Ok(Self {
            bind,
            llm,
            engine,
            agent,
            mcp_servers,
        })
    }
}

impl LlmConfig {
    fn load() -> Result<Self> {
        let anthropic_key = std::env::var("ANTHROPIC_API_KEY").ok();
        let openai_key = std::env::var("OPENAI_API_KEY").ok();

        let platform = match std::env::var("WEBQA_PLATFORM").ok().as_deref() {
            Some("anthropic") => Platform::Anthropic,
            Some("openai") => Platform::OpenAi,
            Some(other) => {
                return Err(
                    ConfigError::Invalid(format!("unknown WEBQA_PLATFORM: {other}")).into(),
                );
            }
            // Infer from whichever key is present.
            None if anthropic_key.is_some() => Platform::Anthropic,
            None if openai_key.is_some() => Platform::OpenAi,
            None => {
                return Err(ConfigError::Invalid(
                    "No LLM provider API key found. Set ANTHROPIC_API_KEY or OPENAI_API_KEY."
                        .into(),
                )
                .into());
            }
        };

        let api_key = match platform {
            Platform::Anthropic => anthropic_key
                .ok_or_else(|| ConfigError::MissingKey("ANTHROPIC_API_KEY".into()))?,
            Platform::OpenAi => {
                openai_key.ok_or_else(|| ConfigError::MissingKey("OPENAI_API_KEY".into()))?
            }
        };

        let model = std::env::var("WEBQA_MODEL").unwrap_or_else(|_| match platform {
            Platform::Anthropic => "claude-sonnet-4-20250514".into(),
            Platform::OpenAi => "gpt-4o-mini".into(),
        });

        let base_url = std::env::var("WEBQA_LLM_BASE_URL").unwrap_or_else(|_| match platform {
            Platform::Anthropic => "https://api.anthropic.com".into(),
            Platform::OpenAi => "https://api.openai.com".into(),
        });

        Ok(Self {
            platform,
            model,
            api_key,
            base_url,
            temperature: 0.7,
            max_tokens: 4096,
            request_timeout_secs: env_usize("WEBQA_LLM_TIMEOUT_SECS", 60)? as u64,
        })
    }
}

fn env_usize(key: &str, default: usize) -> Result<usize> {
    match std::env::var(key) {
        Ok(raw) => raw
            .parse::<usize>()
            .map_err(|_| ConfigError::Invalid(format!("{key} is not a number: {raw}")).into()),
        Err(_) => Ok(default),
    }
}

/// Load MCP server definitions. A missing file means no tools, not an
/// error; baseline QA must work without the tool service.
pub fn load_mcp_servers(path: &Path) -> Result<Vec<McpServerConfig>> {
    if !path.exists() {
        tracing::debug!(path = %path.display(), "no MCP server config file, running without tools");
        return Ok(Vec::new());
    }

    let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Load {
        path: path.display().to_string(),
        source,
    })?;

    let file: McpServerFile = serde_json::from_str(&raw)
        .with_context(|| format!("failed to parse {}", path.display()))
        .map_err(ConfigError::Other)?;

    let mut servers = Vec::with_capacity(file.mcp_servers.len());
    for (name, raw_server) in file.mcp_servers {
        let transport = match (raw_server.command, raw_server.url) {
            (Some(command), None) => McpTransport::Stdio {
                command,
                args: raw_server.args,
                env: raw_server.env,
            },
            (None, Some(url)) => McpTransport::Http {
                url,
                headers: raw_server.headers,
            },
            (Some(_), Some(_)) => {
                return Err(ConfigError::Invalid(format!(
                    "MCP server '{name}' specifies both command and url"
                ))
                .into());
            }
            (None, None) => {
                return Err(ConfigError::Invalid(format!(
                    "MCP server '{name}' specifies neither command nor url"
                ))
                .into());
            }
        };

        servers.push(McpServerConfig {
            name,
            enabled: raw_server.enabled,
            transport,
        });
    }

    // Stable order regardless of map iteration.
    servers.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(servers)
}

#[cfg(test)]
mod tests {
    use super::*;
    use indoc::indoc;

    #[test]
    fn parses_mcp_server_file_with_both_transports() {
        let raw = indoc! {r#"
            {
              "mcpServers": {
                "search": {
                  "command": "npx",
                  "args": ["-y", "@modelcontextprotocol/server-brave-search"],
                  "env": {"BRAVE_API_KEY": "${BRAVE_API_KEY}"}
                },
                "runner": {
                  "url": "https://mcp-runner.example.com/mcp",
                  "headers": {"authorization": "Bearer ${RUNNER_TOKEN}"}
                }
              }
            }
        "#};

        let file: McpServerFile = serde_json::from_str(raw).unwrap();
        assert_eq!(file.mcp_servers.len(), 2);

        let search = &file.mcp_servers["search"];
        assert_eq!(search.command.as_deref(), Some("npx"));
        assert_eq!(search.args.len(), 2);
        assert!(search.enabled);

        let runner = &file.mcp_servers["runner"];
        assert_eq!(
            runner.url.as_deref(),
            Some("https://mcp-runner.example.com/mcp")
        );
    }

    #[test]
    fn missing_mcp_file_yields_no_servers() {
        let servers = load_mcp_servers(Path::new("/definitely/not/a/real/path.json")).unwrap();
        assert!(servers.is_empty());
    }
}

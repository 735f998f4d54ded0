//! Web QA agent entry point.

use anyhow::Context as _;
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

use webqa::api::{start_http_server, ApiState};
use webqa::context::ConversationStore;
use webqa::engine::{KeywordToolPolicy, QaEngine};
use webqa::executor::TaskExecutor;
use webqa::llm::LlmClient;
use webqa::tools::CompositeGateway;
use webqa::tools::mcp::McpGateway;
use webqa::tools::web::WebAnalyzer;

#[derive(Parser)]
#[command(name = "webqa")]
#[command(about = "Context-aware conversational QA agent with MCP tool support")]
struct Cli {
    /// Path to the MCP server config file (overrides WEBQA_MCP_CONFIG)
    #[arg(short, long)]
    mcp_config: Option<std::path::PathBuf>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::fmt().with_env_filter(filter).init();

    let mut config =
        webqa::config::Config::load().with_context(|| "failed to load configuration")?;
    if let Some(path) = &cli.mcp_config {
        config.mcp_servers = webqa::config::load_mcp_servers(path)
            .with_context(|| format!("failed to load MCP config from {}", path.display()))?;
    }

    tracing::info!(
        platform = %config.llm.platform.as_str(),
        model = %config.llm.model,
        mcp_servers = config.mcp_servers.len(),
        "configuration loaded"
    );

    let backend = LlmClient::new(config.llm.clone())
        .with_context(|| "failed to initialize LLM client")?;

    let tool_timeout = Duration::from_secs(config.engine.tool_timeout_secs);
    let mcp_gateway = Arc::new(McpGateway::new(config.mcp_servers.clone(), tool_timeout));
    mcp_gateway.connect_all().await;

    // The builtin web analyzer sits in front of the MCP servers.
    let gateway = Arc::new(CompositeGateway::new(vec![
        Arc::new(WebAnalyzer::new(tool_timeout)),
        mcp_gateway.clone(),
    ]));

    let store = Arc::new(ConversationStore::new(config.engine.max_history_turns));

    let engine = Arc::new(QaEngine::new(
        store,
        gateway,
        Arc::new(backend),
        Arc::new(KeywordToolPolicy),
        config.engine.clone(),
    ));

    let executor = Arc::new(TaskExecutor::new(engine, config.agent.clone()));
    let state = Arc::new(ApiState { executor });

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let server = start_http_server(config.bind, state, shutdown_rx)
        .await
        .with_context(|| "failed to start HTTP server")?;

    tracing::info!("webqa started");

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown signal received");
        }
        result = server => {
            tracing::warn!(?result, "HTTP server task ended");
        }
    }

    let _ = shutdown_tx.send(true);
    mcp_gateway.disconnect_all().await;

    tracing::info!("webqa stopped");
    Ok(())
}

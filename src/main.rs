//! nowpilot - Tool-execution orchestrator for a ServiceNow chat assistant

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use secrecy::SecretString;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use nowpilot::api::AnthropicClient;
use nowpilot::mcp::{McpServerConfig, StdioConnector};
use nowpilot::orchestrator::{Collaborators, Orchestrator};
use nowpilot::pool::ConnectionPool;
use nowpilot::server::{self, AppState};
use nowpilot::store::MemoryStore;
use nowpilot::tools::{ToolCatalog, ToolNamespace};
use nowpilot::types::Config;

#[derive(Parser, Debug)]
#[command(name = "nowpilot")]
#[command(about = "nowpilot - Tool-execution orchestrator for a ServiceNow chat assistant")]
#[command(version)]
struct Args {
    /// Configuration file (defaults to the platform config directory)
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Address to listen on, overriding the config file
    #[arg(short, long)]
    bind: Option<String>,

    /// Number of pooled MCP connections, overriding the config file
    #[arg(long)]
    pool_size: Option<usize>,

    /// Default model, overriding the config file
    #[arg(short, long)]
    model: Option<String>,

    /// API key (or set ANTHROPIC_API_KEY env var)
    #[arg(long, env = "ANTHROPIC_API_KEY", hide_env_values = true)]
    api_key: Option<SecretString>,

    /// Enable debug logging
    #[arg(long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = if args.debug { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| filter.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let mut config = Config::load(args.config.as_deref()).context("Failed to load configuration")?;
    if let Some(bind) = args.bind {
        config.server.bind = bind;
    }
    if let Some(size) = args.pool_size {
        config.pool.size = size;
    }
    if let Some(model) = args.model {
        config.model.name = model;
    }
    config.validate().context("Invalid configuration")?;

    let api_key = args
        .api_key
        .context("No API key: pass --api-key or set ANTHROPIC_API_KEY")?;

    let connector = Arc::new(StdioConnector::new(McpServerConfig::from(&config.mcp)));
    let pool = ConnectionPool::initialize(&config.pool, connector)
        .await
        .context("Could not reach the tool-execution server")?;

    let namespace = ToolNamespace::new(config.mcp.tool_prefix.clone());
    let catalog = ToolCatalog::from_mcp(
        pool.discover_tools()
            .await
            .context("Failed to list server tools")?,
        &namespace,
    );
    tracing::info!(tools = catalog.len(), "Tool catalog loaded");

    let shutdown = CancellationToken::new();
    let interval = config.pool.health_check_interval;
    let health = (!interval.is_zero())
        .then(|| pool.spawn_health_monitor(interval, shutdown.child_token()));

    let model = Arc::new(AnthropicClient::new(api_key, &config.model));
    let orchestrator = Orchestrator::new(
        &config,
        pool,
        catalog,
        Collaborators {
            selector: model.clone(),
            generator: model,
            store: Arc::new(MemoryStore::new()),
        },
    );

    let listener = tokio::net::TcpListener::bind(&config.server.bind)
        .await
        .with_context(|| format!("Failed to bind {}", config.server.bind))?;
    let state = AppState {
        orchestrator: Arc::clone(&orchestrator),
        heartbeat: config.server.heartbeat,
    };

    let signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Interrupt received, shutting down");
        }
        signal.cancel();
    });

    server::serve(listener, state, shutdown.clone())
        .await
        .context("Gateway failed")?;

    shutdown.cancel();
    orchestrator.shutdown(config.pool.shutdown_grace).await;
    if let Some(health) = health {
        health.abort();
    }
    Ok(())
}

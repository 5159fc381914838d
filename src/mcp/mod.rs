//! MCP (Model Context Protocol) client
//!
//! Each pooled connection is one server process driven over stdio by an
//! [`McpClient`]. [`StdioConnector`] is how the pool creates them.

pub mod client;
pub mod protocol;
pub mod transport;

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use tracing::info;

use crate::error::PilotResult;
use crate::pool::{Connector, ToolConnection};
use crate::types::config::McpSettings;

pub use client::McpClient;
pub use protocol::McpTool;

/// How to start one MCP server process.
#[derive(Debug, Clone)]
pub struct McpServerConfig {
    pub command: String,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
    pub request_timeout: Duration,
}

impl From<&McpSettings> for McpServerConfig {
    fn from(settings: &McpSettings) -> Self {
        Self {
            command: settings.command.clone(),
            args: settings.args.clone(),
            env: settings.env.clone(),
            request_timeout: settings.request_timeout,
        }
    }
}

/// Opens pooled connections by spawning the configured server.
#[derive(Debug, Clone)]
pub struct StdioConnector {
    config: McpServerConfig,
}

impl StdioConnector {
    #[must_use]
    pub fn new(config: McpServerConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Connector for StdioConnector {
    async fn connect(&self) -> PilotResult<Box<dyn ToolConnection>> {
        info!(command = %self.config.command, "Starting MCP server connection");
        let client = McpClient::connect(&self.config).await?;
        Ok(Box::new(client))
    }
}

//! MCP client over one server process.
//!
//! An [`McpClient`] owns one [`StdioTransport`], performs the `initialize`
//! handshake, and exposes the three operations the orchestrator needs:
//! `tools/list`, `tools/call` and `ping`. Every failure is classified into
//! a [`PilotError`] so the retry queue can tell a broken pipe from a tool
//! that reported an error.
//!
//! # Example
//!
//! ```ignore
//! use nowpilot::mcp::{client::McpClient, McpServerConfig};
//!
//! # async fn run(config: McpServerConfig) -> nowpilot::error::PilotResult<()> {
//! let mut client = McpClient::connect(&config).await?;
//! let tools = client.list_tools().await?;
//! println!("{} tools available", tools.len());
//! client.stop().await;
//! # Ok(())
//! # }
//! ```

use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

use crate::error::{PilotError, PilotResult};
use crate::mcp::protocol::{
    CallToolResult, JsonRpcError, JsonRpcRequest, McpTool, METHOD_NOT_FOUND, PROTOCOL_VERSION,
};
use crate::mcp::transport::{StdioTransport, Transport};
use crate::mcp::McpServerConfig;
use crate::pool::{ProgressSink, ToolConnection};
use crate::tools::ToolOutput;

/// MCP server information from the initialize response.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ServerInfo {
    /// Server name
    pub name: String,
    /// Server version
    #[serde(default)]
    pub version: String,
}

/// High-level MCP client for one server process.
pub struct McpClient {
    /// Underlying transport
    transport: StdioTransport,
    /// Request ID counter
    request_id: AtomicI64,
    /// Per-request timeout
    timeout: Duration,
    /// Server info (set after initialization)
    server_info: Option<ServerInfo>,
}

impl McpClient {
    /// Creates a client that has not yet started its server.
    #[must_use]
    pub fn new(config: &McpServerConfig) -> Self {
        Self {
            transport: StdioTransport::new(
                config.command.clone(),
                config.args.clone(),
                config.env.clone(),
            ),
            request_id: AtomicI64::new(1),
            timeout: config.request_timeout,
            server_info: None,
        }
    }

    /// Spawns the server and performs the handshake.
    ///
    /// # Errors
    ///
    /// Returns a transport error if the server cannot be started or does
    /// not complete the handshake.
    pub async fn connect(config: &McpServerConfig) -> PilotResult<Self> {
        let mut client = Self::new(config);
        client.start().await?;
        Ok(client)
    }

    /// Returns the server info, if initialized.
    #[must_use]
    pub fn server_info(&self) -> Option<&ServerInfo> {
        self.server_info.as_ref()
    }

    fn next_request_id(&self) -> i64 {
        self.request_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Starts the server process and performs initialization.
    ///
    /// # Errors
    ///
    /// Returns an error if the server cannot be started or initialized.
    pub async fn start(&mut self) -> PilotResult<()> {
        self.transport.start().await?;
        if let Err(e) = self.initialize().await {
            self.transport.stop().await;
            return Err(e);
        }
        Ok(())
    }

    async fn initialize(&mut self) -> PilotResult<()> {
        let request = JsonRpcRequest::new(
            self.next_request_id(),
            "initialize",
            json!({
                "protocolVersion": PROTOCOL_VERSION,
                "capabilities": {},
                "clientInfo": {
                    "name": "nowpilot",
                    "version": env!("CARGO_PKG_VERSION")
                }
            }),
        );

        let result = self
            .transport
            .send_request(request, self.timeout)
            .await?
            .into_result()
            .map_err(|e| PilotError::transport(format!("initialize rejected: {e}")))?;

        self.server_info = result
            .get("serverInfo")
            .and_then(|info| serde_json::from_value(info.clone()).ok());
        if let Some(info) = &self.server_info {
            debug!(server = %info.name, version = %info.version, "MCP server initialized");
        }

        let notification = JsonRpcRequest::notification("notifications/initialized", json!({}));
        self.transport.send_notification(notification).await
    }

    /// Stops the server process.
    pub async fn stop(&mut self) {
        self.transport.stop().await;
    }

    /// Lists the tools the server offers.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails or the response is malformed.
    pub async fn list_tools(&mut self) -> PilotResult<Vec<McpTool>> {
        let request = JsonRpcRequest::new(self.next_request_id(), "tools/list", json!({}));
        let result = self
            .transport
            .send_request(request, self.timeout)
            .await?
            .into_result()
            .map_err(|e| PilotError::protocol(format!("tools/list failed: {e}")))?;

        let tools = result
            .get("tools")
            .cloned()
            .ok_or_else(|| PilotError::protocol("tools/list result has no tools field"))?;
        Ok(serde_json::from_value(tools)?)
    }

    /// Checks that the server still answers.
    ///
    /// # Errors
    ///
    /// Returns a transport error if the server does not answer in time.
    pub async fn ping(&mut self) -> PilotResult<()> {
        let request = JsonRpcRequest::new(self.next_request_id(), "ping", json!({}));
        self.transport
            .send_request(request, self.timeout)
            .await?
            .into_result()
            .map(|_| ())
            .map_err(|e| PilotError::protocol(format!("ping failed: {e}")))
    }

    /// Calls a tool by its wire name.
    ///
    /// Progress notifications for this call are forwarded to `progress`
    /// as percentages.
    ///
    /// # Errors
    ///
    /// Transport failures are returned as-is. A JSON-RPC "invalid params"
    /// error becomes [`PilotError::InvalidArguments`]; any other JSON-RPC
    /// error, or a result flagged `isError`, becomes
    /// [`PilotError::ToolFailed`].
    pub async fn call_tool(
        &mut self,
        name: &str,
        arguments: &Value,
        progress: Option<ProgressSink>,
    ) -> PilotResult<ToolOutput> {
        let id = self.next_request_id();
        let mut params = json!({
            "name": name,
            "arguments": arguments,
        });
        if let Some(tx) = progress {
            params["_meta"] = json!({ "progressToken": id });
            self.transport.register_progress(id, tx).await;
        }

        let request = JsonRpcRequest::new(id, "tools/call", params);
        let response = self.transport.send_request(request, self.timeout).await;
        self.transport.unregister_progress(id).await;

        let result = response?
            .into_result()
            .map_err(|e| classify_call_error(name, &e))?;
        let result: CallToolResult = serde_json::from_value(result)?;

        let text = result.text();
        if result.is_error {
            return Err(PilotError::tool_failed(name, text));
        }
        Ok(ToolOutput::from_text(text))
    }
}

fn classify_call_error(tool: &str, error: &JsonRpcError) -> PilotError {
    if error.is_invalid_params() {
        PilotError::invalid_arguments(tool, error.message())
    } else if error.code() == METHOD_NOT_FOUND {
        PilotError::tool_failed(tool, "tool is not available on the server")
    } else {
        PilotError::tool_failed(tool, error.message())
    }
}

#[async_trait]
impl ToolConnection for McpClient {
    async fn call_tool(
        &mut self,
        name: &str,
        arguments: &Value,
        progress: Option<ProgressSink>,
    ) -> PilotResult<ToolOutput> {
        McpClient::call_tool(self, name, arguments, progress).await
    }

    async fn list_tools(&mut self) -> PilotResult<Vec<McpTool>> {
        McpClient::list_tools(self).await
    }

    async fn ping(&mut self) -> PilotResult<()> {
        McpClient::ping(self).await
    }

    fn is_alive(&self) -> bool {
        self.transport.is_alive()
    }

    async fn close(&mut self) {
        self.stop().await;
    }
}

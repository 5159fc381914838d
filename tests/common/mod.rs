//! Common test utilities and fixtures for nowpilot.
//!
//! This module provides shared test infrastructure including:
//! - A scripted tool-execution server ([`ScriptedConnector`])
//! - Scripted language model collaborators
//! - Event collection helpers

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::mpsc;

use nowpilot::api::{GenerationRequest, PlannedTool, SelectionRequest, TextGenerator, ToolSelector};
use nowpilot::error::{PilotError, PilotResult};
use nowpilot::mcp::McpTool;
use nowpilot::pool::{Connector, ProgressSink, ToolConnection};
use nowpilot::tools::{ToolCatalog, ToolNamespace, ToolOutput};
use nowpilot::types::config::{PoolSettings, RetrySettings};
use nowpilot::types::{Config, ServerEvent};

/// What the scripted server does for one call.
#[derive(Debug, Clone)]
pub enum Step {
    /// Answer with this JSON result.
    Reply(Value),
    /// Answer after a delay.
    Slow(Duration, Value),
    /// Report progress percentages, then answer.
    Progress(Vec<u8>, Value),
    /// Drop the connection mid-call.
    Transport,
    /// The tool reports a failure.
    ToolError(String),
    /// Never answer.
    Hang,
}

/// Shared state of every connection a [`ScriptedConnector`] opens.
#[derive(Default)]
pub struct ServerState {
    steps: Mutex<VecDeque<Step>>,
    calls: Mutex<Vec<String>>,
    pub opened: AtomicUsize,
    pub closed: AtomicUsize,
    pub in_flight: AtomicUsize,
    pub max_in_flight: AtomicUsize,
}

impl ServerState {
    /// Wire names of every call received, in order.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn push(&self, step: Step) {
        self.steps.lock().unwrap().push_back(step);
    }

    fn next_step(&self) -> Step {
        self.steps
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Step::Reply(json!({"ok": true})))
    }
}

/// Opens [`ScriptedConnection`]s that follow a shared script.
#[derive(Clone, Default)]
pub struct ScriptedConnector {
    pub state: Arc<ServerState>,
}

impl ScriptedConnector {
    pub fn new(steps: impl IntoIterator<Item = Step>) -> Self {
        let connector = Self::default();
        for step in steps {
            connector.state.push(step);
        }
        connector
    }
}

#[async_trait]
impl Connector for ScriptedConnector {
    async fn connect(&self) -> PilotResult<Box<dyn ToolConnection>> {
        self.state.opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(ScriptedConnection {
            state: Arc::clone(&self.state),
            alive: true,
        }))
    }
}

/// A connection that follows the script of its [`ServerState`].
pub struct ScriptedConnection {
    state: Arc<ServerState>,
    alive: bool,
}

struct InFlight<'a>(&'a ServerState);

impl<'a> InFlight<'a> {
    fn enter(state: &'a ServerState) -> Self {
        let now = state.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        state.max_in_flight.fetch_max(now, Ordering::SeqCst);
        Self(state)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl ToolConnection for ScriptedConnection {
    async fn call_tool(
        &mut self,
        name: &str,
        _arguments: &Value,
        progress: Option<ProgressSink>,
    ) -> PilotResult<ToolOutput> {
        self.state.calls.lock().unwrap().push(name.to_string());
        let _flight = InFlight::enter(&self.state);

        match self.state.next_step() {
            Step::Reply(value) => Ok(output(value)),
            Step::Slow(delay, value) => {
                tokio::time::sleep(delay).await;
                Ok(output(value))
            }
            Step::Progress(percents, value) => {
                if let Some(tx) = progress {
                    for percent in percents {
                        let _ = tx.send(percent);
                        tokio::task::yield_now().await;
                    }
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
                Ok(output(value))
            }
            Step::Transport => {
                self.alive = false;
                Err(PilotError::transport("connection reset by peer"))
            }
            Step::ToolError(message) => Err(PilotError::tool_failed(name, message)),
            Step::Hang => std::future::pending().await,
        }
    }

    async fn list_tools(&mut self) -> PilotResult<Vec<McpTool>> {
        Ok(vec![
            mcp_tool("create_incident", "Create an incident"),
            mcp_tool("get_incident", "Look up an incident"),
            mcp_tool("delete_record", "Delete a record"),
        ])
    }

    async fn ping(&mut self) -> PilotResult<()> {
        if self.alive {
            Ok(())
        } else {
            Err(PilotError::transport("connection closed"))
        }
    }

    fn is_alive(&self) -> bool {
        self.alive
    }

    async fn close(&mut self) {
        self.state.closed.fetch_add(1, Ordering::SeqCst);
    }
}

fn output(value: Value) -> ToolOutput {
    ToolOutput::from_text(value.to_string())
}

fn mcp_tool(name: &str, description: &str) -> McpTool {
    serde_json::from_value(json!({
        "name": name,
        "description": description,
        "inputSchema": {"type": "object"}
    }))
    .unwrap()
}

/// The catalog the scripted server offers, under the `servicenow` namespace.
pub fn catalog() -> ToolCatalog {
    ToolCatalog::from_mcp(
        vec![
            mcp_tool("create_incident", "Create an incident"),
            mcp_tool("get_incident", "Look up an incident"),
            mcp_tool("delete_record", "Delete a record"),
        ],
        &ToolNamespace::new("servicenow"),
    )
}

/// Returns the same plan for every message.
pub struct ScriptedSelector {
    plan: Mutex<Option<PilotResult<Vec<PlannedTool>>>>,
    fixed: Vec<PlannedTool>,
}

impl ScriptedSelector {
    pub fn new(plan: Vec<PlannedTool>) -> Self {
        Self {
            plan: Mutex::new(None),
            fixed: plan,
        }
    }

    /// Fails the first selection.
    pub fn failing() -> Self {
        Self {
            plan: Mutex::new(Some(Err(PilotError::generation("planner unavailable")))),
            fixed: Vec::new(),
        }
    }
}

#[async_trait]
impl ToolSelector for ScriptedSelector {
    async fn select(&self, _request: &SelectionRequest) -> PilotResult<Vec<PlannedTool>> {
        match self.plan.lock().unwrap().take() {
            Some(result) => result,
            None => Ok(self.fixed.clone()),
        }
    }
}

/// Streams fixed chunks, or fails.
pub struct ScriptedGenerator {
    chunks: Vec<String>,
    fail: bool,
    /// Requests seen, for asserting what the model was given.
    pub requests: Mutex<Vec<GenerationRequest>>,
}

impl ScriptedGenerator {
    pub fn new(chunks: &[&str]) -> Self {
        Self {
            chunks: chunks.iter().map(|c| (*c).to_string()).collect(),
            fail: false,
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn failing() -> Self {
        Self {
            chunks: vec!["partial ".to_string()],
            fail: true,
            requests: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl TextGenerator for ScriptedGenerator {
    async fn stream_reply(
        &self,
        request: &GenerationRequest,
        chunks: mpsc::Sender<String>,
    ) -> PilotResult<()> {
        self.requests.lock().unwrap().push(request.clone());
        for chunk in &self.chunks {
            if chunks.send(chunk.clone()).await.is_err() {
                return Ok(());
            }
        }
        if self.fail {
            return Err(PilotError::generation("model overloaded"));
        }
        Ok(())
    }
}

/// Pool settings with short timeouts.
pub fn pool_settings(size: usize) -> PoolSettings {
    PoolSettings {
        size,
        acquire_timeout: Duration::from_millis(200),
        ..PoolSettings::default()
    }
}

/// Retry settings with a short base delay.
pub fn retry_settings(max_retries: u32, base_delay: Duration) -> RetrySettings {
    RetrySettings {
        max_retries,
        base_delay,
        retry_tool_errors: false,
    }
}

/// A configuration suitable for in-process tests.
pub fn test_config() -> Config {
    let mut config = Config::default();
    config.pool = pool_settings(2);
    config.retry = retry_settings(3, Duration::from_millis(20));
    config.approval.required = vec!["*delete*".to_string()];
    config.session.cancel_grace = Duration::from_millis(100);
    config.rate_limit.max_messages = 0;
    config.rate_limit.max_tool_calls = 0;
    config
}

/// Receives events until a terminal one arrives or `limit` elapses.
pub async fn collect_until_terminal(
    rx: &mut mpsc::UnboundedReceiver<ServerEvent>,
    limit: Duration,
) -> Vec<ServerEvent> {
    let mut events = Vec::new();
    let _ = tokio::time::timeout(limit, async {
        while let Some(event) = rx.recv().await {
            let terminal = event.is_terminal();
            events.push(event);
            if terminal {
                break;
            }
        }
    })
    .await;
    events
}

/// Event names, in order.
pub fn names(events: &[ServerEvent]) -> Vec<&'static str> {
    events.iter().map(ServerEvent::name).collect()
}

/// Event names with consecutive `text.chunk`s collapsed into one.
pub fn shape(events: &[ServerEvent]) -> Vec<&'static str> {
    let mut shape = names(events);
    shape.dedup_by(|a, b| *a == "text.chunk" && *b == "text.chunk");
    shape
}

//! nowpilot - Tool-execution orchestrator for a ServiceNow chat assistant
//!
//! A browser client sends user messages over a WebSocket. For each message
//! the orchestrator asks the language model which ServiceNow tools to run,
//! executes them on a bounded pool of MCP server connections through a
//! single retrying queue (pausing for human approval where required), and
//! streams the model's answer back with the tool lifecycle interleaved.

pub mod api;
pub mod approval;
pub mod error;
pub mod mcp;
pub mod orchestrator;
pub mod pool;
pub mod ratelimit;
pub mod server;
pub mod session;
pub mod store;
pub mod tools;
pub mod types;

// Re-export core types for convenient access
pub use error::{PilotError, PilotResult};
pub use types::{ClientMessage, Config, ServerEvent};

//! Core type definitions for nowpilot.
//!
//! - [`config`] - Configuration file schema
//! - [`events`] - Client/server wire protocol
//! - [`ids`] - Identifier newtypes
//! - [`message`] - Stored and context messages

pub mod config;
pub mod events;
pub mod ids;
pub mod message;

// Re-export common types for convenience
pub use config::Config;
pub use events::{ClientMessage, EventSink, FinalMessage, ServerEvent};
pub use ids::{ApprovalId, ExecutionId, MessageId, SessionId, ToolCallId};
pub use message::{ContextMessage, Role, StoredMessage};

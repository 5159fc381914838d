//! Centralized error types for nowpilot.
//!
//! This module provides a unified error type (`PilotError`) covering every
//! failure the orchestrator can observe, from pool exhaustion to persistence
//! hiccups. The categories drive retry decisions in the queue and decide
//! what the browser client is allowed to see.
//!
//! # Example
//!
//! ```
//! use nowpilot::error::{PilotError, PilotResult};
//!
//! fn check_arguments(args: &serde_json::Value) -> PilotResult<()> {
//!     if !args.is_object() {
//!         return Err(PilotError::invalid_arguments("create_incident", "expected an object"));
//!     }
//!     Ok(())
//! }
//!
//! let err = check_arguments(&serde_json::json!(42)).unwrap_err();
//! assert!(!err.is_retryable());
//! ```

use std::fmt;

/// Result type alias using `PilotError`.
pub type PilotResult<T> = Result<T, PilotError>;

/// Centralized error type for nowpilot.
#[derive(Debug)]
pub enum PilotError {
    // ============== Pool Errors ==============
    /// No pooled connection became available within the wait timeout.
    PoolExhausted {
        /// How long the caller waited, in milliseconds.
        waited_ms: u64,
    },

    /// The pool has been shut down.
    PoolClosed,

    // ============== MCP Errors ==============
    /// The connection to the tool-execution server failed mid-call.
    Transport {
        /// Description of the transport error.
        message: String,
    },

    /// The server sent something that is not valid MCP.
    Protocol {
        /// Description of the protocol error.
        message: String,
    },

    // ============== Tool Errors ==============
    /// The remote tool ran and reported a failure.
    ToolFailed {
        /// Display name of the tool.
        tool: String,
        /// Error reported by the tool.
        message: String,
    },

    /// The tool rejected its arguments.
    InvalidArguments {
        /// Display name of the tool.
        tool: String,
        /// Why the arguments were rejected.
        message: String,
    },

    /// The user denied the tool call.
    ApprovalDenied {
        /// Display name of the tool.
        tool: String,
        /// Optional reason given by the user.
        reason: Option<String>,
    },

    /// A retryable failure kept happening until the retry budget ran out.
    RetriesExhausted {
        /// Display name of the tool.
        tool: String,
        /// Number of attempts made.
        attempts: u32,
        /// The last failure observed.
        last_error: String,
    },

    // ============== Queue / Session Errors ==============
    /// The retry queue was cleared before the request ran.
    QueueCleared,

    /// The owning session was cancelled.
    Cancelled,

    /// The session is in a state that does not allow the operation.
    InvalidState {
        /// Description of the state violation.
        message: String,
    },

    /// A referenced entity (session, approval, message) does not exist.
    NotFound {
        /// What kind of entity.
        kind: &'static str,
        /// Its identifier.
        id: String,
    },

    // ============== Collaborator Errors ==============
    /// The language model failed while generating text or planning tools.
    Generation {
        /// Description of the failure.
        message: String,
    },

    /// The chat store failed.
    Persistence {
        /// Description of the failure.
        message: String,
    },

    /// The rate limiter rejected the request.
    RateLimited {
        /// Retry after this many milliseconds.
        retry_after_ms: u64,
    },

    // ============== Wrapped Errors ==============
    /// Error from anyhow or other sources.
    Other {
        /// The wrapped error message.
        message: String,
        /// The original error, if available.
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

// ============== Constructor Methods ==============

impl PilotError {
    /// Creates a pool exhausted error.
    #[must_use]
    pub fn pool_exhausted(waited_ms: u64) -> Self {
        Self::PoolExhausted { waited_ms }
    }

    /// Creates a transport error.
    #[must_use]
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
        }
    }

    /// Creates a protocol error.
    #[must_use]
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    /// Creates a tool-level failure.
    #[must_use]
    pub fn tool_failed(tool: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ToolFailed {
            tool: tool.into(),
            message: message.into(),
        }
    }

    /// Creates an invalid arguments error.
    #[must_use]
    pub fn invalid_arguments(tool: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidArguments {
            tool: tool.into(),
            message: message.into(),
        }
    }

    /// Creates an approval denial.
    #[must_use]
    pub fn approval_denied(tool: impl Into<String>, reason: Option<String>) -> Self {
        Self::ApprovalDenied {
            tool: tool.into(),
            reason,
        }
    }

    /// Creates a retries exhausted error.
    #[must_use]
    pub fn retries_exhausted(
        tool: impl Into<String>,
        attempts: u32,
        last_error: impl Into<String>,
    ) -> Self {
        Self::RetriesExhausted {
            tool: tool.into(),
            attempts,
            last_error: last_error.into(),
        }
    }

    /// Creates an invalid state error.
    #[must_use]
    pub fn invalid_state(message: impl Into<String>) -> Self {
        Self::InvalidState {
            message: message.into(),
        }
    }

    /// Creates a not found error.
    #[must_use]
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            id: id.into(),
        }
    }

    /// Creates a generation error.
    #[must_use]
    pub fn generation(message: impl Into<String>) -> Self {
        Self::Generation {
            message: message.into(),
        }
    }

    /// Creates a persistence error.
    #[must_use]
    pub fn persistence(message: impl Into<String>) -> Self {
        Self::Persistence {
            message: message.into(),
        }
    }

    /// Creates a rate limited error.
    #[must_use]
    pub fn rate_limited(retry_after_ms: u64) -> Self {
        Self::RateLimited { retry_after_ms }
    }
}

// ============== Category Methods ==============

impl PilotError {
    /// Returns `true` if the retry queue should try this call again.
    ///
    /// Only failures of the path to the server are retryable. Tool-level
    /// failures are decided by the queue's retry policy.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::PoolExhausted { .. } | Self::Transport { .. })
    }

    /// Returns `true` if the remote tool itself reported the failure.
    #[must_use]
    pub fn is_tool_level(&self) -> bool {
        matches!(self, Self::ToolFailed { .. })
    }

    /// Returns `true` if the pooled connection that produced this error
    /// must not be reused.
    #[must_use]
    pub fn poisons_connection(&self) -> bool {
        matches!(self, Self::Transport { .. } | Self::Protocol { .. })
    }

    /// Re-labels a tool error with the tool's display name.
    #[must_use]
    pub fn for_tool(self, display: &str) -> Self {
        match self {
            Self::ToolFailed { message, .. } => Self::tool_failed(display, message),
            Self::InvalidArguments { message, .. } => Self::invalid_arguments(display, message),
            other => other,
        }
    }

    /// Returns the module name where this error originated.
    #[must_use]
    pub fn module(&self) -> &'static str {
        match self {
            Self::PoolExhausted { .. } | Self::PoolClosed => "pool",

            Self::Transport { .. } | Self::Protocol { .. } => "mcp",

            Self::ToolFailed { .. }
            | Self::InvalidArguments { .. }
            | Self::ApprovalDenied { .. }
            | Self::RetriesExhausted { .. } => "tools",

            Self::QueueCleared => "queue",

            Self::Cancelled | Self::InvalidState { .. } | Self::NotFound { .. } => "session",

            Self::Generation { .. } => "api",

            Self::Persistence { .. } => "store",

            Self::RateLimited { .. } => "ratelimit",

            Self::Other { .. } => "unknown",
        }
    }

    /// Returns a message that is safe to show to the end user.
    ///
    /// Internal details (server output, transport errors) are replaced by
    /// a generic description of what went wrong.
    #[must_use]
    pub fn user_message(&self) -> String {
        match self {
            Self::PoolExhausted { .. } | Self::PoolClosed | Self::Transport { .. } => {
                "The ServiceNow connection is unavailable right now. Please try again.".to_string()
            }
            Self::Protocol { .. } => "The ServiceNow connection returned an unexpected response.".to_string(),
            Self::ToolFailed { tool, message } => format!("{tool} failed: {message}"),
            Self::InvalidArguments { tool, message } => {
                format!("{tool} rejected its arguments: {message}")
            }
            Self::ApprovalDenied { tool, reason } => match reason {
                Some(reason) => format!("{tool} was denied: {reason}"),
                None => format!("{tool} was denied"),
            },
            Self::RetriesExhausted { tool, attempts, .. } => {
                format!("{tool} could not be completed after {attempts} attempts")
            }
            Self::QueueCleared => "The request was dropped because the server is shutting down.".to_string(),
            Self::Cancelled => "The request was cancelled.".to_string(),
            Self::InvalidState { .. } | Self::NotFound { .. } => {
                "The request does not match any active conversation.".to_string()
            }
            Self::Generation { .. } => "The assistant could not generate a response.".to_string(),
            Self::Persistence { .. } => "The conversation could not be saved.".to_string(),
            Self::RateLimited { retry_after_ms } => format!(
                "Too many requests. Try again in {} seconds.",
                retry_after_ms.div_ceil(1000)
            ),
            Self::Other { .. } => "Something went wrong.".to_string(),
        }
    }
}

// ============== Display Implementation ==============

impl fmt::Display for PilotError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            // Pool errors
            Self::PoolExhausted { waited_ms } => {
                write!(f, "pool: no connection available after {} ms", waited_ms)
            }
            Self::PoolClosed => write!(f, "pool: closed"),

            // MCP errors
            Self::Transport { message } => write!(f, "mcp: transport error: {}", message),
            Self::Protocol { message } => write!(f, "mcp: protocol error: {}", message),

            // Tool errors
            Self::ToolFailed { tool, message } => {
                write!(f, "tools: '{}' failed: {}", tool, message)
            }
            Self::InvalidArguments { tool, message } => {
                write!(f, "tools: invalid arguments for '{}': {}", tool, message)
            }
            Self::ApprovalDenied { tool, reason } => match reason {
                Some(reason) => write!(f, "tools: '{}' denied: {}", tool, reason),
                None => write!(f, "tools: '{}' denied", tool),
            },
            Self::RetriesExhausted {
                tool,
                attempts,
                last_error,
            } => write!(
                f,
                "tools: retries exhausted for '{}' after {} attempts: {}",
                tool, attempts, last_error
            ),

            // Queue / session errors
            Self::QueueCleared => write!(f, "queue: queue cleared"),
            Self::Cancelled => write!(f, "session: cancelled"),
            Self::InvalidState { message } => write!(f, "session: invalid state: {}", message),
            Self::NotFound { kind, id } => write!(f, "session: {} '{}' not found", kind, id),

            // Collaborator errors
            Self::Generation { message } => write!(f, "api: generation failed: {}", message),
            Self::Persistence { message } => write!(f, "store: {}", message),
            Self::RateLimited { retry_after_ms } => {
                write!(f, "ratelimit: rejected, retry after {} ms", retry_after_ms)
            }

            // Other errors
            Self::Other { message, .. } => write!(f, "error: {}", message),
        }
    }
}

// ============== Error Implementation ==============

impl std::error::Error for PilotError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Other {
                source: Some(src), ..
            } => Some(src.as_ref()),
            _ => None,
        }
    }
}

// ============== Conversion Implementations ==============

impl From<anyhow::Error> for PilotError {
    fn from(err: anyhow::Error) -> Self {
        // anyhow::Error is not std::error::Error, so only the message chain is kept
        Self::Other {
            message: format!("{:#}", err),
            source: None,
        }
    }
}

impl From<serde_json::Error> for PilotError {
    fn from(err: serde_json::Error) -> Self {
        Self::Protocol {
            message: err.to_string(),
        }
    }
}

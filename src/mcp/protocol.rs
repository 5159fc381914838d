//! JSON-RPC 2.0 framing and the MCP payloads nowpilot uses.
//!
//! Only the subset of MCP needed to run tools is modelled: the
//! `initialize` handshake, `tools/list`, `tools/call`, `ping`, and the
//! `notifications/progress` notification a server may send while a call
//! runs.
//!
//! ```
//! use nowpilot::mcp::protocol::JsonRpcRequest;
//! use serde_json::json;
//!
//! let request = JsonRpcRequest::new(1, "tools/list", json!({}));
//! let wire = serde_json::to_string(&request).unwrap();
//! assert!(wire.contains("\"jsonrpc\":\"2.0\""));
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// MCP protocol revision sent during the handshake.
pub const PROTOCOL_VERSION: &str = "2024-11-05";

/// JSON-RPC "invalid params" error code.
pub const INVALID_PARAMS: i32 = -32602;

/// JSON-RPC "method not found" error code.
pub const METHOD_NOT_FOUND: i32 = -32601;

/// A JSON-RPC 2.0 request or notification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    jsonrpc: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<i64>,
    method: String,
    #[serde(default)]
    params: Value,
}

impl JsonRpcRequest {
    /// Creates a request expecting a response.
    #[must_use]
    pub fn new(id: i64, method: &str, params: Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id: Some(id),
            method: method.to_string(),
            params,
        }
    }

    /// Creates a notification (no id, no response).
    #[must_use]
    pub fn notification(method: &str, params: Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id: None,
            method: method.to_string(),
            params,
        }
    }

    /// Returns the method name.
    #[must_use]
    pub fn method(&self) -> &str {
        &self.method
    }

    /// Returns the request ID, if present.
    #[must_use]
    pub fn id(&self) -> Option<i64> {
        self.id
    }

    /// Returns the parameters.
    #[must_use]
    pub fn params(&self) -> &Value {
        &self.params
    }
}

/// A JSON-RPC 2.0 error object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcError {
    code: i32,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<Value>,
}

impl JsonRpcError {
    /// Creates a new error object.
    #[must_use]
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    /// Returns the error code.
    #[must_use]
    pub fn code(&self) -> i32 {
        self.code
    }

    /// Returns the error message.
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Returns true if the server rejected the call's parameters.
    #[must_use]
    pub fn is_invalid_params(&self) -> bool {
        self.code == INVALID_PARAMS
    }
}

impl std::fmt::Display for JsonRpcError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

impl std::error::Error for JsonRpcError {}

/// A JSON-RPC 2.0 response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    jsonrpc: String,
    #[serde(default)]
    id: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<JsonRpcError>,
}

impl JsonRpcResponse {
    /// Creates a successful response.
    #[must_use]
    pub fn success(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id: Some(id),
            result: Some(result),
            error: None,
        }
    }

    /// Creates an error response.
    #[must_use]
    pub fn failure(id: Option<Value>, error: JsonRpcError) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            result: None,
            error: Some(error),
        }
    }

    /// Returns the numeric request ID this response answers.
    #[must_use]
    pub fn numeric_id(&self) -> Option<i64> {
        self.id.as_ref().and_then(Value::as_i64)
    }

    /// Consumes the response and returns the result or error.
    ///
    /// # Errors
    ///
    /// Returns the `JsonRpcError` if this is an error response.
    pub fn into_result(self) -> Result<Value, JsonRpcError> {
        match self.error {
            Some(error) => Err(error),
            None => Ok(self.result.unwrap_or(Value::Null)),
        }
    }
}

/// Anything the server may write on its stdout.
#[derive(Debug, Clone)]
pub enum IncomingMessage {
    /// Answer to one of our requests.
    Response(JsonRpcResponse),
    /// Server-initiated notification.
    Notification { method: String, params: Value },
}

impl IncomingMessage {
    /// Classifies one line of server output.
    ///
    /// # Errors
    ///
    /// Returns an error if the line is not a JSON-RPC message.
    pub fn parse(line: &str) -> Result<Self, serde_json::Error> {
        let value: Value = serde_json::from_str(line)?;
        let is_notification = value.get("method").is_some() && value.get("id").is_none();
        if is_notification {
            let method = value
                .get("method")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            let params = value.get("params").cloned().unwrap_or(Value::Null);
            Ok(Self::Notification { method, params })
        } else {
            Ok(Self::Response(serde_json::from_value(value)?))
        }
    }
}

/// Tool definition from a `tools/list` response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct McpTool {
    /// Wire-level tool name.
    pub name: String,
    /// Human-readable description.
    #[serde(default)]
    pub description: String,
    /// JSON Schema for the arguments.
    #[serde(rename = "inputSchema", default)]
    pub input_schema: Value,
}

/// One content item of a `tools/call` result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ToolContent {
    /// Plain text.
    Text { text: String },
    /// Anything else (images, embedded resources); kept opaque.
    #[serde(other)]
    Other,
}

/// Result body of `tools/call`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallToolResult {
    /// Content items.
    #[serde(default)]
    pub content: Vec<ToolContent>,
    /// Set by the server when the tool itself failed.
    #[serde(rename = "isError", default)]
    pub is_error: bool,
}

impl CallToolResult {
    /// Joins all text content items with newlines.
    #[must_use]
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(|item| match item {
                ToolContent::Text { text } => Some(text.as_str()),
                ToolContent::Other => None,
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Parameters of `notifications/progress`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ProgressParams {
    /// Token we attached to the originating request.
    #[serde(rename = "progressToken")]
    pub progress_token: Value,
    /// Work done so far.
    pub progress: f64,
    /// Total work, when known.
    #[serde(default)]
    pub total: Option<f64>,
}

impl ProgressParams {
    /// Converts the notification into a percentage, when it can be.
    ///
    /// Without a total the value is taken as a percentage already.
    #[must_use]
    pub fn percent(&self) -> u8 {
        let ratio = match self.total {
            Some(total) if total > 0.0 => self.progress / total * 100.0,
            _ => self.progress,
        };
        ratio.clamp(0.0, 100.0).round() as u8
    }
}

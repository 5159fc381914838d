//! Anthropic Messages API client.

use async_trait::async_trait;
use futures::StreamExt;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::{GenerationRequest, PlannedTool, SelectionRequest, TextGenerator, ToolSelector};
use crate::error::{PilotError, PilotResult};
use crate::types::config::ModelSettings;
use crate::types::{ContextMessage, Role};

const API_VERSION: &str = "2023-06-01";

const SELECTION_PROMPT: &str = "You operate a ServiceNow instance through the tools provided. \
    Call the tools needed to fulfil the user's request, in the order they should run. \
    Do not call a tool when the request can be answered without one.";

const RESPONSE_PROMPT: &str = "You are a ServiceNow assistant. Answer the user's request. \
    When tool results are included, base your answer on them and mention record numbers \
    they contain. If a tool failed or was denied, say so plainly.";

/// Client for the Messages API.
#[derive(Clone)]
pub struct AnthropicClient {
    client: reqwest::Client,
    api_key: SecretString,
    api_base: String,
    max_tokens: u32,
}

#[derive(Serialize)]
struct ApiRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    system: &'static str,
    stream: bool,
    messages: Vec<ApiMessage>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<ApiTool<'a>>,
}

#[derive(Debug, Serialize, PartialEq)]
struct ApiMessage {
    role: Role,
    content: String,
}

#[derive(Serialize)]
struct ApiTool<'a> {
    name: &'a str,
    description: &'a str,
    input_schema: &'a Value,
}

#[derive(Deserialize)]
struct StreamLine {
    #[serde(rename = "type")]
    event_type: String,
    delta: Option<ContentDelta>,
    error: Option<ApiError>,
}

#[derive(Deserialize)]
struct ContentDelta {
    text: Option<String>,
}

#[derive(Deserialize)]
struct ApiError {
    message: String,
}

#[derive(Deserialize)]
struct ApiResponse {
    content: Vec<ResponseBlock>,
}

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ResponseBlock {
    ToolUse { name: String, input: Value },
    #[serde(other)]
    Other,
}

impl AnthropicClient {
    #[must_use]
    pub fn new(api_key: SecretString, settings: &ModelSettings) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key,
            api_base: settings.api_base.trim_end_matches('/').to_string(),
            max_tokens: settings.max_tokens,
        }
    }

    async fn post(&self, request: &ApiRequest<'_>) -> PilotResult<reqwest::Response> {
        let response = self
            .client
            .post(format!("{}/v1/messages", self.api_base))
            .header("x-api-key", self.api_key.expose_secret())
            .header("anthropic-version", API_VERSION)
            .header("content-type", "application/json")
            .json(request)
            .send()
            .await
            .map_err(|e| PilotError::generation(format!("request failed: {e}")))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(PilotError::generation(format!("{status}: {body}")));
        }
        Ok(response)
    }
}

/// Builds an alternating user/assistant transcript ending with `user_turn`.
fn api_messages(context: &[ContextMessage], user_turn: String) -> Vec<ApiMessage> {
    let mut messages: Vec<ApiMessage> = Vec::with_capacity(context.len() + 1);
    let turns = context
        .iter()
        .map(|m| (m.role, m.content.clone()))
        .chain(std::iter::once((Role::User, user_turn)));

    for (role, content) in turns {
        if content.trim().is_empty() {
            continue;
        }
        match messages.last_mut() {
            Some(last) if last.role == role => {
                last.content.push_str("\n\n");
                last.content.push_str(&content);
            }
            // The API requires the first turn to be the user's
            None if role == Role::Assistant => {}
            _ => messages.push(ApiMessage { role, content }),
        }
    }
    messages
}

#[async_trait]
impl TextGenerator for AnthropicClient {
    async fn stream_reply(
        &self,
        request: &GenerationRequest,
        chunks: mpsc::Sender<String>,
    ) -> PilotResult<()> {
        let body = ApiRequest {
            model: &request.model,
            max_tokens: self.max_tokens,
            system: RESPONSE_PROMPT,
            stream: true,
            messages: api_messages(&request.context, request.user_turn()),
            tools: Vec::new(),
        };

        let response = self.post(&body).await?;
        let mut stream = response.bytes_stream();
        // Bytes, not text: a character may straddle two network chunks
        let mut buffer: Vec<u8> = Vec::new();

        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| PilotError::generation(format!("stream interrupted: {e}")))?;
            buffer.extend_from_slice(&chunk);

            while let Some(pos) = buffer.iter().position(|&b| b == b'\n') {
                let raw: Vec<u8> = buffer.drain(..=pos).collect();
                let Ok(line) = std::str::from_utf8(&raw) else {
                    warn!("Skipping stream line that is not UTF-8");
                    continue;
                };
                let Some(json) = line.trim().strip_prefix("data: ") else {
                    continue;
                };
                if json == "[DONE]" {
                    continue;
                }
                let Ok(parsed) = serde_json::from_str::<StreamLine>(json) else {
                    debug!("Skipping unparseable stream line");
                    continue;
                };

                match parsed.event_type.as_str() {
                    "content_block_delta" => {
                        if let Some(text) = parsed.delta.and_then(|d| d.text) {
                            if chunks.send(text).await.is_err() {
                                debug!("Text receiver dropped, ending generation");
                                return Ok(());
                            }
                        }
                    }
                    "message_stop" => return Ok(()),
                    "error" => {
                        let message = parsed
                            .error
                            .map_or_else(|| "unknown stream error".to_string(), |e| e.message);
                        return Err(PilotError::generation(message));
                    }
                    _ => {}
                }
            }
        }

        Ok(())
    }
}

#[async_trait]
impl ToolSelector for AnthropicClient {
    async fn select(&self, request: &SelectionRequest) -> PilotResult<Vec<PlannedTool>> {
        if request.tools.is_empty() || request.max_tools == 0 {
            return Ok(Vec::new());
        }

        let body = ApiRequest {
            model: &request.model,
            max_tokens: self.max_tokens,
            system: SELECTION_PROMPT,
            stream: false,
            messages: api_messages(&request.context, request.user_text.clone()),
            tools: request
                .tools
                .iter()
                .map(|tool| ApiTool {
                    name: &tool.name,
                    description: &tool.description,
                    input_schema: &tool.input_schema,
                })
                .collect(),
        };

        let response: ApiResponse = self
            .post(&body)
            .await?
            .json()
            .await
            .map_err(|e| PilotError::generation(format!("invalid planning response: {e}")))?;

        let planned: Vec<_> = response
            .content
            .into_iter()
            .filter_map(|block| match block {
                ResponseBlock::ToolUse { name, input } => Some((name, input)),
                ResponseBlock::Other => None,
            })
            .filter(|(name, _)| {
                let known = request.tools.iter().any(|tool| &tool.name == name);
                if !known {
                    warn!(tool = %name, "Model chose a tool outside the catalog");
                }
                known
            })
            .take(request.max_tools)
            .map(|(name, input)| PlannedTool::new(name, input))
            .collect();

        debug!(count = planned.len(), "Tools selected");
        Ok(planned)
    }
}

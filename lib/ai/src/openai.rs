//! OpenAI-compatible chat completions provider.
//!
//! Works with any endpoint that speaks the `/chat/completions` protocol.
//! Requests are non-streaming; the finished turn is replayed to the chunk
//! callback as one text chunk followed by one chunk per tool request.

use crate::error::GenerationError;
use crate::provider::{
    GenerationChunk, GenerationProvider, GenerationRequest, GenerationResponse, TokenUsage,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Value as JsonValue, json};
use tally_conversation::{HistoryMessage, MessageRole, Part, ToolDefinition, ToolRequest};
use tracing::{debug, instrument, warn};

fn default_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_model() -> String {
    "gpt-4o-mini".to_string()
}

/// Connection settings for an OpenAI-compatible endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Base URL, without the `/chat/completions` suffix.
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub temperature: Option<f32>,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            model: default_model(),
            api_key: None,
            temperature: None,
        }
    }
}

/// Provider backed by an OpenAI-compatible HTTP API.
pub struct OpenAiCompatibleProvider {
    config: ProviderConfig,
    http: reqwest::Client,
}

impl OpenAiCompatibleProvider {
    /// Creates a provider using the given HTTP client.
    #[must_use]
    pub fn new(config: ProviderConfig, http: reqwest::Client) -> Self {
        Self { config, http }
    }

    fn endpoint(&self) -> String {
        format!(
            "{}/chat/completions",
            self.config.base_url.trim_end_matches('/')
        )
    }

    fn request_body(&self, request: &GenerationRequest) -> JsonValue {
        let mut body = json!({
            "model": self.config.model,
            "messages": build_messages(&request.system, &request.history),
        });
        if !request.tools.is_empty() {
            body["tools"] = JsonValue::Array(build_tools(&request.tools));
        }
        if let Some(temperature) = self.config.temperature {
            body["temperature"] = json!(temperature);
        }
        body
    }
}

#[async_trait]
impl GenerationProvider for OpenAiCompatibleProvider {
    #[instrument(skip_all, fields(model = %self.config.model, history = request.history.len()))]
    async fn generate(
        &self,
        request: &GenerationRequest,
        on_chunk: &mut (dyn FnMut(GenerationChunk) + Send),
    ) -> Result<GenerationResponse, GenerationError> {
        let mut http_request = self.http.post(self.endpoint()).json(&self.request_body(request));
        if let Some(api_key) = &self.config.api_key {
            http_request = http_request.bearer_auth(api_key);
        }

        let resp = http_request
            .send()
            .await
            .map_err(|e| GenerationError::RequestFailed {
                reason: e.to_string(),
            })?;

        let status = resp.status();
        let body: JsonValue = resp
            .json()
            .await
            .map_err(|e| GenerationError::ResponseParseFailed {
                reason: e.to_string(),
            })?;

        if !status.is_success() {
            warn!(%status, "provider returned an error");
            return Err(GenerationError::RequestFailed {
                reason: format!("status {status}: {body}"),
            });
        }

        let response = parse_response(&body)?;
        debug!(
            input_tokens = response.usage.input_tokens,
            output_tokens = response.usage.output_tokens,
            "generation finished"
        );

        let text = response.text();
        if !text.is_empty() {
            on_chunk(GenerationChunk::text(text));
        }
        for request in response.tool_requests() {
            on_chunk(GenerationChunk::tool_request(request.clone()));
        }

        Ok(response)
    }
}

fn build_tools(tools: &[ToolDefinition]) -> Vec<JsonValue> {
    tools
        .iter()
        .map(|tool| {
            json!({
                "type": "function",
                "function": {
                    "name": tool.name,
                    "description": tool.description,
                    "parameters": tool.input_schema,
                }
            })
        })
        .collect()
}

fn build_messages(system: &str, history: &[HistoryMessage]) -> Vec<JsonValue> {
    let mut messages = vec![json!({ "role": "system", "content": system })];

    for entry in history {
        match entry.role {
            MessageRole::User => messages.push(user_message(&entry.parts)),
            MessageRole::Model => messages.push(assistant_message(&entry.parts)),
            MessageRole::Tool => {
                for part in &entry.parts {
                    if let Part::ToolResponse(response) = part {
                        messages.push(json!({
                            "role": "tool",
                            "tool_call_id": response.reference.clone().unwrap_or_default(),
                            "content": response.output.to_string(),
                        }));
                    }
                }
            }
        }
    }

    messages
}

fn user_message(parts: &[Part]) -> JsonValue {
    let content: Vec<JsonValue> = parts
        .iter()
        .filter_map(|part| match part {
            Part::Text { text } => Some(json!({ "type": "text", "text": text })),
            Part::Media { url, .. } if is_fetchable(url) => {
                Some(json!({ "type": "image_url", "image_url": { "url": url } }))
            }
            Part::Media { content_type, .. } => Some(json!({
                "type": "text",
                "text": format!("[attachment of type {content_type} is not available]"),
            })),
            Part::ToolRequest(_) | Part::ToolResponse(_) => None,
        })
        .collect();
    json!({ "role": "user", "content": content })
}

fn assistant_message(parts: &[Part]) -> JsonValue {
    let text: String = parts.iter().filter_map(Part::as_text).collect();
    let tool_calls: Vec<JsonValue> = parts
        .iter()
        .filter_map(|part| match part {
            Part::ToolRequest(request) => Some(json!({
                "id": request.reference.clone().unwrap_or_default(),
                "type": "function",
                "function": {
                    "name": request.name,
                    "arguments": request.input.to_string(),
                }
            })),
            _ => None,
        })
        .collect();

    let mut message = json!({ "role": "assistant" });
    message["content"] = if text.is_empty() {
        JsonValue::Null
    } else {
        JsonValue::String(text)
    };
    if !tool_calls.is_empty() {
        message["tool_calls"] = JsonValue::Array(tool_calls);
    }
    message
}

fn is_fetchable(url: &str) -> bool {
    url.starts_with("http://") || url.starts_with("https://") || url.starts_with("data:")
}

/// Parses a chat completions response body into a model turn.
///
/// # Errors
///
/// Returns `GenerationError::ResponseParseFailed` if the body has no choice
/// or a tool call carries arguments that are not JSON.
pub fn parse_response(body: &JsonValue) -> Result<GenerationResponse, GenerationError> {
    let message = body["choices"]
        .get(0)
        .map(|choice| &choice["message"])
        .ok_or_else(|| GenerationError::ResponseParseFailed {
            reason: "response has no choices".to_string(),
        })?;

    let mut parts = Vec::new();
    if let Some(content) = message["content"].as_str()
        && !content.is_empty()
    {
        parts.push(Part::text(content));
    }

    if let Some(tool_calls) = message["tool_calls"].as_array() {
        for call in tool_calls {
            let name = call["function"]["name"].as_str().ok_or_else(|| {
                GenerationError::ResponseParseFailed {
                    reason: "tool call without a function name".to_string(),
                }
            })?;
            let arguments = call["function"]["arguments"].as_str().unwrap_or("{}");
            let input = if arguments.trim().is_empty() {
                json!({})
            } else {
                serde_json::from_str(arguments).map_err(|e| {
                    GenerationError::ResponseParseFailed {
                        reason: format!("arguments for {name} are not JSON: {e}"),
                    }
                })?
            };
            parts.push(Part::ToolRequest(ToolRequest {
                name: name.to_string(),
                reference: call["id"].as_str().map(str::to_string),
                input,
            }));
        }
    }

    let usage = TokenUsage {
        input_tokens: body["usage"]["prompt_tokens"].as_u64().unwrap_or_default(),
        output_tokens: body["usage"]["completion_tokens"]
            .as_u64()
            .unwrap_or_default(),
    };

    Ok(GenerationResponse { parts, usage })
}

//! Generation provider abstraction.
//!
//! One `generate` call produces one model turn. Incremental output is
//! pushed through the `on_chunk` callback while the call is in flight; the
//! returned response carries the complete turn, including any tool
//! requests. Tool execution is the caller's job.

use crate::error::GenerationError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::ops::Add;
use tally_conversation::{HistoryMessage, Part, ToolDefinition, ToolRequest};

/// A request for the next model turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationRequest {
    /// System instructions.
    pub system: String,
    /// The conversation so far, oldest first.
    pub history: Vec<HistoryMessage>,
    /// Tools the model may request.
    pub tools: Vec<ToolDefinition>,
    /// Ceiling on tool round trips for the whole inbound message.
    pub max_turns: u32,
}

impl GenerationRequest {
    /// Creates a request with the given history.
    #[must_use]
    pub fn new(system: impl Into<String>, history: Vec<HistoryMessage>) -> Self {
        Self {
            system: system.into(),
            history,
            tools: Vec::new(),
            max_turns: 1,
        }
    }

    /// Sets the available tools.
    #[must_use]
    pub fn with_tools(mut self, tools: Vec<ToolDefinition>) -> Self {
        self.tools = tools;
        self
    }

    /// Sets the turn ceiling.
    #[must_use]
    pub fn with_max_turns(mut self, max_turns: u32) -> Self {
        self.max_turns = max_turns;
        self
    }
}

/// An incremental piece of a model turn.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GenerationChunk {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_requests: Vec<ToolRequest>,
}

impl GenerationChunk {
    /// Creates a text chunk.
    #[must_use]
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            tool_requests: Vec::new(),
        }
    }

    /// Creates a chunk announcing a tool request.
    #[must_use]
    pub fn tool_request(request: ToolRequest) -> Self {
        Self {
            text: None,
            tool_requests: vec![request],
        }
    }

    /// Returns true if the chunk carries nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.text.is_none() && self.tool_requests.is_empty()
    }
}

/// Token usage for one or more provider calls.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    /// Tokens in the input/prompt.
    pub input_tokens: u64,
    /// Tokens in the output/completion.
    pub output_tokens: u64,
}

impl TokenUsage {
    /// Returns total tokens used.
    #[must_use]
    pub fn total(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }
}

impl Add for TokenUsage {
    type Output = Self;

    fn add(self, rhs: Self) -> Self {
        Self {
            input_tokens: self.input_tokens + rhs.input_tokens,
            output_tokens: self.output_tokens + rhs.output_tokens,
        }
    }
}

/// A complete model turn.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GenerationResponse {
    /// Text and tool request parts, in order.
    pub parts: Vec<Part>,
    pub usage: TokenUsage,
}

impl GenerationResponse {
    /// Returns the tool requests of the turn.
    pub fn tool_requests(&self) -> impl Iterator<Item = &ToolRequest> {
        self.parts.iter().filter_map(|part| match part {
            Part::ToolRequest(request) => Some(request),
            _ => None,
        })
    }

    /// Concatenates the text parts.
    #[must_use]
    pub fn text(&self) -> String {
        self.parts.iter().filter_map(Part::as_text).collect()
    }
}

/// Trait for model backends.
#[async_trait]
pub trait GenerationProvider: Send + Sync {
    /// Generates the next model turn.
    ///
    /// # Errors
    ///
    /// Returns `GenerationError::TurnLimitReached` if the provider enforces
    /// `request.max_turns` itself and the limit was hit.
    async fn generate(
        &self,
        request: &GenerationRequest,
        on_chunk: &mut (dyn FnMut(GenerationChunk) + Send),
    ) -> Result<GenerationResponse, GenerationError>;
}

//! Message types for conversations.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tally_core::{ConversationSessionId, MessageId, UserId};

/// The role of a message sender.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    /// Human message.
    User,
    /// Generated by the model.
    Model,
    /// Result of a tool invocation.
    Tool,
}

impl MessageRole {
    /// Returns the stored name of the role.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Model => "model",
            Self::Tool => "tool",
        }
    }

    /// Parses a stored role name.
    #[must_use]
    pub fn from_str_value(s: &str) -> Option<Self> {
        match s {
            "user" => Some(Self::User),
            "model" => Some(Self::Model),
            "tool" => Some(Self::Tool),
            _ => None,
        }
    }
}

/// A request from the model to run a tool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolRequest {
    /// Name of the requested tool.
    pub name: String,
    /// Provider-assigned call reference, echoed back in the response.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reference: Option<String>,
    /// Tool input as produced by the model.
    pub input: JsonValue,
}

/// The result of running a tool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResponse {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reference: Option<String>,
    pub output: JsonValue,
}

/// One piece of message content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Part {
    /// Plain text.
    Text { text: String },
    /// A reference to an image or other attachment.
    Media { content_type: String, url: String },
    /// A tool call requested by the model.
    ToolRequest(ToolRequest),
    /// The output of a tool call.
    ToolResponse(ToolResponse),
}

impl Part {
    /// Creates a text part.
    #[must_use]
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    /// Creates a media part.
    #[must_use]
    pub fn media(content_type: impl Into<String>, url: impl Into<String>) -> Self {
        Self::Media {
            content_type: content_type.into(),
            url: url.into(),
        }
    }

    /// Returns the text, if this is a text part.
    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text { text } => Some(text),
            _ => None,
        }
    }

    /// Returns true if this is a media part.
    #[must_use]
    pub fn is_media(&self) -> bool {
        matches!(self, Self::Media { .. })
    }
}

/// A persisted message in a conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Unique message identifier.
    pub id: MessageId,
    /// The session the message belongs to.
    pub session_id: ConversationSessionId,
    pub role: MessageRole,
    /// Ordered content parts.
    pub parts: Vec<Part>,
    /// The user on whose behalf the message was written.
    pub author_id: UserId,
    /// The message this one answers, for tool responses.
    pub parent_id: Option<MessageId>,
    /// When the message was created.
    pub created_at: DateTime<Utc>,
}

impl Message {
    /// Concatenates the text parts.
    #[must_use]
    pub fn text(&self) -> String {
        self.parts.iter().filter_map(Part::as_text).collect()
    }

    /// Returns the tool requests carried by the message.
    pub fn tool_requests(&self) -> impl Iterator<Item = &ToolRequest> {
        self.parts.iter().filter_map(|part| match part {
            Part::ToolRequest(request) => Some(request),
            _ => None,
        })
    }

    /// Returns the number of media parts.
    #[must_use]
    pub fn attachment_count(&self) -> usize {
        self.parts.iter().filter(|p| p.is_media()).count()
    }
}

/// A message that has not been persisted yet.
#[derive(Debug, Clone, PartialEq)]
pub struct NewMessage {
    pub role: MessageRole,
    pub parts: Vec<Part>,
}

impl NewMessage {
    /// Creates a new message.
    #[must_use]
    pub fn new(role: MessageRole, parts: Vec<Part>) -> Self {
        Self { role, parts }
    }

    /// Creates a user message.
    #[must_use]
    pub fn user(parts: Vec<Part>) -> Self {
        Self::new(MessageRole::User, parts)
    }

    /// Creates a model message.
    #[must_use]
    pub fn model(parts: Vec<Part>) -> Self {
        Self::new(MessageRole::Model, parts)
    }

    /// Creates a tool message.
    #[must_use]
    pub fn tool(responses: Vec<ToolResponse>) -> Self {
        Self::new(
            MessageRole::Tool,
            responses.into_iter().map(Part::ToolResponse).collect(),
        )
    }
}

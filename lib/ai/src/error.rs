//! Error types for the AI crate.
//!
//! - `GenerationError`: Failures reported by a generation provider
//! - `AgentError`: Terminal failures of one chat turn

use std::fmt;

/// Errors from generation provider calls.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GenerationError {
    /// The provider could not be reached or rejected the request.
    RequestFailed { reason: String },
    /// The provider's response could not be interpreted.
    ResponseParseFailed { reason: String },
    /// The provider stopped because the turn limit was reached.
    TurnLimitReached { limit: u32 },
}

impl fmt::Display for GenerationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RequestFailed { reason } => write!(f, "generation request failed: {reason}"),
            Self::ResponseParseFailed { reason } => {
                write!(f, "failed to parse generation response: {reason}")
            }
            Self::TurnLimitReached { limit } => {
                write!(f, "generation stopped after {limit} turns")
            }
        }
    }
}

impl std::error::Error for GenerationError {}

/// Terminal failures of a chat turn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentError {
    /// The inbound message has neither text nor attachments.
    Validation { reason: String },
    /// Reading or writing the conversation failed.
    Session { details: String },
    /// The generation provider failed.
    Generation { reason: String },
    /// The model kept requesting tools past the configured ceiling.
    TurnLimitExceeded { limit: u32 },
    /// The model requested a tool that is not registered.
    ToolNotFound { name: String },
    /// The caller cancelled the turn.
    Cancelled,
    /// The turn panicked.
    Panicked { message: String },
}

impl AgentError {
    /// Returns the message shown to the end user.
    #[must_use]
    pub fn user_message(&self) -> &'static str {
        match self {
            Self::Validation { .. } => "Please send a message or an attachment.",
            Self::TurnLimitExceeded { .. } => {
                "I couldn't finish that request. Could you try breaking it into smaller steps?"
            }
            Self::Cancelled => "The request was cancelled.",
            Self::Session { .. }
            | Self::Generation { .. }
            | Self::ToolNotFound { .. }
            | Self::Panicked { .. } => "Something went wrong on my side. Please try again.",
        }
    }
}

impl fmt::Display for AgentError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Validation { reason } => write!(f, "invalid inbound message: {reason}"),
            Self::Session { details } => write!(f, "session store failed: {details}"),
            Self::Generation { reason } => write!(f, "generation failed: {reason}"),
            Self::TurnLimitExceeded { limit } => {
                write!(f, "turn limit of {limit} exceeded")
            }
            Self::ToolNotFound { name } => write!(f, "model requested unknown tool: {name}"),
            Self::Cancelled => write!(f, "turn cancelled"),
            Self::Panicked { message } => write!(f, "turn panicked: {message}"),
        }
    }
}

impl std::error::Error for AgentError {}

impl From<GenerationError> for AgentError {
    fn from(e: GenerationError) -> Self {
        match e {
            GenerationError::TurnLimitReached { limit } => Self::TurnLimitExceeded { limit },
            other => Self::Generation {
                reason: other.to_string(),
            },
        }
    }
}

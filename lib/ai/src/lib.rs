//! Generation and orchestration for tally.
//!
//! This crate provides:
//!
//! - **Generation Provider**: the seam to the language model, one call per
//!   model turn with a streaming callback
//! - **OpenAI-compatible Provider**: an HTTP implementation of that seam
//! - **Chat Agent**: the loop that streams model output, runs requested
//!   tools and persists every turn

pub mod agent;
pub mod error;
pub mod openai;
pub mod prompt;
pub mod provider;
pub mod usage;

pub use agent::{
    AgentConfig, AgentState, AgentUpdate, Attachment, ChatAgent, DeliveryMode, InboundMessage,
};
pub use error::{AgentError, GenerationError};
pub use openai::{OpenAiCompatibleProvider, ProviderConfig};
pub use prompt::system_prompt;
pub use provider::{
    GenerationChunk, GenerationProvider, GenerationRequest, GenerationResponse, TokenUsage,
};
pub use usage::UsageCounters;

//! Conversation service for tally.
//!
//! This crate provides:
//!
//! - **Session Store**: one active session per channel, ordered message
//!   persistence and provider-facing history
//! - **Media Archiving**: background copy of remote attachments to blob storage
//! - **Tool Registry**: typed tools dispatched by name

pub mod error;
pub mod history;
pub mod media;
pub mod message;
pub mod session;
pub mod store;
pub mod tool;

pub use error::{MediaError, SessionStoreError, ToolError};
pub use history::{HistoryMessage, to_history, user_preamble};
pub use media::{
    BlobStore, FetchedMedia, FsBlobStore, HttpMediaFetcher, MediaArchiver, MediaConfig,
    MediaFetcher,
};
pub use message::{Message, MessageRole, NewMessage, Part, ToolRequest, ToolResponse};
pub use session::{
    AuthorProfile, HouseholdProfile, MemorySessionRepository, Session, SessionRepository,
    SessionState,
};
pub use store::SessionStore;
pub use tool::{DynTool, Tool, ToolDefinition, ToolRegistry};

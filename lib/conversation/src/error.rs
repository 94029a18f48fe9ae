//! Error types for the conversation crate.
//!
//! Errors are designed for layered context using rootcause:
//! - `SessionStoreError`: Errors from session and message persistence
//! - `MediaError`: Errors from archiving media attachments
//! - `ToolError`: Errors from tool lookup and execution

use std::fmt;

/// Errors from session store operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionStoreError {
    /// Required context (an author profile, a session) does not exist.
    NotFound { what: String },
    /// The message or session could not be persisted or loaded.
    Persistence { details: String },
    /// The caller supplied an unusable message.
    InvalidInput { reason: String },
}

impl SessionStoreError {
    /// Builds a persistence error from any displayable cause.
    pub fn persistence(cause: impl fmt::Display) -> Self {
        Self::Persistence {
            details: cause.to_string(),
        }
    }
}

impl fmt::Display for SessionStoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound { what } => write!(f, "not found: {what}"),
            Self::Persistence { details } => write!(f, "session persistence failed: {details}"),
            Self::InvalidInput { reason } => write!(f, "invalid message: {reason}"),
        }
    }
}

impl std::error::Error for SessionStoreError {}

/// Errors from archiving media attachments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MediaError {
    /// Downloading the remote attachment failed.
    FetchFailed { url: String, reason: String },
    /// Writing to blob storage failed.
    UploadFailed { object: String, reason: String },
    /// The reference could not be interpreted.
    Unsupported { url: String },
}

impl fmt::Display for MediaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::FetchFailed { url, reason } => write!(f, "failed to fetch {url}: {reason}"),
            Self::UploadFailed { object, reason } => {
                write!(f, "failed to upload {object}: {reason}")
            }
            Self::Unsupported { url } => write!(f, "unsupported media reference: {url}"),
        }
    }
}

impl std::error::Error for MediaError {}

/// Errors from tool execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolError {
    /// No tool with this name is registered.
    NotFound { name: String },
    /// The input did not match the tool's schema.
    InvalidInput { name: String, reason: String },
    /// The tool ran and failed.
    ExecutionFailed { name: String, reason: String },
}

impl ToolError {
    /// Returns true if this error means the tool registry is misconfigured.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

impl fmt::Display for ToolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound { name } => write!(f, "tool not found: {name}"),
            Self::InvalidInput { name, reason } => {
                write!(f, "invalid input for tool '{name}': {reason}")
            }
            Self::ExecutionFailed { name, reason } => {
                write!(f, "tool '{name}' execution failed: {reason}")
            }
        }
    }
}

impl std::error::Error for ToolError {}

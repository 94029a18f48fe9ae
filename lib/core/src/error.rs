//! Error handling foundation for tally.
//!
//! This module provides the `Result` type alias using rootcause and the
//! storage error shared by every persistence layer. Each crate defines its
//! own domain-specific error types in its own error module and converts
//! storage reports into them at the boundary.

use rootcause::Report;
use std::fmt;

/// A Result type alias using rootcause's Report for error handling.
pub type Result<T, C = ()> = std::result::Result<T, Report<C>>;

/// Errors from a backing store (database, in-memory map, blob storage).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    /// The store could not be reached or a statement failed.
    Backend { details: String },
    /// A stored row could not be decoded into a domain value.
    Decode { details: String },
}

impl StorageError {
    /// Builds a backend error from any displayable cause.
    pub fn backend(cause: impl fmt::Display) -> Self {
        Self::Backend {
            details: cause.to_string(),
        }
    }

    /// Builds a decode error from any displayable cause.
    pub fn decode(cause: impl fmt::Display) -> Self {
        Self::Decode {
            details: cause.to_string(),
        }
    }
}

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Backend { details } => write!(f, "storage backend failed: {details}"),
            Self::Decode { details } => write!(f, "failed to decode stored row: {details}"),
        }
    }
}

impl std::error::Error for StorageError {}

//! Core domain types and utilities for tally.
//!
//! This crate provides the identifiers, error handling, and shared storage
//! error used throughout the household finance assistant.

pub mod error;
pub mod id;

pub use error::{Result, StorageError};
pub use id::{
    ChannelId, ConversationSessionId, HouseholdId, MessageId, ParseIdError, TransactionId, UserId,
};

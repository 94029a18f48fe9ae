//! Error types for the ledger crate.
//!
//! Ledger failures are per item: a batch operation returns one
//! `LedgerError` for each input that could not be applied and keeps going.
//! Storage failures reach the ledger as rootcause reports of
//! `tally_core::StorageError` and are flattened into `LedgerError::Storage`
//! with the rendered report preserved.

use std::fmt;
use tally_core::TransactionId;

/// Errors from computing a transaction fingerprint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HashError {
    /// Neither an author nor a household was supplied.
    MissingAttribution,
}

impl fmt::Display for HashError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingAttribution => {
                write!(f, "either an author id or a household id must be set")
            }
        }
    }
}

impl std::error::Error for HashError {}

/// Item-level errors from ledger operations.
#[derive(Debug, Clone, PartialEq)]
pub enum LedgerError {
    /// The input is missing required fields or carries invalid values.
    Validation { reasons: Vec<String> },
    /// The fingerprint could not be computed.
    Hash(HashError),
    /// Another transaction already has the same fingerprint.
    Duplicate { existing_id: TransactionId },
    /// The transaction to update does not exist.
    NotFound { id: TransactionId },
    /// The backing store failed unexpectedly.
    Storage { details: String },
}

impl LedgerError {
    /// Creates a validation error with a single reason.
    pub fn invalid(reason: impl Into<String>) -> Self {
        Self::Validation {
            reasons: vec![reason.into()],
        }
    }

    /// Flattens a storage report into a ledger error.
    pub fn storage(report: impl fmt::Display) -> Self {
        Self::Storage {
            details: report.to_string(),
        }
    }

    /// Returns true if retrying the whole turn could succeed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Hash(_) | Self::Storage { .. })
    }
}

impl fmt::Display for LedgerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Validation { reasons } => {
                write!(f, "transaction validation failed: {}", reasons.join("; "))
            }
            Self::Hash(e) => write!(f, "failed to fingerprint transaction: {e}"),
            Self::Duplicate { existing_id } => {
                write!(f, "transaction already exists as {existing_id}")
            }
            Self::NotFound { id } => write!(f, "transaction not found: {id}"),
            Self::Storage { details } => write!(f, "ledger storage failed: {details}"),
        }
    }
}

impl std::error::Error for LedgerError {}

impl From<HashError> for LedgerError {
    fn from(e: HashError) -> Self {
        Self::Hash(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_error_joins_reasons() {
        let err = LedgerError::Validation {
            reasons: vec![
                "amount is required".to_string(),
                "transaction date is required".to_string(),
            ],
        };
        assert_eq!(
            err.to_string(),
            "transaction validation failed: amount is required; transaction date is required"
        );
    }

    #[test]
    fn duplicate_error_names_existing_row() {
        let existing_id = TransactionId::new();
        let err = LedgerError::Duplicate { existing_id };
        assert!(err.to_string().contains(&existing_id.to_string()));
        assert!(!err.is_retryable());
    }

    #[test]
    fn storage_errors_are_retryable() {
        assert!(LedgerError::storage("connection reset").is_retryable());
        assert!(LedgerError::from(HashError::MissingAttribution).is_retryable());
    }
}

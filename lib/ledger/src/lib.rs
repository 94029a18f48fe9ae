//! Transaction ledger for tally.
//!
//! This crate provides:
//!
//! - **Fingerprint**: content-addressed deduplication key for transactions
//! - **Patch**: tri-state partial update fields (unset, null, value)
//! - **Repository**: storage seam with an in-memory implementation
//! - **Ledger**: batch create, lookup, partial update and filtered queries

pub mod error;
pub mod filter;
pub mod fingerprint;
pub mod ledger;
pub mod patch;
pub mod repository;
pub mod transaction;

pub use error::{HashError, LedgerError};
pub use filter::{TransactionFilter, TransactionOrder};
pub use fingerprint::{Fingerprint, fingerprint};
pub use ledger::{BatchResult, ItemFailure, Ledger, RejectedItem, UpdateRequest};
pub use patch::Patch;
pub use repository::{InsertOutcome, MemoryTransactionRepository, ReplaceOutcome, TransactionRepository};
pub use transaction::{Transaction, TransactionDraft, TransactionUpdate};

//! Finance tools for the tally chat agent.
//!
//! Each tool wraps one ledger operation, decodes the model's arguments into
//! ledger types and reports the structured batch result back together with
//! a short human-readable summary.

pub mod datetime;
pub mod report;
pub mod transactions;

use tally_conversation::ToolRegistry;
use tally_ledger::Ledger;

pub use datetime::FlexibleDateTime;
pub use report::{BatchReport, FailureReport, TransactionView};
pub use transactions::{
    FilterTransactions, GetTransactions, SaveTransactions, UpdateTransactionsById,
};

/// Builds the registry of every finance tool over a ledger.
#[must_use]
pub fn finance_registry(ledger: Ledger) -> ToolRegistry {
    ToolRegistry::new()
        .with_tool(SaveTransactions::new(ledger.clone()))
        .with_tool(GetTransactions::new(ledger.clone()))
        .with_tool(UpdateTransactionsById::new(ledger.clone()))
        .with_tool(FilterTransactions::new(ledger))
}

//! Tool output shapes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tally_core::{HouseholdId, TransactionId, UserId};
use tally_ledger::{BatchResult, LedgerError, Transaction};

/// A transaction as reported to the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionView {
    pub id: TransactionId,
    pub amount: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub author_id: Option<UserId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub household_id: Option<HouseholdId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    pub transaction_date: DateTime<Utc>,
}

impl From<&Transaction> for TransactionView {
    fn from(tx: &Transaction) -> Self {
        Self {
            id: tx.id,
            amount: tx.amount,
            author_id: tx.author_id,
            household_id: tx.household_id,
            description: tx.description.clone(),
            notes: tx.notes.clone(),
            transaction_date: tx.transaction_date,
        }
    }
}

/// Category of a failed batch item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Validation,
    Duplicate,
    NotFound,
    Internal,
}

/// One failed item of a batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureReport {
    /// Zero-based position in the request.
    pub index: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<TransactionId>,
    pub kind: FailureKind,
    pub message: String,
    /// The transaction that already holds the same data, for duplicates.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub existing_id: Option<TransactionId>,
    /// Whether the item may succeed if the whole request is retried.
    #[serde(default)]
    pub retryable: bool,
}

/// Result of a batch tool call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchReport {
    pub summary: String,
    pub succeeded: Vec<TransactionView>,
    pub failed: Vec<FailureReport>,
}

impl BatchReport {
    /// Builds a report from a ledger batch. `verb` is the past tense used in
    /// the summary, e.g. "saved".
    #[must_use]
    pub fn from_batch(batch: &BatchResult, verb: &str) -> Self {
        let succeeded: Vec<TransactionView> = batch
            .results()
            .filter_map(|r| r.as_ref().ok())
            .map(TransactionView::from)
            .collect();

        let failed: Vec<FailureReport> = batch
            .failed()
            .into_iter()
            .map(|failure| {
                let (kind, existing_id) = match failure.error {
                    LedgerError::Validation { .. } => (FailureKind::Validation, None),
                    LedgerError::Duplicate { existing_id } => {
                        (FailureKind::Duplicate, Some(*existing_id))
                    }
                    LedgerError::NotFound { .. } => (FailureKind::NotFound, None),
                    LedgerError::Hash(_) | LedgerError::Storage { .. } => {
                        (FailureKind::Internal, None)
                    }
                };
                FailureReport {
                    index: failure.index,
                    id: failure.id,
                    kind,
                    message: failure.error.to_string(),
                    existing_id,
                    retryable: failure.error.is_retryable(),
                }
            })
            .collect();

        let mut summary = format!(
            "{} {} of {} transaction(s).",
            capitalize(verb),
            succeeded.len(),
            batch.len()
        );
        for failure in &failed {
            summary.push_str(&format!(" Item {}: {}.", failure.index + 1, failure.message));
        }

        Self {
            summary,
            succeeded,
            failed,
        }
    }
}

fn capitalize(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

//! Read-only transaction queries.

use crate::transaction::Transaction;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use tally_core::{HouseholdId, UserId};

/// Upper bound on the number of rows a single query may return.
pub const MAX_LIMIT: usize = 200;

const DEFAULT_LIMIT: usize = 25;

/// Result ordering for filtered queries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionOrder {
    /// Most recent transaction date first.
    #[default]
    NewestFirst,
    /// Oldest transaction date first.
    OldestFirst,
    /// Largest amount first.
    LargestAmount,
    /// Smallest amount first.
    SmallestAmount,
}

impl TransactionOrder {
    /// Compares two transactions according to this ordering.
    #[must_use]
    pub fn compare(&self, a: &Transaction, b: &Transaction) -> Ordering {
        let primary = match self {
            Self::NewestFirst => b.transaction_date.cmp(&a.transaction_date),
            Self::OldestFirst => a.transaction_date.cmp(&b.transaction_date),
            Self::LargestAmount => b.amount.total_cmp(&a.amount),
            Self::SmallestAmount => a.amount.total_cmp(&b.amount),
        };
        primary.then_with(|| a.id.cmp(&b.id))
    }
}

/// Criteria for a filtered transaction query. Every criterion is optional.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionFilter {
    /// Inclusive lower bound on the transaction date.
    #[serde(default)]
    pub from: Option<DateTime<Utc>>,
    /// Exclusive upper bound on the transaction date.
    #[serde(default)]
    pub to: Option<DateTime<Utc>>,
    #[serde(default)]
    pub author_id: Option<UserId>,
    #[serde(default)]
    pub household_id: Option<HouseholdId>,
    /// Case-insensitive substring matched against description and notes.
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub order: TransactionOrder,
    #[serde(default = "default_limit")]
    pub limit: usize,
}

fn default_limit() -> usize {
    DEFAULT_LIMIT
}

impl Default for TransactionFilter {
    fn default() -> Self {
        Self {
            from: None,
            to: None,
            author_id: None,
            household_id: None,
            text: None,
            order: TransactionOrder::default(),
            limit: DEFAULT_LIMIT,
        }
    }
}

impl TransactionFilter {
    /// Returns the limit clamped to `1..=MAX_LIMIT`.
    #[must_use]
    pub fn effective_limit(&self) -> usize {
        self.limit.clamp(1, MAX_LIMIT)
    }

    /// Returns the lower-cased search text, ignoring blank input.
    #[must_use]
    pub fn search_text(&self) -> Option<String> {
        self.text
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(str::to_lowercase)
    }

    /// Returns true if the transaction satisfies every criterion.
    #[must_use]
    pub fn matches(&self, tx: &Transaction) -> bool {
        if self.from.is_some_and(|from| tx.transaction_date < from) {
            return false;
        }
        if self.to.is_some_and(|to| tx.transaction_date >= to) {
            return false;
        }
        if self.author_id.is_some() && tx.author_id != self.author_id {
            return false;
        }
        if self.household_id.is_some() && tx.household_id != self.household_id {
            return false;
        }
        match self.search_text() {
            Some(needle) => [&tx.description, &tx.notes]
                .into_iter()
                .flatten()
                .any(|field| field.to_lowercase().contains(&needle)),
            None => true,
        }
    }
}

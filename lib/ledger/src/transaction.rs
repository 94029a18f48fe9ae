//! Transaction records, drafts and partial updates.

use crate::error::LedgerError;
use crate::fingerprint::{Fingerprint, fingerprint};
use crate::patch::Patch;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tally_core::{HouseholdId, TransactionId, UserId};

/// A stored ledger transaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    /// Unique transaction identifier.
    pub id: TransactionId,
    /// Signed amount; never zero.
    pub amount: f64,
    /// The user the transaction is attributed to.
    pub author_id: Option<UserId>,
    /// The household the transaction is attributed to.
    pub household_id: Option<HouseholdId>,
    /// Short description, e.g. the merchant.
    pub description: Option<String>,
    /// Free-form notes supplied by the user.
    pub notes: Option<String>,
    /// When the transaction happened.
    pub transaction_date: DateTime<Utc>,
    /// Deduplication key over the identifying fields.
    pub fingerprint: Fingerprint,
    /// When the row was created.
    pub created_at: DateTime<Utc>,
    /// When the row was last updated.
    pub updated_at: DateTime<Utc>,
}

impl Transaction {
    /// Recomputes the fingerprint from the current field values.
    ///
    /// # Errors
    ///
    /// Returns `LedgerError::Hash` when the transaction has neither an author
    /// nor a household.
    pub fn compute_fingerprint(&self) -> Result<Fingerprint, LedgerError> {
        Ok(fingerprint(
            self.description.as_deref().unwrap_or_default(),
            self.transaction_date,
            self.author_id,
            self.household_id,
            self.amount,
        )?)
    }
}

/// A transaction as extracted from a conversation, not yet validated.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TransactionDraft {
    pub amount: Option<f64>,
    pub author_id: Option<UserId>,
    pub household_id: Option<HouseholdId>,
    pub description: Option<String>,
    pub notes: Option<String>,
    pub transaction_date: Option<DateTime<Utc>>,
}

impl TransactionDraft {
    /// Validates the draft and turns it into a new transaction.
    ///
    /// All validation problems are collected into one error.
    ///
    /// # Errors
    ///
    /// Returns `LedgerError::Validation` when required fields are missing or
    /// invalid, and `LedgerError::Hash` when the fingerprint cannot be built.
    pub fn into_transaction(self) -> Result<Transaction, LedgerError> {
        let mut reasons = Vec::new();

        if self.author_id.is_none() && self.household_id.is_none() {
            reasons.push("author id or household id is required".to_string());
        }
        if let Err(reason) = check_amount(self.amount) {
            reasons.push(reason);
        }
        if self.transaction_date.is_none() {
            reasons.push("transaction date is required".to_string());
        }

        let (Some(amount), Some(transaction_date), true) =
            (self.amount, self.transaction_date, reasons.is_empty())
        else {
            return Err(LedgerError::Validation { reasons });
        };

        let description = normalize(self.description);
        let fingerprint = fingerprint(
            description.as_deref().unwrap_or_default(),
            transaction_date,
            self.author_id,
            self.household_id,
            amount,
        )?;

        let now = Utc::now();
        Ok(Transaction {
            id: TransactionId::new(),
            amount,
            author_id: self.author_id,
            household_id: self.household_id,
            description,
            notes: normalize(self.notes),
            transaction_date,
            fingerprint,
            created_at: now,
            updated_at: now,
        })
    }
}

/// A partial update to a stored transaction.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TransactionUpdate {
    #[serde(default, skip_serializing_if = "Patch::is_unset")]
    pub amount: Patch<f64>,
    #[serde(default, skip_serializing_if = "Patch::is_unset")]
    pub author_id: Patch<UserId>,
    #[serde(default, skip_serializing_if = "Patch::is_unset")]
    pub household_id: Patch<HouseholdId>,
    #[serde(default, skip_serializing_if = "Patch::is_unset")]
    pub description: Patch<String>,
    #[serde(default, skip_serializing_if = "Patch::is_unset")]
    pub notes: Patch<String>,
    #[serde(default, skip_serializing_if = "Patch::is_unset")]
    pub transaction_date: Patch<DateTime<Utc>>,
}

impl TransactionUpdate {
    /// Returns true if no field is set.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.amount.is_unset()
            && self.author_id.is_unset()
            && self.household_id.is_unset()
            && self.description.is_unset()
            && self.notes.is_unset()
            && self.transaction_date.is_unset()
    }

    /// Merges the update onto a stored transaction and refreshes its
    /// fingerprint. The stored value is left untouched.
    ///
    /// # Errors
    ///
    /// Returns `LedgerError::Validation` when the update clears or zeroes a
    /// required field, and `LedgerError::Hash` when the merged transaction
    /// is no longer attributable.
    pub fn merge_into(self, current: &Transaction) -> Result<Transaction, LedgerError> {
        let mut reasons = Vec::new();

        let amount = match self.amount {
            Patch::Unset => current.amount,
            Patch::SetNull => {
                reasons.push("amount cannot be cleared".to_string());
                current.amount
            }
            Patch::Set(amount) => {
                if let Err(reason) = check_amount(Some(amount)) {
                    reasons.push(reason);
                }
                amount
            }
        };

        let transaction_date = match self.transaction_date {
            Patch::Unset => current.transaction_date,
            Patch::SetNull => {
                reasons.push("transaction date cannot be cleared".to_string());
                current.transaction_date
            }
            Patch::Set(date) => date,
        };

        if !reasons.is_empty() {
            return Err(LedgerError::Validation { reasons });
        }

        let mut merged = Transaction {
            amount,
            author_id: self.author_id.apply(current.author_id),
            household_id: self.household_id.apply(current.household_id),
            description: normalize(self.description.apply(current.description.clone())),
            notes: normalize(self.notes.apply(current.notes.clone())),
            transaction_date,
            updated_at: Utc::now(),
            ..current.clone()
        };
        merged.fingerprint = merged.compute_fingerprint()?;
        Ok(merged)
    }
}

fn check_amount(amount: Option<f64>) -> Result<(), String> {
    match amount {
        None => Err("amount is required".to_string()),
        Some(a) if !a.is_finite() => Err("amount must be a finite number".to_string()),
        Some(a) if a == 0.0 => Err("amount must not be zero".to_string()),
        Some(_) => Ok(()),
    }
}

fn normalize(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn draft() -> TransactionDraft {
        TransactionDraft {
            amount: Some(25.0),
            author_id: Some(UserId::new()),
            description: Some("  Pharmacy ".to_string()),
            transaction_date: Some(Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap()),
            ..Default::default()
        }
    }

    #[test]
    fn valid_draft_becomes_transaction() {
        let tx = draft().into_transaction().unwrap();
        assert_eq!(tx.amount, 25.0);
        assert_eq!(tx.description.as_deref(), Some("Pharmacy"));
        assert_eq!(tx.fingerprint, tx.compute_fingerprint().unwrap());
    }

    #[test]
    fn invalid_draft_collects_every_reason() {
        let err = TransactionDraft {
            amount: Some(0.0),
            ..Default::default()
        }
        .into_transaction()
        .unwrap_err();

        let LedgerError::Validation { reasons } = err else {
            panic!("expected validation error, got {err:?}");
        };
        assert_eq!(reasons.len(), 3);
    }

    #[test]
    fn merge_keeps_unset_fields() {
        let tx = draft().into_transaction().unwrap();
        let update = TransactionUpdate {
            notes: Patch::Set("split with Sam".to_string()),
            ..Default::default()
        };

        let merged = update.merge_into(&tx).unwrap();
        assert_eq!(merged.id, tx.id);
        assert_eq!(merged.amount, tx.amount);
        assert_eq!(merged.notes.as_deref(), Some("split with Sam"));
        assert_eq!(merged.fingerprint, tx.fingerprint);
    }

    #[test]
    fn merge_recomputes_fingerprint() {
        let tx = draft().into_transaction().unwrap();
        let update = TransactionUpdate {
            amount: Patch::Set(30.0),
            ..Default::default()
        };

        let merged = update.merge_into(&tx).unwrap();
        assert_ne!(merged.fingerprint, tx.fingerprint);
    }

    #[test]
    fn merge_can_clear_nullable_fields() {
        let tx = draft().into_transaction().unwrap();
        let update = TransactionUpdate {
            description: Patch::SetNull,
            ..Default::default()
        };

        let merged = update.merge_into(&tx).unwrap();
        assert_eq!(merged.description, None);
    }

    #[test]
    fn merge_rejects_clearing_required_fields() {
        let tx = draft().into_transaction().unwrap();
        let update = TransactionUpdate {
            amount: Patch::SetNull,
            transaction_date: Patch::SetNull,
            ..Default::default()
        };

        let err = update.merge_into(&tx).unwrap_err();
        assert!(matches!(err, LedgerError::Validation { ref reasons } if reasons.len() == 2));
    }

    #[test]
    fn merge_rejects_losing_attribution() {
        let tx = draft().into_transaction().unwrap();
        let update = TransactionUpdate {
            author_id: Patch::SetNull,
            ..Default::default()
        };

        assert!(matches!(update.merge_into(&tx), Err(LedgerError::Hash(_))));
    }
}

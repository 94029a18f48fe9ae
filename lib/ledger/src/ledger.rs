//! The ledger service.
//!
//! Batch operations process every item independently: one bad draft or
//! update never aborts the rest of the batch, and results come back in
//! input order.

use crate::error::LedgerError;
use crate::filter::TransactionFilter;
use crate::repository::{InsertOutcome, ReplaceOutcome, TransactionRepository};
use crate::transaction::{Transaction, TransactionDraft, TransactionUpdate};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tally_core::TransactionId;
use tracing::{debug, instrument, warn};

/// A partial update addressed to one transaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateRequest {
    pub id: TransactionId,
    #[serde(flatten)]
    pub changes: TransactionUpdate,
}

/// A failed item of a batch.
#[derive(Debug, Clone, PartialEq)]
pub struct ItemFailure<'a> {
    /// Position of the item in the input batch.
    pub index: usize,
    /// The addressed transaction, for updates.
    pub id: Option<TransactionId>,
    pub error: &'a LedgerError,
}

/// An item rejected before it reached the ledger, e.g. because it could not
/// be decoded.
#[derive(Debug, Clone, PartialEq)]
pub struct RejectedItem {
    /// Position of the item in the original input.
    pub index: usize,
    pub id: Option<TransactionId>,
    pub error: LedgerError,
}

/// Per-item results of a batch operation, in input order.
#[derive(Debug, Clone, Default)]
pub struct BatchResult {
    items: Vec<(Option<TransactionId>, Result<Transaction, LedgerError>)>,
}

impl BatchResult {
    fn push(&mut self, target: Option<TransactionId>, result: Result<Transaction, LedgerError>) {
        self.items.push((target, result));
    }

    /// Merges items rejected ahead of the ledger back into the batch.
    ///
    /// The batch must hold the results of the remaining items in their
    /// relative order; each rejected item lands at its original index.
    #[must_use]
    pub fn with_rejected(self, mut rejected: Vec<RejectedItem>) -> Self {
        rejected.sort_by_key(|r| r.index);
        let total = self.items.len() + rejected.len();
        let mut rejected = rejected.into_iter().peekable();
        let mut processed = self.items.into_iter();
        let mut items = Vec::with_capacity(total);

        for index in 0..total {
            if let Some(item) = rejected.next_if(|r| r.index == index) {
                items.push((item.id, Err(item.error)));
            } else if let Some(item) = processed.next() {
                items.push(item);
            }
        }
        items.extend(processed);
        items.extend(rejected.map(|item| (item.id, Err(item.error))));

        Self { items }
    }

    /// Returns the results in input order.
    pub fn results(&self) -> impl Iterator<Item = &Result<Transaction, LedgerError>> {
        self.items.iter().map(|(_, result)| result)
    }

    /// Returns the successfully written transactions keyed by id.
    #[must_use]
    pub fn succeeded(&self) -> BTreeMap<TransactionId, &Transaction> {
        self.results()
            .filter_map(|result| result.as_ref().ok())
            .map(|tx| (tx.id, tx))
            .collect()
    }

    /// Returns the failed items with their input positions.
    #[must_use]
    pub fn failed(&self) -> Vec<ItemFailure<'_>> {
        self.items
            .iter()
            .enumerate()
            .filter_map(|(index, (id, result))| {
                result.as_ref().err().map(|error| ItemFailure {
                    index,
                    id: *id,
                    error,
                })
            })
            .collect()
    }

    /// Returns the number of items in the batch.
    #[must_use]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Returns true if the batch was empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// Validates, deduplicates and persists transactions.
#[derive(Clone)]
pub struct Ledger {
    repository: Arc<dyn TransactionRepository>,
}

impl Ledger {
    /// Creates a ledger over a repository.
    pub fn new(repository: Arc<dyn TransactionRepository>) -> Self {
        Self { repository }
    }

    /// Creates transactions from drafts.
    ///
    /// A draft whose fingerprint already exists fails with
    /// `LedgerError::Duplicate` carrying the existing id.
    #[instrument(skip(self, drafts), fields(count = drafts.len()))]
    pub async fn create(&self, drafts: Vec<TransactionDraft>) -> BatchResult {
        let mut batch = BatchResult::default();
        for (index, draft) in drafts.into_iter().enumerate() {
            let result = self.create_one(draft).await;
            if let Err(e) = &result {
                debug!(index, error = %e, "transaction draft rejected");
            }
            batch.push(None, result);
        }
        batch
    }

    async fn create_one(&self, draft: TransactionDraft) -> Result<Transaction, LedgerError> {
        let transaction = draft.into_transaction()?;

        if let Some(existing) = self
            .repository
            .find_by_fingerprint(&transaction.fingerprint)
            .await
            .map_err(LedgerError::storage)?
        {
            return Err(LedgerError::Duplicate {
                existing_id: existing.id,
            });
        }

        match self
            .repository
            .insert(&transaction)
            .await
            .map_err(LedgerError::storage)?
        {
            InsertOutcome::Inserted => Ok(transaction),
            InsertOutcome::Duplicate { existing_id } => {
                warn!(%existing_id, "duplicate transaction detected on insert");
                Err(LedgerError::Duplicate { existing_id })
            }
        }
    }

    /// Loads transactions by id. Ids that do not exist are absent from the
    /// result; callers diff the request against the keys.
    ///
    /// # Errors
    ///
    /// Returns `LedgerError::Storage` if the lookup itself fails.
    #[instrument(skip(self, ids), fields(count = ids.len()))]
    pub async fn get_by_ids(
        &self,
        ids: &[TransactionId],
    ) -> Result<BTreeMap<TransactionId, Transaction>, LedgerError> {
        let rows = self
            .repository
            .get_by_ids(ids)
            .await
            .map_err(LedgerError::storage)?;
        Ok(rows.into_iter().map(|tx| (tx.id, tx)).collect())
    }

    /// Applies partial updates.
    ///
    /// Each update is merged onto the stored row and the fingerprint is
    /// recomputed; if another row already carries the new fingerprint the
    /// update fails with `LedgerError::Duplicate` and the target is left
    /// unchanged.
    #[instrument(skip(self, updates), fields(count = updates.len()))]
    pub async fn update_by_id(&self, updates: Vec<UpdateRequest>) -> BatchResult {
        let mut batch = BatchResult::default();
        for (index, UpdateRequest { id, changes }) in updates.into_iter().enumerate() {
            let result = self.update_one(id, changes).await;
            if let Err(e) = &result {
                debug!(index, %id, error = %e, "transaction update rejected");
            }
            batch.push(Some(id), result);
        }
        batch
    }

    async fn update_one(
        &self,
        id: TransactionId,
        changes: TransactionUpdate,
    ) -> Result<Transaction, LedgerError> {
        let current = self
            .repository
            .get_by_ids(&[id])
            .await
            .map_err(LedgerError::storage)?
            .into_iter()
            .next()
            .ok_or(LedgerError::NotFound { id })?;

        let merged = changes.merge_into(&current)?;

        if merged.fingerprint != current.fingerprint
            && let Some(other) = self
                .repository
                .find_by_fingerprint(&merged.fingerprint)
                .await
                .map_err(LedgerError::storage)?
            && other.id != id
        {
            return Err(LedgerError::Duplicate {
                existing_id: other.id,
            });
        }

        match self
            .repository
            .replace(&merged)
            .await
            .map_err(LedgerError::storage)?
        {
            ReplaceOutcome::Replaced => Ok(merged),
            ReplaceOutcome::Duplicate { existing_id } => {
                warn!(%existing_id, "duplicate transaction detected on update");
                Err(LedgerError::Duplicate { existing_id })
            }
            ReplaceOutcome::Missing => Err(LedgerError::NotFound { id }),
        }
    }

    /// Runs a read-only filtered query.
    ///
    /// # Errors
    ///
    /// Returns `LedgerError::Storage` if the query fails.
    #[instrument(skip(self))]
    pub async fn query(&self, filter: &TransactionFilter) -> Result<Vec<Transaction>, LedgerError> {
        self.repository
            .query(filter)
            .await
            .map_err(LedgerError::storage)
    }
}

//! Storage seam for the ledger.
//!
//! Implementations must enforce fingerprint uniqueness themselves (a unique
//! index in Postgres, a secondary map in memory) and report a collision as
//! an outcome rather than an error, so that concurrent writers racing past
//! the ledger's pre-check still surface a duplicate instead of a failure.

use crate::filter::TransactionFilter;
use crate::fingerprint::Fingerprint;
use crate::transaction::Transaction;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;
use tally_core::{Result, StorageError, TransactionId};

/// Outcome of inserting a new transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    /// The row was written.
    Inserted,
    /// A row with the same fingerprint already exists.
    Duplicate { existing_id: TransactionId },
}

/// Outcome of replacing a stored transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplaceOutcome {
    /// The row was overwritten.
    Replaced,
    /// A different row already has the new fingerprint.
    Duplicate { existing_id: TransactionId },
    /// No row with this id exists.
    Missing,
}

/// Trait for transaction storage.
#[async_trait]
pub trait TransactionRepository: Send + Sync {
    /// Finds the transaction carrying a fingerprint.
    async fn find_by_fingerprint(
        &self,
        fingerprint: &Fingerprint,
    ) -> Result<Option<Transaction>, StorageError>;

    /// Inserts a new transaction.
    async fn insert(&self, transaction: &Transaction) -> Result<InsertOutcome, StorageError>;

    /// Loads the transactions with the given ids. Missing ids are skipped.
    async fn get_by_ids(&self, ids: &[TransactionId]) -> Result<Vec<Transaction>, StorageError>;

    /// Overwrites a stored transaction with a merged version.
    async fn replace(&self, transaction: &Transaction) -> Result<ReplaceOutcome, StorageError>;

    /// Lists transactions matching a filter, ordered and limited.
    async fn query(&self, filter: &TransactionFilter) -> Result<Vec<Transaction>, StorageError>;
}

#[derive(Default)]
struct MemoryState {
    rows: HashMap<TransactionId, Transaction>,
    by_fingerprint: HashMap<Fingerprint, TransactionId>,
}

/// In-memory transaction storage.
#[derive(Default)]
pub struct MemoryTransactionRepository {
    state: Mutex<MemoryState>,
}

impl MemoryTransactionRepository {
    /// Creates an empty repository.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, MemoryState>, StorageError> {
        self.state
            .lock()
            .map_err(|e| StorageError::backend(format!("ledger state poisoned: {e}")).into())
    }
}

#[async_trait]
impl TransactionRepository for MemoryTransactionRepository {
    async fn find_by_fingerprint(
        &self,
        fingerprint: &Fingerprint,
    ) -> Result<Option<Transaction>, StorageError> {
        let state = self.lock()?;
        Ok(state
            .by_fingerprint
            .get(fingerprint)
            .and_then(|id| state.rows.get(id))
            .cloned())
    }

    async fn insert(&self, transaction: &Transaction) -> Result<InsertOutcome, StorageError> {
        let mut state = self.lock()?;
        if let Some(existing_id) = state.by_fingerprint.get(&transaction.fingerprint) {
            return Ok(InsertOutcome::Duplicate {
                existing_id: *existing_id,
            });
        }
        state
            .by_fingerprint
            .insert(transaction.fingerprint.clone(), transaction.id);
        state.rows.insert(transaction.id, transaction.clone());
        Ok(InsertOutcome::Inserted)
    }

    async fn get_by_ids(&self, ids: &[TransactionId]) -> Result<Vec<Transaction>, StorageError> {
        let state = self.lock()?;
        Ok(ids
            .iter()
            .filter_map(|id| state.rows.get(id))
            .cloned()
            .collect())
    }

    async fn replace(&self, transaction: &Transaction) -> Result<ReplaceOutcome, StorageError> {
        let mut state = self.lock()?;
        let Some(previous) = state.rows.get(&transaction.id) else {
            return Ok(ReplaceOutcome::Missing);
        };
        let previous_fingerprint = previous.fingerprint.clone();

        if let Some(existing_id) = state.by_fingerprint.get(&transaction.fingerprint)
            && *existing_id != transaction.id
        {
            return Ok(ReplaceOutcome::Duplicate {
                existing_id: *existing_id,
            });
        }

        state.by_fingerprint.remove(&previous_fingerprint);
        state
            .by_fingerprint
            .insert(transaction.fingerprint.clone(), transaction.id);
        state.rows.insert(transaction.id, transaction.clone());
        Ok(ReplaceOutcome::Replaced)
    }

    async fn query(&self, filter: &TransactionFilter) -> Result<Vec<Transaction>, StorageError> {
        let state = self.lock()?;
        let mut rows: Vec<Transaction> = state
            .rows
            .values()
            .filter(|tx| filter.matches(tx))
            .cloned()
            .collect();
        rows.sort_by(|a, b| filter.order.compare(a, b));
        rows.truncate(filter.effective_limit());
        Ok(rows)
    }
}

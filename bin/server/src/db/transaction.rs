//! Postgres storage for ledger transactions.

use super::decode_id;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rootcause::Report;
use sqlx::{FromRow, PgPool};
use tally_core::{Result, StorageError, TransactionId};
use tally_ledger::{
    Fingerprint, InsertOutcome, ReplaceOutcome, Transaction, TransactionFilter,
    TransactionOrder, TransactionRepository,
};
use tracing::{debug, instrument};

const COLUMNS: &str = "id, amount, author_id, household_id, description, notes, \
                       transaction_date, fingerprint, created_at, updated_at";

/// Row type for transaction queries.
#[derive(FromRow)]
struct TransactionRow {
    id: String,
    amount: f64,
    author_id: Option<String>,
    household_id: Option<String>,
    description: Option<String>,
    notes: Option<String>,
    transaction_date: DateTime<Utc>,
    fingerprint: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TransactionRow {
    fn try_into_transaction(self) -> std::result::Result<Transaction, sqlx::Error> {
        Ok(Transaction {
            id: decode_id("transaction", &self.id)?,
            amount: self.amount,
            author_id: self
                .author_id
                .as_deref()
                .map(|id| decode_id("user", id))
                .transpose()?,
            household_id: self
                .household_id
                .as_deref()
                .map(|id| decode_id("household", id))
                .transpose()?,
            description: self.description,
            notes: self.notes,
            transaction_date: self.transaction_date,
            fingerprint: Fingerprint::from_stored(self.fingerprint),
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

fn storage_error(e: sqlx::Error) -> Report<StorageError> {
    match e {
        sqlx::Error::Decode(_) | sqlx::Error::ColumnDecode { .. } => {
            StorageError::decode(e).into()
        }
        other => StorageError::backend(other).into(),
    }
}

fn order_clause(order: TransactionOrder) -> &'static str {
    match order {
        TransactionOrder::NewestFirst => "transaction_date DESC, id",
        TransactionOrder::OldestFirst => "transaction_date ASC, id",
        TransactionOrder::LargestAmount => "amount DESC, id",
        TransactionOrder::SmallestAmount => "amount ASC, id",
    }
}

/// Transaction storage backed by the `transactions` table.
///
/// The unique index on `fingerprint` is the final arbiter of duplicates, so
/// concurrent writers that both pass the ledger's pre-check still see a
/// duplicate outcome instead of an error.
pub struct PgTransactionRepository {
    pool: PgPool,
}

impl PgTransactionRepository {
    /// Creates a new repository.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn fetch_by_fingerprint(
        &self,
        fingerprint: &str,
    ) -> std::result::Result<Option<Transaction>, sqlx::Error> {
        let row: Option<TransactionRow> = sqlx::query_as(&format!(
            r#"
            SELECT {COLUMNS}
            FROM transactions
            WHERE fingerprint = $1
            "#
        ))
        .bind(fingerprint)
        .fetch_optional(&self.pool)
        .await?;

        row.map(TransactionRow::try_into_transaction).transpose()
    }

    async fn conflicting_id(
        &self,
        transaction: &Transaction,
    ) -> Result<TransactionId, StorageError> {
        match self
            .fetch_by_fingerprint(transaction.fingerprint.as_str())
            .await
            .map_err(storage_error)?
        {
            Some(existing) => Ok(existing.id),
            None => Err(StorageError::backend(format!(
                "fingerprint {} conflicted but no row holds it",
                transaction.fingerprint
            ))
            .into()),
        }
    }
}

#[async_trait]
impl TransactionRepository for PgTransactionRepository {
    async fn find_by_fingerprint(
        &self,
        fingerprint: &Fingerprint,
    ) -> Result<Option<Transaction>, StorageError> {
        self.fetch_by_fingerprint(fingerprint.as_str())
            .await
            .map_err(storage_error)
    }

    #[instrument(skip(self, transaction), fields(id = %transaction.id))]
    async fn insert(&self, transaction: &Transaction) -> Result<InsertOutcome, StorageError> {
        let inserted: Option<(String,)> = sqlx::query_as(
            r#"
            INSERT INTO transactions
                (id, amount, author_id, household_id, description, notes,
                 transaction_date, fingerprint, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (fingerprint) DO NOTHING
            RETURNING id
            "#,
        )
        .bind(transaction.id.to_string())
        .bind(transaction.amount)
        .bind(transaction.author_id.map(|id| id.to_string()))
        .bind(transaction.household_id.map(|id| id.to_string()))
        .bind(&transaction.description)
        .bind(&transaction.notes)
        .bind(transaction.transaction_date)
        .bind(transaction.fingerprint.as_str())
        .bind(transaction.created_at)
        .bind(transaction.updated_at)
        .fetch_optional(&self.pool)
        .await
        .map_err(storage_error)?;

        if inserted.is_some() {
            return Ok(InsertOutcome::Inserted);
        }
        let existing_id = self.conflicting_id(transaction).await?;
        debug!(%existing_id, "insert hit fingerprint index");
        Ok(InsertOutcome::Duplicate { existing_id })
    }

    async fn get_by_ids(&self, ids: &[TransactionId]) -> Result<Vec<Transaction>, StorageError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let id_strings: Vec<String> = ids.iter().map(|id| id.to_string()).collect();
        let rows: Vec<TransactionRow> = sqlx::query_as(&format!(
            r#"
            SELECT {COLUMNS}
            FROM transactions
            WHERE id = ANY($1)
            "#
        ))
        .bind(&id_strings)
        .fetch_all(&self.pool)
        .await
        .map_err(storage_error)?;

        rows.into_iter()
            .map(|r| r.try_into_transaction().map_err(storage_error))
            .collect()
    }

    #[instrument(skip(self, transaction), fields(id = %transaction.id))]
    async fn replace(&self, transaction: &Transaction) -> Result<ReplaceOutcome, StorageError> {
        let result = sqlx::query(
            r#"
            UPDATE transactions
            SET amount = $2, author_id = $3, household_id = $4, description = $5,
                notes = $6, transaction_date = $7, fingerprint = $8, updated_at = $9
            WHERE id = $1
            "#,
        )
        .bind(transaction.id.to_string())
        .bind(transaction.amount)
        .bind(transaction.author_id.map(|id| id.to_string()))
        .bind(transaction.household_id.map(|id| id.to_string()))
        .bind(&transaction.description)
        .bind(&transaction.notes)
        .bind(transaction.transaction_date)
        .bind(transaction.fingerprint.as_str())
        .bind(transaction.updated_at)
        .execute(&self.pool)
        .await;

        match result {
            Ok(done) if done.rows_affected() == 0 => Ok(ReplaceOutcome::Missing),
            Ok(_) => Ok(ReplaceOutcome::Replaced),
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                let existing_id = self.conflicting_id(transaction).await?;
                debug!(%existing_id, "update hit fingerprint index");
                Ok(ReplaceOutcome::Duplicate { existing_id })
            }
            Err(e) => Err(storage_error(e)),
        }
    }

    async fn query(&self, filter: &TransactionFilter) -> Result<Vec<Transaction>, StorageError> {
        let limit = i64::try_from(filter.effective_limit()).unwrap_or(i64::MAX);
        let rows: Vec<TransactionRow> = sqlx::query_as(&format!(
            r#"
            SELECT {COLUMNS}
            FROM transactions
            WHERE ($1::timestamptz IS NULL OR transaction_date >= $1)
              AND ($2::timestamptz IS NULL OR transaction_date < $2)
              AND ($3::text IS NULL OR author_id = $3)
              AND ($4::text IS NULL OR household_id = $4)
              AND ($5::text IS NULL
                   OR strpos(lower(coalesce(description, '')), $5) > 0
                   OR strpos(lower(coalesce(notes, '')), $5) > 0)
            ORDER BY {order}
            LIMIT $6
            "#,
            order = order_clause(filter.order),
        ))
        .bind(filter.from)
        .bind(filter.to)
        .bind(filter.author_id.map(|id| id.to_string()))
        .bind(filter.household_id.map(|id| id.to_string()))
        .bind(filter.search_text())
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(storage_error)?;

        rows.into_iter()
            .map(|r| r.try_into_transaction().map_err(storage_error))
            .collect()
    }
}

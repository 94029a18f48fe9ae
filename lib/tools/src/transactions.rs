//! Ledger-backed tools.

use crate::datetime::FlexibleDateTime;
use crate::report::{BatchReport, TransactionView};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Value as JsonValue, json};
use tally_conversation::{Tool, ToolDefinition, ToolError};
use tally_core::{HouseholdId, TransactionId, UserId};
use tally_ledger::{
    Ledger, LedgerError, Patch, RejectedItem, TransactionDraft, TransactionFilter,
    TransactionOrder, TransactionUpdate, UpdateRequest,
};
use tracing::{debug, info, instrument};

/// Decodes batch items one by one. Items that do not decode are rejected at
/// their index instead of failing the whole call.
fn decode_items<T: DeserializeOwned>(items: Vec<JsonValue>) -> (Vec<T>, Vec<RejectedItem>) {
    let mut decoded = Vec::with_capacity(items.len());
    let mut rejected = Vec::new();
    for (index, item) in items.into_iter().enumerate() {
        let id = item
            .get("id")
            .and_then(JsonValue::as_str)
            .and_then(|id| id.parse::<TransactionId>().ok());
        match serde_json::from_value(item) {
            Ok(value) => decoded.push(value),
            Err(e) => {
                debug!(index, error = %e, "batch item rejected");
                rejected.push(RejectedItem {
                    index,
                    id,
                    error: LedgerError::invalid(e.to_string()),
                });
            }
        }
    }
    (decoded, rejected)
}

fn transaction_fields_schema() -> serde_json::Value {
    json!({
        "amount": {
            "type": "number",
            "description": "The amount of the transaction. Never zero."
        },
        "author_id": {
            "type": "string",
            "description": "ID of the user who made the transaction. Defaults to the message sender unless the user says otherwise."
        },
        "household_id": {
            "type": "string",
            "description": "ID of the sender's household. Only set for shared household expenses."
        },
        "transaction_date": {
            "type": "string",
            "description": "When the transaction happened, formatted YYYY-MM-DD HH:MM:SS."
        },
        "description": {
            "type": "string",
            "description": "Short description, e.g. the merchant."
        },
        "notes": {
            "type": "string",
            "description": "Any extra detail the user shared about this transaction."
        }
    })
}

/// One transaction in a `SaveTransactions` call.
#[derive(Debug, Clone, Deserialize)]
pub struct TransactionInput {
    #[serde(default)]
    pub amount: Option<f64>,
    #[serde(default)]
    pub author_id: Option<UserId>,
    #[serde(default)]
    pub household_id: Option<HouseholdId>,
    #[serde(default)]
    pub transaction_date: Option<FlexibleDateTime>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
}

impl From<TransactionInput> for TransactionDraft {
    fn from(input: TransactionInput) -> Self {
        Self {
            amount: input.amount,
            author_id: input.author_id,
            household_id: input.household_id,
            description: input.description,
            notes: input.notes,
            transaction_date: input.transaction_date.map(Into::into),
        }
    }
}

/// Input of `SaveTransactions`. Items are decoded into
/// [`TransactionInput`] one at a time.
#[derive(Debug, Clone, Deserialize)]
pub struct SaveTransactionsInput {
    pub transactions: Vec<JsonValue>,
}

/// Stores new transactions.
pub struct SaveTransactions {
    ledger: Ledger,
}

impl SaveTransactions {
    /// Creates the tool.
    #[must_use]
    pub fn new(ledger: Ledger) -> Self {
        Self { ledger }
    }
}

#[async_trait]
impl Tool for SaveTransactions {
    type Input = SaveTransactionsInput;
    type Output = BatchReport;

    fn definition(&self) -> ToolDefinition {
        ToolDefinition::new(
            "SaveTransactions",
            "Stores the given transactions. Transactions that were already stored are reported as duplicates with the id of the existing transaction.",
        )
        .with_input_schema(json!({
            "type": "object",
            "properties": {
                "transactions": {
                    "type": "array",
                    "items": {
                        "type": "object",
                        "properties": transaction_fields_schema(),
                        "required": ["amount", "author_id", "transaction_date"]
                    }
                }
            },
            "required": ["transactions"]
        }))
    }

    #[instrument(skip_all, fields(count = input.transactions.len()))]
    async fn call(&self, input: SaveTransactionsInput) -> Result<BatchReport, ToolError> {
        let (inputs, rejected) = decode_items::<TransactionInput>(input.transactions);
        let drafts = inputs.into_iter().map(Into::into).collect();
        let batch = self.ledger.create(drafts).await.with_rejected(rejected);
        let report = BatchReport::from_batch(&batch, "saved");
        info!(
            saved = report.succeeded.len(),
            failed = report.failed.len(),
            "saved transactions"
        );
        Ok(report)
    }
}

/// Input of `GetTransactions`.
#[derive(Debug, Clone, Deserialize)]
pub struct GetTransactionsInput {
    pub ids: Vec<TransactionId>,
}

/// Output of `GetTransactions`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GetTransactionsOutput {
    pub transactions: Vec<TransactionView>,
    pub not_found: Vec<TransactionId>,
}

/// Looks transactions up by id.
pub struct GetTransactions {
    ledger: Ledger,
}

impl GetTransactions {
    /// Creates the tool.
    #[must_use]
    pub fn new(ledger: Ledger) -> Self {
        Self { ledger }
    }
}

#[async_trait]
impl Tool for GetTransactions {
    type Input = GetTransactionsInput;
    type Output = GetTransactionsOutput;

    fn definition(&self) -> ToolDefinition {
        ToolDefinition::new(
            "GetTransactions",
            "Returns the transactions with the given ids and lists the ids that do not exist.",
        )
        .with_input_schema(json!({
            "type": "object",
            "properties": {
                "ids": { "type": "array", "items": { "type": "string" } }
            },
            "required": ["ids"]
        }))
    }

    async fn call(&self, input: GetTransactionsInput) -> Result<GetTransactionsOutput, ToolError> {
        let found = self
            .ledger
            .get_by_ids(&input.ids)
            .await
            .map_err(|e| ToolError::ExecutionFailed {
                name: "GetTransactions".to_string(),
                reason: e.to_string(),
            })?;

        let mut transactions = Vec::new();
        let mut not_found = Vec::new();
        for id in input.ids {
            match found.get(&id) {
                Some(tx) => transactions.push(TransactionView::from(tx)),
                None if !not_found.contains(&id) => not_found.push(id),
                None => {}
            }
        }

        Ok(GetTransactionsOutput {
            transactions,
            not_found,
        })
    }
}

/// One update in an `UpdateTransactionsById` call. Omitted fields are left
/// unchanged; `null` clears a field.
#[derive(Debug, Clone, Deserialize)]
pub struct UpdateInput {
    pub id: TransactionId,
    #[serde(default)]
    pub amount: Patch<f64>,
    #[serde(default)]
    pub author_id: Patch<UserId>,
    #[serde(default)]
    pub household_id: Patch<HouseholdId>,
    #[serde(default)]
    pub transaction_date: Patch<FlexibleDateTime>,
    #[serde(default)]
    pub description: Patch<String>,
    #[serde(default)]
    pub notes: Patch<String>,
}

impl From<UpdateInput> for UpdateRequest {
    fn from(input: UpdateInput) -> Self {
        Self {
            id: input.id,
            changes: TransactionUpdate {
                amount: input.amount,
                author_id: input.author_id,
                household_id: input.household_id,
                description: input.description,
                notes: input.notes,
                transaction_date: input.transaction_date.map(Into::into),
            },
        }
    }
}

/// Input of `UpdateTransactionsById`. Items are decoded into
/// [`UpdateInput`] one at a time.
#[derive(Debug, Clone, Deserialize)]
pub struct UpdateTransactionsInput {
    pub updates: Vec<JsonValue>,
}

/// Applies partial updates to stored transactions.
pub struct UpdateTransactionsById {
    ledger: Ledger,
}

impl UpdateTransactionsById {
    /// Creates the tool.
    #[must_use]
    pub fn new(ledger: Ledger) -> Self {
        Self { ledger }
    }
}

#[async_trait]
impl Tool for UpdateTransactionsById {
    type Input = UpdateTransactionsInput;
    type Output = BatchReport;

    fn definition(&self) -> ToolDefinition {
        let mut properties = transaction_fields_schema();
        if let Some(map) = properties.as_object_mut() {
            map.insert(
                "id".to_string(),
                json!({ "type": "string", "description": "ID of the transaction to update." }),
            );
        }

        ToolDefinition::new(
            "UpdateTransactionsById",
            "Updates the transactions with the given ids. Only include the fields that change; set a field to null to clear it.",
        )
        .with_input_schema(json!({
            "type": "object",
            "properties": {
                "updates": {
                    "type": "array",
                    "items": {
                        "type": "object",
                        "properties": properties,
                        "required": ["id"]
                    }
                }
            },
            "required": ["updates"]
        }))
    }

    #[instrument(skip_all, fields(count = input.updates.len()))]
    async fn call(&self, input: UpdateTransactionsInput) -> Result<BatchReport, ToolError> {
        let (inputs, rejected) = decode_items::<UpdateInput>(input.updates);
        let requests = inputs.into_iter().map(Into::into).collect();
        let batch = self.ledger.update_by_id(requests).await.with_rejected(rejected);
        Ok(BatchReport::from_batch(&batch, "updated"))
    }
}

/// Input of `FilterTransactions`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct FilterTransactionsInput {
    #[serde(default)]
    pub from: Option<FlexibleDateTime>,
    #[serde(default)]
    pub to: Option<FlexibleDateTime>,
    #[serde(default)]
    pub author_id: Option<UserId>,
    #[serde(default)]
    pub household_id: Option<HouseholdId>,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub order: TransactionOrder,
    #[serde(default)]
    pub limit: Option<usize>,
}

/// Output of `FilterTransactions`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FilterTransactionsOutput {
    pub count: usize,
    /// Sum of the returned amounts.
    pub total_amount: f64,
    pub transactions: Vec<TransactionView>,
}

/// Read-only structured transaction search.
pub struct FilterTransactions {
    ledger: Ledger,
}

impl FilterTransactions {
    /// Creates the tool.
    #[must_use]
    pub fn new(ledger: Ledger) -> Self {
        Self { ledger }
    }
}

#[async_trait]
impl Tool for FilterTransactions {
    type Input = FilterTransactionsInput;
    type Output = FilterTransactionsOutput;

    fn definition(&self) -> ToolDefinition {
        ToolDefinition::new(
            "FilterTransactions",
            "Searches stored transactions. Use it whenever the user asks about their spending, e.g. the largest expenses of last month or anything mentioning paypal.",
        )
        .with_input_schema(json!({
            "type": "object",
            "properties": {
                "from": { "type": "string", "description": "Only transactions on or after this date (YYYY-MM-DD)." },
                "to": { "type": "string", "description": "Only transactions before this date (YYYY-MM-DD)." },
                "author_id": { "type": "string" },
                "household_id": { "type": "string" },
                "text": { "type": "string", "description": "Case-insensitive text searched in description and notes." },
                "order": {
                    "type": "string",
                    "enum": ["newest_first", "oldest_first", "largest_amount", "smallest_amount"]
                },
                "limit": { "type": "integer", "minimum": 1, "maximum": tally_ledger::filter::MAX_LIMIT }
            }
        }))
    }

    async fn call(
        &self,
        input: FilterTransactionsInput,
    ) -> Result<FilterTransactionsOutput, ToolError> {
        let defaults = TransactionFilter::default();
        let filter = TransactionFilter {
            from: input.from.map(Into::into),
            to: input.to.map(Into::into),
            author_id: input.author_id,
            household_id: input.household_id,
            text: input.text,
            order: input.order,
            limit: input.limit.unwrap_or(defaults.limit),
        };

        let rows = self
            .ledger
            .query(&filter)
            .await
            .map_err(|e| ToolError::ExecutionFailed {
                name: "FilterTransactions".to_string(),
                reason: e.to_string(),
            })?;

        Ok(FilterTransactionsOutput {
            count: rows.len(),
            total_amount: rows.iter().map(|tx| tx.amount).sum(),
            transactions: rows.iter().map(TransactionView::from).collect(),
        })
    }
}

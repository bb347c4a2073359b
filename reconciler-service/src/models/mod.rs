//! Domain models for reconciler-service.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Raw record from the source (bank aggregator) transaction store.
pub type SourceTransaction = serde_json::Value;

/// Existing record in the destination (budgeting) transaction store.
pub type DestinationTransaction = serde_json::Value;

// ============================================================================
// Mapping Models
// ============================================================================

/// One rule: a dotted path into the source record and the destination field it fills.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldRule {
    pub source_path: String,
    pub dest_field: String,
}

/// Ordered rule set for one source account.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldMapping {
    pub account_id: String,
    pub rules: Vec<FieldRule>,
}

impl FieldMapping {
    pub fn new<I, P, D>(account_id: impl Into<String>, rules: I) -> Self
    where
        I: IntoIterator<Item = (P, D)>,
        P: Into<String>,
        D: Into<String>,
    {
        Self {
            account_id: account_id.into(),
            rules: rules
                .into_iter()
                .map(|(source_path, dest_field)| FieldRule {
                    source_path: source_path.into(),
                    dest_field: dest_field.into(),
                })
                .collect(),
        }
    }

    /// Destination field names in rule order; these are the fields compared when matching.
    pub fn match_fields(&self) -> Vec<String> {
        self.rules.iter().map(|r| r.dest_field.clone()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

/// Links a source account to its destination budget and account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountMapping {
    #[serde(rename = "nordigen_account_id")]
    pub source_account_id: String,
    #[serde(rename = "ynab_budget_id")]
    pub dest_budget_id: String,
    #[serde(rename = "ynab_account_id")]
    pub dest_account_id: String,
}

// ============================================================================
// Transaction Models
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClearedStatus {
    Cleared,
    Uncleared,
    Reconciled,
}

/// A source transaction normalized into the destination schema.
///
/// The serialized form always carries exactly these nine keys.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NormalizedTransaction {
    pub account_id: String,
    pub date: String,
    /// Milliunits: the decimal amount scaled by 1000, truncated toward zero.
    pub amount: i64,
    pub payee_name: Option<String>,
    pub memo: Option<String>,
    pub cleared: ClearedStatus,
    pub approved: bool,
    pub import_id: String,
    pub transaction_id: String,
}

/// An unmatched transaction relabelled for the destination account.
///
/// `transaction.account_id` holds the destination account id and the
/// original source account id moves to `source_account_id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchTransaction {
    #[serde(flatten)]
    pub transaction: NormalizedTransaction,
    pub source_account_id: String,
}

impl DispatchTransaction {
    pub fn relabel(mut transaction: NormalizedTransaction, dest_account_id: &str) -> Self {
        let source_account_id =
            std::mem::replace(&mut transaction.account_id, dest_account_id.to_string());
        Self {
            transaction,
            source_account_id,
        }
    }
}

// ============================================================================
// Sync Status Models
// ============================================================================

/// Marks a source transaction as already forwarded downstream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncStatusRecord {
    pub account_id: String,
    pub transaction_id: String,
    pub sync_timestamp: DateTime<Utc>,
}

// ============================================================================
// Message Models
// ============================================================================

pub const PROCESS_ACCOUNT_ACTION: &str = "process_account";
pub const CREATE_TRANSACTIONS_ACTION: &str = "create_transactions";

/// Inbound work request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub action: String,
    #[serde(default)]
    pub user_id: String,
    #[serde(default)]
    pub account_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskAction<'a> {
    ProcessAccount,
    Unknown(&'a str),
}

impl Task {
    pub fn process_account(user_id: impl Into<String>, account_id: impl Into<String>) -> Self {
        Self {
            action: PROCESS_ACCOUNT_ACTION.to_string(),
            user_id: user_id.into(),
            account_id: account_id.into(),
        }
    }

    pub fn action(&self) -> TaskAction<'_> {
        match self.action.as_str() {
            PROCESS_ACCOUNT_ACTION => TaskAction::ProcessAccount,
            other => TaskAction::Unknown(other),
        }
    }
}

/// Unit of unmatched transactions sent to the destination consumer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutgoingBatch {
    pub action: String,
    pub user_id: String,
    pub budget_id: String,
    pub transactions_data: Vec<DispatchTransaction>,
}

impl OutgoingBatch {
    pub fn create_transactions(
        user_id: impl Into<String>,
        budget_id: impl Into<String>,
        transactions_data: Vec<DispatchTransaction>,
    ) -> Self {
        Self {
            action: CREATE_TRANSACTIONS_ACTION.to_string(),
            user_id: user_id.into(),
            budget_id: budget_id.into(),
            transactions_data,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn normalized() -> NormalizedTransaction {
        NormalizedTransaction {
            account_id: "A1".to_string(),
            date: "2024-01-01".to_string(),
            amount: 12345,
            payee_name: None,
            memo: Some("coffee".to_string()),
            cleared: ClearedStatus::Cleared,
            approved: false,
            import_id: "YNAB:abc".to_string(),
            transaction_id: "T1".to_string(),
        }
    }

    #[test]
    fn test_normalized_transaction_serializes_fixed_key_set() {
        let value = serde_json::to_value(normalized()).unwrap();
        let mut keys: Vec<_> = value.as_object().unwrap().keys().cloned().collect();
        keys.sort();
        assert_eq!(
            keys,
            vec![
                "account_id",
                "amount",
                "approved",
                "cleared",
                "date",
                "import_id",
                "memo",
                "payee_name",
                "transaction_id"
            ]
        );
        assert_eq!(value["cleared"], json!("cleared"));
        assert_eq!(value["payee_name"], json!(null));
    }

    #[test]
    fn test_relabel_moves_source_account() {
        let dispatch = DispatchTransaction::relabel(normalized(), "YNAB-ACC");
        assert_eq!(dispatch.transaction.account_id, "YNAB-ACC");
        assert_eq!(dispatch.source_account_id, "A1");

        let value = serde_json::to_value(&dispatch).unwrap();
        assert_eq!(value["account_id"], json!("YNAB-ACC"));
        assert_eq!(value["source_account_id"], json!("A1"));
        assert_eq!(value["amount"], json!(12345));
    }

    #[test]
    fn test_task_action_parsing() {
        let task: Task = serde_json::from_value(json!({
            "action": "process_account",
            "user_id": "1",
            "account_id": "ca6258ba"
        }))
        .unwrap();
        assert_eq!(task.action(), TaskAction::ProcessAccount);

        let task: Task = serde_json::from_value(json!({ "action": "refresh" })).unwrap();
        assert_eq!(task.action(), TaskAction::Unknown("refresh"));
        assert!(task.account_id.is_empty());
    }

    #[test]
    fn test_outgoing_batch_action() {
        let batch = OutgoingBatch::create_transactions("1", "budget", vec![]);
        assert_eq!(batch.action, CREATE_TRANSACTIONS_ACTION);
    }
}

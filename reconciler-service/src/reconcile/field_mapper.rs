//! Normalizes raw source transactions into the destination schema.

use crate::models::{ClearedStatus, FieldMapping, NormalizedTransaction, SourceTransaction};
use crate::reconcile::tree::{join_sequence, resolve_path, scalar_text};
use crate::services::metrics::record_transactions;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use md5::{Digest, Md5};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde_json::Value;
use std::collections::HashMap;
use std::str::FromStr;
use thiserror::Error;

/// Namespace tag the destination expects on import ids.
pub const IMPORT_ID_PREFIX: &str = "YNAB:";

const AMOUNT_SCALE: i64 = 1000;

/// Field on the source record holding its account id.
pub const SOURCE_ACCOUNT_FIELD: &str = "account_id";

/// Field on the source record holding its transaction id.
pub const SOURCE_TRANSACTION_ID_FIELD: &str = "transactionId";

/// Record-level failure. The record is skipped, the batch continues.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum MappingError {
    #[error("source record has no {0}")]
    MissingField(&'static str),

    #[error("amount '{0}' is not a decimal number")]
    InvalidAmount(String),

    #[error("amount '{0}' does not fit in milliunits")]
    AmountOutOfRange(String),
}

/// Build the idempotency key the destination uses to drop duplicate submissions.
///
/// MD5 over `{account_id}_{date}_{amount}`, so ids stay identical to the ones
/// already stored downstream for the same transaction.
pub fn generate_import_id(account_id: &str, date: &str, amount: i64) -> String {
    let unique = format!("{}_{}_{}", account_id, date, amount);
    let digest = Md5::digest(unique.as_bytes());
    format!("{}{}", IMPORT_ID_PREFIX, URL_SAFE_NO_PAD.encode(digest))
}

/// Scale a decimal amount to integer milliunits, truncating toward zero.
///
/// A missing amount counts as zero; empty or non-numeric text is an error.
pub fn parse_amount(value: Option<&Value>) -> Result<i64, MappingError> {
    let text = match value {
        None | Some(Value::Null) => return Ok(0),
        Some(Value::Number(n)) => n.to_string(),
        Some(Value::String(s)) => s.trim().to_string(),
        Some(other) => return Err(MappingError::InvalidAmount(other.to_string())),
    };

    let decimal = Decimal::from_str(&text)
        .or_else(|_| Decimal::from_scientific(&text))
        .map_err(|_| MappingError::InvalidAmount(text.clone()))?;

    decimal
        .checked_mul(Decimal::from(AMOUNT_SCALE))
        .map(|scaled| scaled.trunc())
        .and_then(|scaled| scaled.to_i64())
        .ok_or(MappingError::AmountOutOfRange(text))
}

/// Resolve one rule's source path to the value assigned to its destination field.
fn resolve_rule_value(record: &Value, path: &str) -> Value {
    match resolve_path(record, path) {
        None => Value::String(String::new()),
        Some(Value::Object(map)) if map.is_empty() => Value::String(String::new()),
        Some(Value::Array(items)) => Value::String(join_sequence(items)),
        Some(other) => other.clone(),
    }
}

fn optional_text(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::Null => None,
        Value::Object(_) | Value::Array(_) => value.map(|v| v.to_string()),
        scalar => scalar_text(scalar),
    }
}

/// Map a single source record through the account's rule set.
pub fn map_transaction(
    record: &SourceTransaction,
    mapping: &FieldMapping,
) -> Result<NormalizedTransaction, MappingError> {
    let mut mapped: HashMap<&str, Value> = HashMap::with_capacity(mapping.rules.len());
    for rule in &mapping.rules {
        mapped.insert(
            rule.dest_field.as_str(),
            resolve_rule_value(record, &rule.source_path),
        );
    }

    let account_id = record
        .get(SOURCE_ACCOUNT_FIELD)
        .and_then(scalar_text)
        .ok_or(MappingError::MissingField(SOURCE_ACCOUNT_FIELD))?;

    let date = mapped
        .get("date")
        .and_then(scalar_text)
        .filter(|d| !d.trim().is_empty())
        .ok_or(MappingError::MissingField("date"))?;

    let amount = parse_amount(mapped.get("amount"))?;

    let transaction_id = record
        .get(SOURCE_TRANSACTION_ID_FIELD)
        .and_then(scalar_text)
        .ok_or(MappingError::MissingField(SOURCE_TRANSACTION_ID_FIELD))?;

    let import_id = generate_import_id(&account_id, &date, amount);

    Ok(NormalizedTransaction {
        account_id,
        date,
        amount,
        payee_name: optional_text(mapped.get("payee_name")),
        memo: optional_text(mapped.get("memo")),
        cleared: ClearedStatus::Cleared,
        approved: false,
        import_id,
        transaction_id,
    })
}

/// Map every record, dropping (and logging) the ones that fail.
pub fn normalize_all(
    records: &[SourceTransaction],
    mapping: &FieldMapping,
) -> Vec<NormalizedTransaction> {
    let mut normalized = Vec::with_capacity(records.len());

    for record in records {
        match map_transaction(record, mapping) {
            Ok(txn) => normalized.push(txn),
            Err(e) => {
                tracing::error!(
                    account_id = %mapping.account_id,
                    transaction_id = ?record.get(SOURCE_TRANSACTION_ID_FIELD),
                    error = %e,
                    "Error preparing transaction for destination, skipping record"
                );
            }
        }
    }

    let skipped = records.len() - normalized.len();
    record_transactions("normalized", normalized.len());
    record_transactions("skipped", skipped);

    tracing::debug!(
        account_id = %mapping.account_id,
        normalized = normalized.len(),
        skipped,
        "Normalized source transactions"
    );

    normalized
}

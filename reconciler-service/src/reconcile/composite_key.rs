//! Comparable keys over a chosen set of fields.

use crate::models::NormalizedTransaction;
use crate::reconcile::tree::join_sequence;
use serde_json::Value;
use std::borrow::Cow;

pub const KEY_DELIMITER: &str = "|";

/// A record whose fields can be read by name.
pub trait FieldSource {
    fn field(&self, name: &str) -> Option<Cow<'_, Value>>;
}

impl FieldSource for Value {
    fn field(&self, name: &str) -> Option<Cow<'_, Value>> {
        self.get(name).map(Cow::Borrowed)
    }
}

impl FieldSource for NormalizedTransaction {
    fn field(&self, name: &str) -> Option<Cow<'_, Value>> {
        let value = match name {
            "account_id" => Value::from(self.account_id.as_str()),
            "date" => Value::from(self.date.as_str()),
            "amount" => Value::from(self.amount),
            "payee_name" => self.payee_name.as_deref().map(Value::from)?,
            "memo" => self.memo.as_deref().map(Value::from)?,
            "cleared" => serde_json::to_value(self.cleared).ok()?,
            "approved" => Value::from(self.approved),
            "import_id" => Value::from(self.import_id.as_str()),
            "transaction_id" => Value::from(self.transaction_id.as_str()),
            _ => return None,
        };
        Some(Cow::Owned(value))
    }
}

/// Lowercase, trim and collapse internal whitespace runs.
fn normalize_text(text: &str) -> String {
    text.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

fn key_component(value: Option<&Value>) -> String {
    match value {
        None | Some(Value::Null) => String::new(),
        Some(Value::Array(items)) => normalize_text(&join_sequence(items)),
        Some(Value::String(s)) => normalize_text(s),
        Some(other) => other.to_string(),
    }
}

/// Build the key for `record` over `fields`, in order.
pub fn composite_key<R>(record: &R, fields: &[String]) -> String
where
    R: FieldSource + ?Sized,
{
    fields
        .iter()
        .map(|name| key_component(record.field(name).as_deref()))
        .collect::<Vec<_>>()
        .join(KEY_DELIMITER)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ClearedStatus;
    use serde_json::json;

    fn fields(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_sequence_and_text_normalize_identically() {
        let memo_fields = fields(&["memo"]);
        let from_sequence = composite_key(&json!({ "memo": ["Coffee ", "Shop"] }), &memo_fields);
        let from_text = composite_key(&json!({ "memo": "coffee shop" }), &memo_fields);
        assert_eq!(from_sequence, from_text);
        assert_eq!(from_text, "coffee shop");
    }

    #[test]
    fn test_case_and_whitespace_insensitive() {
        let key_fields = fields(&["payee_name", "date"]);
        let a = composite_key(&json!({ "payee_name": "  ACME Corp ", "date": "2024-01-01" }), &key_fields);
        let b = composite_key(&json!({ "payee_name": "acme corp", "date": "2024-01-01" }), &key_fields);
        assert_eq!(a, b);
        assert_eq!(a, "acme corp|2024-01-01");
    }

    #[test]
    fn test_missing_and_null_fields_are_empty() {
        let key_fields = fields(&["amount", "memo", "payee_name"]);
        let key = composite_key(&json!({ "amount": -4200, "payee_name": null }), &key_fields);
        assert_eq!(key, "-4200||");
    }

    #[test]
    fn test_field_order_is_preserved() {
        let record = json!({ "amount": 1000, "date": "2024-01-01" });
        assert_eq!(composite_key(&record, &fields(&["amount", "date"])), "1000|2024-01-01");
        assert_eq!(composite_key(&record, &fields(&["date", "amount"])), "2024-01-01|1000");
    }

    #[test]
    fn test_normalized_transaction_matches_destination_record() {
        let normalized = NormalizedTransaction {
            account_id: "A1".to_string(),
            date: "2024-01-01".to_string(),
            amount: 12345,
            payee_name: Some("Corner Cafe ".to_string()),
            memo: None,
            cleared: ClearedStatus::Cleared,
            approved: false,
            import_id: "YNAB:x".to_string(),
            transaction_id: "T1".to_string(),
        };
        let destination = json!({
            "account_id": "ynab-acc",
            "date": "2024-01-01",
            "amount": 12345,
            "payee_name": "corner cafe",
            "memo": null
        });

        let key_fields = fields(&["amount", "date", "payee_name", "memo"]);
        assert_eq!(
            composite_key(&normalized, &key_fields),
            composite_key(&destination, &key_fields)
        );
    }

    #[test]
    fn test_unknown_normalized_field_is_empty() {
        let normalized = NormalizedTransaction {
            account_id: "A1".to_string(),
            date: "2024-01-01".to_string(),
            amount: 1,
            payee_name: None,
            memo: None,
            cleared: ClearedStatus::Cleared,
            approved: false,
            import_id: "YNAB:x".to_string(),
            transaction_id: "T1".to_string(),
        };
        assert_eq!(composite_key(&normalized, &fields(&["category", "amount"])), "|1");
    }
}

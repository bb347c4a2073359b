//! Finds normalized source transactions missing from the destination.

use crate::models::{DestinationTransaction, NormalizedTransaction};
use crate::reconcile::composite_key::composite_key;
use crate::reconcile::sync_status::SyncStatusTracker;
use service_core::error::AppError;
use std::collections::HashSet;

/// Result of one matching pass.
#[derive(Debug, Default)]
pub struct MatchOutcome {
    /// Transactions to forward, in input order.
    pub unmatched: Vec<NormalizedTransaction>,
    /// Present in the destination.
    pub matched: usize,
    /// Absent from the destination but already dispatched earlier.
    pub suppressed: usize,
}

#[derive(Clone)]
pub struct MatchingEngine {
    sync_status: SyncStatusTracker,
}

impl MatchingEngine {
    pub fn new(sync_status: SyncStatusTracker) -> Self {
        Self { sync_status }
    }

    /// Compare via composite keys over `match_fields`.
    ///
    /// A source transaction is excluded when its key exists in the destination
    /// set, or when its (account_id, transaction_id) already carries a sync mark.
    pub async fn find_unmatched(
        &self,
        normalized: Vec<NormalizedTransaction>,
        destination: &[DestinationTransaction],
        match_fields: &[String],
    ) -> Result<MatchOutcome, AppError> {
        let destination_keys: HashSet<String> = destination
            .iter()
            .map(|txn| composite_key(txn, match_fields))
            .collect();

        let mut outcome = MatchOutcome::default();

        for txn in normalized {
            let key = composite_key(&txn, match_fields);

            if destination_keys.contains(&key) {
                tracing::debug!(key = %key, "Transaction key exists in destination");
                outcome.matched += 1;
                continue;
            }

            if self
                .sync_status
                .is_synced(&txn.account_id, &txn.transaction_id)
                .await?
            {
                tracing::debug!(
                    transaction_id = %txn.transaction_id,
                    "Transaction already synced"
                );
                outcome.suppressed += 1;
                continue;
            }

            tracing::debug!(key = %key, "Unmatched transaction");
            outcome.unmatched.push(txn);
        }

        tracing::info!(
            unmatched = outcome.unmatched.len(),
            matched = outcome.matched,
            suppressed = outcome.suppressed,
            "Found unmatched transactions"
        );

        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ClearedStatus;
    use crate::services::memory::InMemoryStores;
    use crate::services::stores::SyncStatusStore;
    use serde_json::json;
    use std::sync::Arc;

    fn txn(id: &str, amount: i64, payee: &str) -> NormalizedTransaction {
        NormalizedTransaction {
            account_id: "A1".to_string(),
            date: "2024-01-01".to_string(),
            amount,
            payee_name: Some(payee.to_string()),
            memo: None,
            cleared: ClearedStatus::Cleared,
            approved: false,
            import_id: format!("YNAB:{}", id),
            transaction_id: id.to_string(),
        }
    }

    fn match_fields() -> Vec<String> {
        vec!["amount".to_string(), "date".to_string(), "payee_name".to_string()]
    }

    fn engine(stores: &Arc<InMemoryStores>) -> MatchingEngine {
        let store: Arc<dyn SyncStatusStore> = stores.clone();
        MatchingEngine::new(SyncStatusTracker::new(store))
    }

    #[tokio::test]
    async fn test_destination_match_excluded_regardless_of_sync_status() {
        let stores = Arc::new(InMemoryStores::new());
        let engine = engine(&stores);
        let destination = vec![json!({ "amount": 1000, "date": "2024-01-01", "payee_name": "SHOP" })];

        let outcome = engine
            .find_unmatched(vec![txn("T1", 1000, "shop")], &destination, &match_fields())
            .await
            .unwrap();
        assert!(outcome.unmatched.is_empty());
        assert_eq!(outcome.matched, 1);

        let tracker = SyncStatusTracker::new(stores.clone());
        tracker.mark_synced("A1", "T1").await.unwrap();
        let outcome = engine
            .find_unmatched(vec![txn("T1", 1000, "shop")], &destination, &match_fields())
            .await
            .unwrap();
        assert!(outcome.unmatched.is_empty());
        assert_eq!(outcome.matched, 1);
        assert_eq!(outcome.suppressed, 0);
    }

    #[tokio::test]
    async fn test_synced_transaction_suppressed() {
        let stores = Arc::new(InMemoryStores::new());
        SyncStatusTracker::new(stores.clone())
            .mark_synced("A1", "T2")
            .await
            .unwrap();

        let outcome = engine(&stores)
            .find_unmatched(
                vec![txn("T1", 1000, "a"), txn("T2", 2000, "b"), txn("T3", 3000, "c")],
                &[],
                &match_fields(),
            )
            .await
            .unwrap();

        let ids: Vec<_> = outcome
            .unmatched
            .iter()
            .map(|t| t.transaction_id.as_str())
            .collect();
        assert_eq!(ids, vec!["T1", "T3"]);
        assert_eq!(outcome.suppressed, 1);
    }

    #[tokio::test]
    async fn test_input_order_preserved() {
        let stores = Arc::new(InMemoryStores::new());
        let destination = vec![json!({ "amount": 5000, "date": "2024-01-01", "payee_name": "e" })];
        let input: Vec<_> = (1..=6)
            .map(|i| txn(&format!("T{}", i), i * 1000, &((b'a' + i as u8 - 1) as char).to_string()))
            .collect();

        let outcome = engine(&stores)
            .find_unmatched(input, &destination, &match_fields())
            .await
            .unwrap();

        let ids: Vec<_> = outcome
            .unmatched
            .iter()
            .map(|t| t.transaction_id.as_str())
            .collect();
        assert_eq!(ids, vec!["T1", "T2", "T3", "T4", "T6"]);
    }

    #[tokio::test]
    async fn test_sync_lookup_failure_propagates() {
        let stores = Arc::new(InMemoryStores::new());
        stores.set_unavailable(true);

        let result = engine(&stores)
            .find_unmatched(vec![txn("T1", 1000, "a")], &[], &match_fields())
            .await;
        assert!(result.is_err());
    }
}

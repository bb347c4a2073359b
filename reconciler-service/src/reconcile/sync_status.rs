//! Durable "already forwarded" markers.

use crate::models::SyncStatusRecord;
use crate::services::stores::SyncStatusStore;
use chrono::Utc;
use service_core::error::AppError;
use std::sync::Arc;

/// Records which source transactions have been dispatched.
///
/// Marks are permanent: there is no expiry and no revocation.
#[derive(Clone)]
pub struct SyncStatusTracker {
    store: Arc<dyn SyncStatusStore>,
}

impl SyncStatusTracker {
    pub fn new(store: Arc<dyn SyncStatusStore>) -> Self {
        Self { store }
    }

    /// Upsert the mark; the latest call's timestamp wins.
    pub async fn mark_synced(&self, account_id: &str, transaction_id: &str) -> Result<(), AppError> {
        let record = SyncStatusRecord {
            account_id: account_id.to_string(),
            transaction_id: transaction_id.to_string(),
            sync_timestamp: Utc::now(),
        };
        self.store.upsert_sync_status(&record).await?;

        tracing::debug!(
            account_id = %account_id,
            transaction_id = %transaction_id,
            "Updated sync status"
        );
        Ok(())
    }

    pub async fn is_synced(&self, account_id: &str, transaction_id: &str) -> Result<bool, AppError> {
        self.store.sync_status_exists(account_id, transaction_id).await
    }
}

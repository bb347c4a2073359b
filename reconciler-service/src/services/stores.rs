//! Capabilities the reconciler needs from its backing stores.

use crate::models::{
    AccountMapping, DestinationTransaction, FieldMapping, SourceTransaction, SyncStatusRecord,
};
use async_trait::async_trait;
use service_core::error::AppError;
use std::sync::Arc;

#[async_trait]
pub trait FieldMappingStore: Send + Sync {
    async fn get_field_mapping(&self, account_id: &str) -> Result<Option<FieldMapping>, AppError>;
}

#[async_trait]
pub trait AccountMappingStore: Send + Sync {
    async fn get_account_mapping(
        &self,
        source_account_id: &str,
    ) -> Result<Option<AccountMapping>, AppError>;
}

#[async_trait]
pub trait SourceTransactionStore: Send + Sync {
    async fn fetch_source_transactions(
        &self,
        account_id: &str,
    ) -> Result<Vec<SourceTransaction>, AppError>;
}

#[async_trait]
pub trait DestinationTransactionStore: Send + Sync {
    async fn fetch_destination_transactions(
        &self,
        dest_account_id: &str,
    ) -> Result<Vec<DestinationTransaction>, AppError>;
}

/// Existence/upsert store keyed by (account_id, transaction_id).
#[async_trait]
pub trait SyncStatusStore: Send + Sync {
    /// Insert or overwrite the record for its key.
    async fn upsert_sync_status(&self, record: &SyncStatusRecord) -> Result<(), AppError>;

    async fn sync_status_exists(
        &self,
        account_id: &str,
        transaction_id: &str,
    ) -> Result<bool, AppError>;
}

/// Store handles injected into the orchestrator.
#[derive(Clone)]
pub struct Stores {
    pub field_mappings: Arc<dyn FieldMappingStore>,
    pub account_mappings: Arc<dyn AccountMappingStore>,
    pub source: Arc<dyn SourceTransactionStore>,
    pub destination: Arc<dyn DestinationTransactionStore>,
    pub sync_status: Arc<dyn SyncStatusStore>,
}

impl Stores {
    /// Use one backend for every capability.
    pub fn from_backend<B>(backend: Arc<B>) -> Self
    where
        B: FieldMappingStore
            + AccountMappingStore
            + SourceTransactionStore
            + DestinationTransactionStore
            + SyncStatusStore
            + 'static,
    {
        Self {
            field_mappings: backend.clone(),
            account_mappings: backend.clone(),
            source: backend.clone(),
            destination: backend.clone(),
            sync_status: backend,
        }
    }
}

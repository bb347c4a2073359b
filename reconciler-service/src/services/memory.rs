//! In-memory store backend for tests and local runs.

use crate::models::{
    AccountMapping, DestinationTransaction, FieldMapping, SourceTransaction, SyncStatusRecord,
};
use crate::services::stores::{
    AccountMappingStore, DestinationTransactionStore, FieldMappingStore, SourceTransactionStore,
    SyncStatusStore,
};
use async_trait::async_trait;
use serde_json::Value;
use service_core::error::AppError;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tokio::sync::RwLock;

#[derive(Default)]
pub struct InMemoryStores {
    field_mappings: RwLock<HashMap<String, FieldMapping>>,
    account_mappings: RwLock<HashMap<String, AccountMapping>>,
    source: RwLock<Vec<SourceTransaction>>,
    destination: RwLock<Vec<DestinationTransaction>>,
    sync_status: RwLock<HashMap<(String, String), SyncStatusRecord>>,
    sync_writes: AtomicUsize,
    unavailable: AtomicBool,
}

impl InMemoryStores {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every store operation fail as if the database were unreachable.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<(), AppError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(AppError::DatabaseError(anyhow::anyhow!(
                "in-memory store marked unavailable"
            )));
        }
        Ok(())
    }

    pub async fn store_field_mapping(&self, mapping: FieldMapping) {
        self.field_mappings
            .write()
            .await
            .insert(mapping.account_id.clone(), mapping);
    }

    pub async fn store_account_mapping(&self, mapping: AccountMapping) {
        self.account_mappings
            .write()
            .await
            .insert(mapping.source_account_id.clone(), mapping);
    }

    pub async fn add_source_transactions(&self, records: impl IntoIterator<Item = Value>) {
        self.source.write().await.extend(records);
    }

    pub async fn add_destination_transactions(&self, records: impl IntoIterator<Item = Value>) {
        self.destination.write().await.extend(records);
    }

    pub async fn sync_record(&self, account_id: &str, transaction_id: &str) -> Option<SyncStatusRecord> {
        self.sync_status
            .read()
            .await
            .get(&(account_id.to_string(), transaction_id.to_string()))
            .cloned()
    }

    /// All sync marks, sorted by (account_id, transaction_id).
    pub async fn sync_marks(&self) -> Vec<(String, String)> {
        let mut keys: Vec<_> = self.sync_status.read().await.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Number of sync-status upserts performed, including overwrites.
    pub fn sync_write_count(&self) -> usize {
        self.sync_writes.load(Ordering::SeqCst)
    }
}

fn filter_by_account(records: &[Value], account_id: &str) -> Vec<Value> {
    records
        .iter()
        .filter(|r| r.get("account_id").and_then(Value::as_str) == Some(account_id))
        .cloned()
        .collect()
}

#[async_trait]
impl FieldMappingStore for InMemoryStores {
    async fn get_field_mapping(&self, account_id: &str) -> Result<Option<FieldMapping>, AppError> {
        self.check_available()?;
        Ok(self.field_mappings.read().await.get(account_id).cloned())
    }
}

#[async_trait]
impl AccountMappingStore for InMemoryStores {
    async fn get_account_mapping(
        &self,
        source_account_id: &str,
    ) -> Result<Option<AccountMapping>, AppError> {
        self.check_available()?;
        Ok(self
            .account_mappings
            .read()
            .await
            .get(source_account_id)
            .cloned())
    }
}

#[async_trait]
impl SourceTransactionStore for InMemoryStores {
    async fn fetch_source_transactions(
        &self,
        account_id: &str,
    ) -> Result<Vec<SourceTransaction>, AppError> {
        self.check_available()?;
        Ok(filter_by_account(&self.source.read().await, account_id))
    }
}

#[async_trait]
impl DestinationTransactionStore for InMemoryStores {
    async fn fetch_destination_transactions(
        &self,
        dest_account_id: &str,
    ) -> Result<Vec<DestinationTransaction>, AppError> {
        self.check_available()?;
        Ok(filter_by_account(&self.destination.read().await, dest_account_id))
    }
}

#[async_trait]
impl SyncStatusStore for InMemoryStores {
    async fn upsert_sync_status(&self, record: &SyncStatusRecord) -> Result<(), AppError> {
        self.check_available()?;
        self.sync_writes.fetch_add(1, Ordering::SeqCst);
        self.sync_status.write().await.insert(
            (record.account_id.clone(), record.transaction_id.clone()),
            record.clone(),
        );
        Ok(())
    }

    async fn sync_status_exists(
        &self,
        account_id: &str,
        transaction_id: &str,
    ) -> Result<bool, AppError> {
        self.check_available()?;
        Ok(self
            .sync_status
            .read()
            .await
            .contains_key(&(account_id.to_string(), transaction_id.to_string())))
    }
}

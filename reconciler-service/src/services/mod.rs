//! Services module for reconciler-service.

pub mod database;
pub mod memory;
pub mod metrics;
pub mod stores;

pub use database::MongoStores;
pub use memory::InMemoryStores;
pub use metrics::{get_metrics, init_metrics};
pub use stores::{
    AccountMappingStore, DestinationTransactionStore, FieldMappingStore, SourceTransactionStore,
    Stores, SyncStatusStore,
};

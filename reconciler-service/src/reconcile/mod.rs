//! Transaction reconciliation engine.

pub mod composite_key;
pub mod field_mapper;
pub mod matching;
pub mod orchestrator;
pub mod sync_status;
pub mod tree;

pub use composite_key::{composite_key, FieldSource};
pub use field_mapper::{generate_import_id, map_transaction, normalize_all, MappingError};
pub use matching::{MatchOutcome, MatchingEngine};
pub use orchestrator::{
    AbortReason, DispatchReport, TaskOrchestrator, TaskOutcome, TaskState, MAX_BATCH_SIZE,
};
pub use sync_status::SyncStatusTracker;

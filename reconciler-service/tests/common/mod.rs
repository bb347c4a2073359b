//! Common test utilities for reconciler-service integration tests.

#![allow(dead_code)]

use reconciler_service::bus::MockPublisher;
use reconciler_service::models::{AccountMapping, FieldMapping, Task};
use reconciler_service::reconcile::{TaskOrchestrator, TaskOutcome};
use reconciler_service::services::{InMemoryStores, Stores};
use serde_json::{json, Value};
use std::sync::{Arc, Once};

static INIT: Once = Once::new();

pub const OUTBOUND_ROUTE: &str = "ynab_tasks";
pub const SOURCE_ACCOUNT: &str = "A1";
pub const DEST_BUDGET: &str = "B1";
pub const DEST_ACCOUNT: &str = "Y1";
pub const USER_ID: &str = "1";

/// Initialize tracing for tests (only once).
pub fn init_tracing() {
    INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter("info,reconciler_service=debug")
            .with_test_writer()
            .try_init()
            .ok();
    });
}

/// Orchestrator wired to in-memory stores and a recording publisher.
pub struct TestHarness {
    pub stores: Arc<InMemoryStores>,
    pub publisher: Arc<MockPublisher>,
    pub orchestrator: TaskOrchestrator,
}

impl TestHarness {
    pub async fn run(&self) -> TaskOutcome {
        self.orchestrator
            .handle_task(Task::process_account(USER_ID, SOURCE_ACCOUNT))
            .await
    }

    pub async fn add_source(&self, records: impl IntoIterator<Item = Value>) {
        self.stores.add_source_transactions(records).await;
    }

    pub async fn add_destination(&self, records: impl IntoIterator<Item = Value>) {
        self.stores.add_destination_transactions(records).await;
    }

    /// Transaction ids in publish order, across all batches.
    pub async fn published_transaction_ids(&self) -> Vec<String> {
        self.publisher
            .published()
            .await
            .into_iter()
            .flat_map(|(_, batch)| batch.transactions_data)
            .map(|txn| txn.transaction.transaction_id)
            .collect()
    }
}

/// Harness with no mappings stored.
pub fn spawn_bare_harness() -> TestHarness {
    init_tracing();

    let stores = Arc::new(InMemoryStores::new());
    let publisher = Arc::new(MockPublisher::new());
    let orchestrator = TaskOrchestrator::new(
        Stores::from_backend(stores.clone()),
        publisher.clone(),
        OUTBOUND_ROUTE,
    );

    TestHarness {
        stores,
        publisher,
        orchestrator,
    }
}

/// Harness with field and account mappings for `SOURCE_ACCOUNT`.
pub async fn spawn_harness() -> TestHarness {
    let harness = spawn_bare_harness();
    harness.stores.store_field_mapping(field_mapping()).await;
    harness.stores.store_account_mapping(account_mapping()).await;
    harness
}

pub fn field_mapping() -> FieldMapping {
    FieldMapping::new(
        SOURCE_ACCOUNT,
        [
            ("transactionAmount.amount", "amount"),
            ("bookingDate", "date"),
            ("creditorName", "payee_name"),
            ("remittanceInformationUnstructured", "memo"),
        ],
    )
}

pub fn account_mapping() -> AccountMapping {
    AccountMapping {
        source_account_id: SOURCE_ACCOUNT.to_string(),
        dest_budget_id: DEST_BUDGET.to_string(),
        dest_account_id: DEST_ACCOUNT.to_string(),
    }
}

/// Bank-aggregator shaped record for `SOURCE_ACCOUNT`.
pub fn source_transaction(id: &str, amount: &str, date: &str, payee: &str) -> Value {
    json!({
        "account_id": SOURCE_ACCOUNT,
        "transactionId": id,
        "bookingDate": date,
        "transactionAmount": { "amount": amount, "currency": "EUR" },
        "creditorName": payee,
    })
}

/// `count` distinct source transactions with ids T001, T002, ...
pub fn numbered_source_transactions(count: usize) -> Vec<Value> {
    (1..=count)
        .map(|i| {
            source_transaction(
                &format!("T{:03}", i),
                &format!("-{}.50", i),
                "2024-03-01",
                &format!("Payee {}", i),
            )
        })
        .collect()
}

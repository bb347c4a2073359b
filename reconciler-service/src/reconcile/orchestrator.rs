//! Per-task state machine: resolve, fetch, normalize, match, batch, dispatch.

use crate::bus::MessagePublisher;
use crate::models::{
    AccountMapping, DestinationTransaction, DispatchTransaction, FieldMapping,
    NormalizedTransaction, OutgoingBatch, SourceTransaction, Task, TaskAction,
};
use crate::reconcile::field_mapper::normalize_all;
use crate::reconcile::matching::MatchingEngine;
use crate::reconcile::sync_status::SyncStatusTracker;
use crate::services::metrics::{
    observe_task_duration, record_batch, record_sync_mark, record_task, record_transactions,
};
use crate::services::stores::Stores;
use service_core::error::AppError;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tracing::Instrument;

/// Upper bound on transactions per outgoing batch (destination API limit).
pub const MAX_BATCH_SIZE: usize = 50;

/// Why a task stopped before dispatching. The task still counts as handled.
#[derive(Debug, Error)]
pub enum AbortReason {
    #[error("no field mapping found for account {0}")]
    MissingFieldMapping(String),

    #[error("no account mapping found for account {0}")]
    MissingAccountMapping(String),

    #[error("store operation failed during {stage}: {source}")]
    Store {
        stage: &'static str,
        #[source]
        source: AppError,
    },
}

impl AbortReason {
    fn store(stage: &'static str) -> impl FnOnce(AppError) -> Self {
        move |source| AbortReason::Store { stage, source }
    }
}

/// Dispatch counters for one task.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DispatchReport {
    pub batches_sent: usize,
    pub batches_failed: usize,
    pub transactions_sent: usize,
    pub sync_marks_failed: usize,
}

#[derive(Debug)]
pub enum TaskOutcome {
    /// Action other than `process_account`; nothing done.
    Ignored { action: String },
    /// Every source transaction already exists downstream or was already sent.
    NothingToSync,
    Completed(DispatchReport),
    Aborted(AbortReason),
}

impl TaskOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            TaskOutcome::Ignored { .. } => "ignored",
            TaskOutcome::NothingToSync => "nothing_to_sync",
            TaskOutcome::Completed(report) if report.batches_failed > 0 => "partial",
            TaskOutcome::Completed(_) => "completed",
            TaskOutcome::Aborted(_) => "aborted",
        }
    }
}

/// Task plus both of its mappings.
#[derive(Debug, Clone)]
pub struct ResolvedTask {
    pub task: Task,
    pub field_mapping: FieldMapping,
    pub account_mapping: AccountMapping,
}

#[derive(Debug)]
pub struct DispatchProgress {
    pub user_id: String,
    pub budget_id: String,
    pub pending: VecDeque<Vec<DispatchTransaction>>,
    pub report: DispatchReport,
}

#[derive(Debug)]
pub enum TaskState {
    TaskReceived(Task),
    MappingResolved {
        task: Task,
        field_mapping: FieldMapping,
    },
    AccountMappingResolved(ResolvedTask),
    SourceFetched {
        resolved: ResolvedTask,
        source: Vec<SourceTransaction>,
    },
    DestinationFetched {
        resolved: ResolvedTask,
        source: Vec<SourceTransaction>,
        destination: Vec<DestinationTransaction>,
    },
    Normalized {
        resolved: ResolvedTask,
        normalized: Vec<NormalizedTransaction>,
        destination: Vec<DestinationTransaction>,
    },
    Matched {
        resolved: ResolvedTask,
        unmatched: Vec<NormalizedTransaction>,
    },
    Batched {
        resolved: ResolvedTask,
        batches: Vec<Vec<DispatchTransaction>>,
    },
    Dispatching(DispatchProgress),
    StatusUpdated(DispatchProgress),
    Idle(TaskOutcome),
}

impl TaskState {
    pub fn name(&self) -> &'static str {
        match self {
            TaskState::TaskReceived(_) => "task_received",
            TaskState::MappingResolved { .. } => "mapping_resolved",
            TaskState::AccountMappingResolved(_) => "account_mapping_resolved",
            TaskState::SourceFetched { .. } => "source_fetched",
            TaskState::DestinationFetched { .. } => "destination_fetched",
            TaskState::Normalized { .. } => "normalized",
            TaskState::Matched { .. } => "matched",
            TaskState::Batched { .. } => "batched",
            TaskState::Dispatching(_) => "dispatching",
            TaskState::StatusUpdated(_) => "status_updated",
            TaskState::Idle(_) => "idle",
        }
    }
}

/// Split into consecutive chunks of at most `size`, keeping order.
pub fn partition<T: Clone>(items: &[T], size: usize) -> Vec<Vec<T>> {
    items.chunks(size.max(1)).map(|chunk| chunk.to_vec()).collect()
}

pub struct TaskOrchestrator {
    stores: Stores,
    sync_status: SyncStatusTracker,
    matcher: MatchingEngine,
    publisher: Arc<dyn MessagePublisher>,
    outbound_route: String,
}

impl TaskOrchestrator {
    pub fn new(
        stores: Stores,
        publisher: Arc<dyn MessagePublisher>,
        outbound_route: impl Into<String>,
    ) -> Self {
        let sync_status = SyncStatusTracker::new(stores.sync_status.clone());
        let matcher = MatchingEngine::new(sync_status.clone());
        Self {
            stores,
            sync_status,
            matcher,
            publisher,
            outbound_route: outbound_route.into(),
        }
    }

    /// Drive one task from `TaskReceived` to `Idle`.
    pub async fn handle_task(&self, task: Task) -> TaskOutcome {
        let span = tracing::info_span!(
            "task",
            action = %task.action,
            account_id = %task.account_id,
            user_id = %task.user_id,
        );

        async {
            let start = Instant::now();
            let mut state = TaskState::TaskReceived(task);

            let outcome = loop {
                let from = state.name();
                state = match self.step(state).await {
                    Ok(TaskState::Idle(outcome)) => break outcome,
                    Ok(next) => next,
                    Err(reason) => {
                        tracing::error!(state = from, error = %reason, "Task aborted");
                        break TaskOutcome::Aborted(reason);
                    }
                };
                tracing::trace!(from, to = state.name(), "Task state transition");
            };

            record_task(outcome.label());
            observe_task_duration(outcome.label(), start.elapsed().as_secs_f64());
            outcome
        }
        .instrument(span)
        .await
    }

    /// Apply the single transition for `state`.
    pub async fn step(&self, state: TaskState) -> Result<TaskState, AbortReason> {
        match state {
            TaskState::TaskReceived(task) => self.resolve_field_mapping(task).await,
            TaskState::MappingResolved {
                task,
                field_mapping,
            } => self.resolve_account_mapping(task, field_mapping).await,
            TaskState::AccountMappingResolved(resolved) => self.fetch_source(resolved).await,
            TaskState::SourceFetched { resolved, source } => {
                self.fetch_destination(resolved, source).await
            }
            TaskState::DestinationFetched {
                resolved,
                source,
                destination,
            } => Ok(Self::normalize(resolved, source, destination)),
            TaskState::Normalized {
                resolved,
                normalized,
                destination,
            } => self.match_transactions(resolved, normalized, destination).await,
            TaskState::Matched {
                resolved,
                unmatched,
            } => Ok(Self::batch(resolved, unmatched)),
            TaskState::Batched { resolved, batches } => Ok(Self::start_dispatch(resolved, batches)),
            TaskState::Dispatching(progress) => Ok(self.dispatch_next(progress).await),
            TaskState::StatusUpdated(progress) => Ok(Self::after_status_update(progress)),
            TaskState::Idle(outcome) => Ok(TaskState::Idle(outcome)),
        }
    }

    async fn resolve_field_mapping(&self, task: Task) -> Result<TaskState, AbortReason> {
        if let TaskAction::Unknown(action) = task.action() {
            tracing::warn!(action = %action, "Unknown action");
            return Ok(TaskState::Idle(TaskOutcome::Ignored {
                action: action.to_string(),
            }));
        }

        let field_mapping = self
            .stores
            .field_mappings
            .get_field_mapping(&task.account_id)
            .await
            .map_err(AbortReason::store("field mapping lookup"))?
            .filter(|mapping| !mapping.is_empty())
            .ok_or_else(|| AbortReason::MissingFieldMapping(task.account_id.clone()))?;

        tracing::debug!(rules = field_mapping.rules.len(), "Retrieved field mapping");
        Ok(TaskState::MappingResolved {
            task,
            field_mapping,
        })
    }

    async fn resolve_account_mapping(
        &self,
        task: Task,
        field_mapping: FieldMapping,
    ) -> Result<TaskState, AbortReason> {
        let account_mapping = self
            .stores
            .account_mappings
            .get_account_mapping(&task.account_id)
            .await
            .map_err(AbortReason::store("account mapping lookup"))?
            .ok_or_else(|| AbortReason::MissingAccountMapping(task.account_id.clone()))?;

        tracing::debug!(
            dest_budget_id = %account_mapping.dest_budget_id,
            dest_account_id = %account_mapping.dest_account_id,
            "Retrieved account mapping"
        );
        Ok(TaskState::AccountMappingResolved(ResolvedTask {
            task,
            field_mapping,
            account_mapping,
        }))
    }

    async fn fetch_source(&self, resolved: ResolvedTask) -> Result<TaskState, AbortReason> {
        let source = self
            .stores
            .source
            .fetch_source_transactions(&resolved.task.account_id)
            .await
            .map_err(AbortReason::store("source fetch"))?;

        tracing::info!(count = source.len(), "Fetched source transactions");
        record_transactions("fetched", source.len());
        Ok(TaskState::SourceFetched { resolved, source })
    }

    async fn fetch_destination(
        &self,
        resolved: ResolvedTask,
        source: Vec<SourceTransaction>,
    ) -> Result<TaskState, AbortReason> {
        let destination = self
            .stores
            .destination
            .fetch_destination_transactions(&resolved.account_mapping.dest_account_id)
            .await
            .map_err(AbortReason::store("destination fetch"))?;

        tracing::info!(
            count = destination.len(),
            dest_account_id = %resolved.account_mapping.dest_account_id,
            "Fetched destination transactions"
        );
        Ok(TaskState::DestinationFetched {
            resolved,
            source,
            destination,
        })
    }

    fn normalize(
        resolved: ResolvedTask,
        source: Vec<SourceTransaction>,
        destination: Vec<DestinationTransaction>,
    ) -> TaskState {
        let normalized = normalize_all(&source, &resolved.field_mapping);
        TaskState::Normalized {
            resolved,
            normalized,
            destination,
        }
    }

    async fn match_transactions(
        &self,
        resolved: ResolvedTask,
        normalized: Vec<NormalizedTransaction>,
        destination: Vec<DestinationTransaction>,
    ) -> Result<TaskState, AbortReason> {
        let match_fields = resolved.field_mapping.match_fields();
        let outcome = self
            .matcher
            .find_unmatched(normalized, &destination, &match_fields)
            .await
            .map_err(AbortReason::store("sync status lookup"))?;

        record_transactions("matched", outcome.matched);
        record_transactions("suppressed", outcome.suppressed);
        record_transactions("unmatched", outcome.unmatched.len());

        if outcome.unmatched.is_empty() {
            tracing::info!("No unmatched transactions found");
            return Ok(TaskState::Idle(TaskOutcome::NothingToSync));
        }

        Ok(TaskState::Matched {
            resolved,
            unmatched: outcome.unmatched,
        })
    }

    fn batch(resolved: ResolvedTask, unmatched: Vec<NormalizedTransaction>) -> TaskState {
        let dest_account_id = resolved.account_mapping.dest_account_id.clone();
        let relabelled: Vec<DispatchTransaction> = unmatched
            .into_iter()
            .map(|txn| DispatchTransaction::relabel(txn, &dest_account_id))
            .collect();

        let batches = partition(&relabelled, MAX_BATCH_SIZE);
        tracing::debug!(
            transactions = relabelled.len(),
            batches = batches.len(),
            "Partitioned unmatched transactions"
        );
        TaskState::Batched { resolved, batches }
    }

    fn start_dispatch(resolved: ResolvedTask, batches: Vec<Vec<DispatchTransaction>>) -> TaskState {
        TaskState::Dispatching(DispatchProgress {
            user_id: resolved.task.user_id,
            budget_id: resolved.account_mapping.dest_budget_id,
            pending: batches.into(),
            report: DispatchReport::default(),
        })
    }

    /// Publish the next batch; on success mark its members synced.
    async fn dispatch_next(&self, mut progress: DispatchProgress) -> TaskState {
        let Some(batch) = progress.pending.pop_front() else {
            return TaskState::Idle(TaskOutcome::Completed(progress.report));
        };

        let message = OutgoingBatch::create_transactions(
            progress.user_id.clone(),
            progress.budget_id.clone(),
            batch,
        );

        tracing::debug!(payload = ?message, "Sending batch to destination");

        match self.publisher.publish(&self.outbound_route, &message).await {
            Ok(()) => {
                tracing::info!(
                    route = %self.outbound_route,
                    size = message.transactions_data.len(),
                    "Sent batch to destination queue"
                );
                record_batch("sent");
                progress.report.batches_sent += 1;
                progress.report.transactions_sent += message.transactions_data.len();
                progress.report.sync_marks_failed +=
                    self.mark_batch_synced(&message.transactions_data).await;
                TaskState::StatusUpdated(progress)
            }
            Err(e) => {
                tracing::error!(
                    route = %self.outbound_route,
                    size = message.transactions_data.len(),
                    error = %e,
                    "Failed to send batch, skipping sync status update"
                );
                record_batch("failed");
                progress.report.batches_failed += 1;
                Self::after_status_update(progress)
            }
        }
    }

    /// Returns how many marks failed.
    async fn mark_batch_synced(&self, batch: &[DispatchTransaction]) -> usize {
        let mut failed = 0;
        for txn in batch {
            match self
                .sync_status
                .mark_synced(&txn.source_account_id, &txn.transaction.transaction_id)
                .await
            {
                Ok(()) => record_sync_mark("ok"),
                Err(e) => {
                    failed += 1;
                    record_sync_mark("failed");
                    tracing::error!(
                        account_id = %txn.source_account_id,
                        transaction_id = %txn.transaction.transaction_id,
                        error = %e,
                        "Failed to update sync status"
                    );
                }
            }
        }
        failed
    }

    fn after_status_update(progress: DispatchProgress) -> TaskState {
        if progress.pending.is_empty() {
            tracing::info!(
                batches_sent = progress.report.batches_sent,
                batches_failed = progress.report.batches_failed,
                transactions_sent = progress.report.transactions_sent,
                "Processed unmatched transactions and updated sync status"
            );
            TaskState::Idle(TaskOutcome::Completed(progress.report))
        } else {
            TaskState::Dispatching(progress)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::MockPublisher;
    use crate::services::memory::InMemoryStores;
    use serde_json::json;

    #[test]
    fn test_partition_sizes_and_order() {
        let items: Vec<usize> = (0..120).collect();
        let batches = partition(&items, MAX_BATCH_SIZE);

        let sizes: Vec<_> = batches.iter().map(Vec::len).collect();
        assert_eq!(sizes, vec![50, 50, 20]);
        assert_eq!(batches.concat(), items);
    }

    #[test]
    fn test_partition_counts() {
        for n in [0usize, 1, 49, 50, 51, 100, 101] {
            let items: Vec<usize> = (0..n).collect();
            let batches = partition(&items, MAX_BATCH_SIZE);
            assert_eq!(batches.len(), n.div_ceil(MAX_BATCH_SIZE));
            assert!(batches.iter().all(|b| !b.is_empty() && b.len() <= MAX_BATCH_SIZE));
        }
    }

    fn orchestrator(stores: &Arc<InMemoryStores>, publisher: &Arc<MockPublisher>) -> TaskOrchestrator {
        TaskOrchestrator::new(
            Stores::from_backend(stores.clone()),
            publisher.clone(),
            "ynab_tasks",
        )
    }

    #[tokio::test]
    async fn test_step_unknown_action_goes_idle() {
        let stores = Arc::new(InMemoryStores::new());
        let publisher = Arc::new(MockPublisher::new());
        let orchestrator = orchestrator(&stores, &publisher);

        let task = Task {
            action: "sync_everything".to_string(),
            user_id: "1".to_string(),
            account_id: "A1".to_string(),
        };
        let next = orchestrator.step(TaskState::TaskReceived(task)).await.unwrap();
        assert!(matches!(
            next,
            TaskState::Idle(TaskOutcome::Ignored { ref action }) if action == "sync_everything"
        ));
    }

    #[tokio::test]
    async fn test_step_missing_field_mapping_aborts() {
        let stores = Arc::new(InMemoryStores::new());
        let publisher = Arc::new(MockPublisher::new());
        let orchestrator = orchestrator(&stores, &publisher);

        let result = orchestrator
            .step(TaskState::TaskReceived(Task::process_account("1", "A1")))
            .await;
        assert!(matches!(result, Err(AbortReason::MissingFieldMapping(ref id)) if id == "A1"));
    }

    #[tokio::test]
    async fn test_step_empty_field_mapping_counts_as_missing() {
        let stores = Arc::new(InMemoryStores::new());
        stores
            .store_field_mapping(FieldMapping::new("A1", Vec::<(String, String)>::new()))
            .await;
        let publisher = Arc::new(MockPublisher::new());
        let orchestrator = orchestrator(&stores, &publisher);

        let result = orchestrator
            .step(TaskState::TaskReceived(Task::process_account("1", "A1")))
            .await;
        assert!(matches!(result, Err(AbortReason::MissingFieldMapping(_))));
    }

    #[tokio::test]
    async fn test_step_missing_account_mapping_aborts() {
        let stores = Arc::new(InMemoryStores::new());
        let publisher = Arc::new(MockPublisher::new());
        let orchestrator = orchestrator(&stores, &publisher);

        let result = orchestrator
            .step(TaskState::MappingResolved {
                task: Task::process_account("1", "A1"),
                field_mapping: FieldMapping::new("A1", [("amount", "amount")]),
            })
            .await;
        assert!(matches!(result, Err(AbortReason::MissingAccountMapping(_))));
    }

    #[tokio::test]
    async fn test_step_batched_relabels_transactions() {
        let stores = Arc::new(InMemoryStores::new());
        let publisher = Arc::new(MockPublisher::new());
        let orchestrator = orchestrator(&stores, &publisher);

        let record = json!({
            "amount": "1.5",
            "transactionDate": "2024-01-01",
            "transactionId": "T1",
            "account_id": "A1"
        });
        let mapping = FieldMapping::new("A1", [("amount", "amount"), ("transactionDate", "date")]);
        let normalized = normalize_all(&[record], &mapping);

        let resolved = ResolvedTask {
            task: Task::process_account("1", "A1"),
            field_mapping: mapping,
            account_mapping: AccountMapping {
                source_account_id: "A1".to_string(),
                dest_budget_id: "B1".to_string(),
                dest_account_id: "Y1".to_string(),
            },
        };

        let next = orchestrator
            .step(TaskState::Matched {
                resolved,
                unmatched: normalized,
            })
            .await
            .unwrap();

        let TaskState::Batched { batches, .. } = next else {
            panic!("expected batched state, got {}", next.name());
        };
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0][0].transaction.account_id, "Y1");
        assert_eq!(batches[0][0].source_account_id, "A1");
    }
}

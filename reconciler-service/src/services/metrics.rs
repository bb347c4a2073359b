//! Prometheus metrics for reconciler-service.

use once_cell::sync::Lazy;
use prometheus::{
    register_counter_vec, register_histogram_vec, CounterVec, Encoder, HistogramVec, TextEncoder,
};

/// Counter for handled tasks by outcome.
pub static TASKS: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "reconciler_tasks_total",
        "Total number of tasks handled",
        &["outcome"]
    )
    .expect("Failed to register TASKS")
});

/// Histogram for task duration by outcome.
pub static TASK_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "reconciler_task_duration_seconds",
        "Task handling duration in seconds",
        &["outcome"],
        vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0]
    )
    .expect("Failed to register TASK_DURATION")
});

/// Counter for transactions by reconciliation stage.
pub static TRANSACTIONS: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "reconciler_transactions_total",
        "Transactions seen per reconciliation stage",
        &["stage"]
    )
    .expect("Failed to register TRANSACTIONS")
});

/// Counter for outgoing batches by status.
pub static BATCHES: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "reconciler_batches_total",
        "Outgoing batches by dispatch status",
        &["status"]
    )
    .expect("Failed to register BATCHES")
});

/// Counter for sync-status writes by status.
pub static SYNC_MARKS: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "reconciler_sync_marks_total",
        "Sync status writes by result",
        &["status"]
    )
    .expect("Failed to register SYNC_MARKS")
});

/// Initialize all metrics (forces lazy initialization).
pub fn init_metrics() {
    Lazy::force(&TASKS);
    Lazy::force(&TASK_DURATION);
    Lazy::force(&TRANSACTIONS);
    Lazy::force(&BATCHES);
    Lazy::force(&SYNC_MARKS);
}

/// Get all metrics as Prometheus text format.
pub fn get_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!(error = %e, "Failed to encode metrics");
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

pub fn record_task(outcome: &str) {
    TASKS.with_label_values(&[outcome]).inc();
}

pub fn observe_task_duration(outcome: &str, duration_secs: f64) {
    TASK_DURATION
        .with_label_values(&[outcome])
        .observe(duration_secs);
}

pub fn record_transactions(stage: &str, count: usize) {
    TRANSACTIONS
        .with_label_values(&[stage])
        .inc_by(count as f64);
}

pub fn record_batch(status: &str) {
    BATCHES.with_label_values(&[status]).inc();
}

pub fn record_sync_mark(status: &str) {
    SYNC_MARKS.with_label_values(&[status]).inc();
}

//! Metric instrument factories for syncq.
//!
//! Uses the OTel Meter API with the globally-registered `MeterProvider`.
//! All instruments are created lazily from the `"syncq"` meter.

use opentelemetry::metrics::{Counter, Histogram, Meter};

/// Returns the shared meter for syncq instruments.
fn meter() -> Meter {
    opentelemetry::global::meter("syncq")
}

/// Counter: tasks inserted into the queue.
/// Labels: `task_name`.
pub fn tasks_enqueued() -> Counter<u64> {
    meter()
        .u64_counter("syncq.tasks.enqueued")
        .with_description("Number of tasks added to the queue")
        .build()
}

/// Counter: claim attempts.
/// Labels: `result` ("claimed" | "empty").
pub fn task_claims() -> Counter<u64> {
    meter()
        .u64_counter("syncq.tasks.claims")
        .with_description("Number of queue pops")
        .build()
}

/// Counter: task state transitions written by the driver, including
/// retries refreshed back to ready. Claims are counted by `task_claims`.
/// Labels: `to`.
pub fn task_state_transitions() -> Counter<u64> {
    meter()
        .u64_counter("syncq.tasks.state_transitions")
        .with_description("Number of task state transitions")
        .build()
}

/// Counter: tasks cancelled because no handler was registered.
/// Labels: `task_name`.
pub fn task_unroutable() -> Counter<u64> {
    meter()
        .u64_counter("syncq.tasks.unroutable")
        .with_description("Tasks with no registered handler")
        .build()
}

/// Counter: scheduled action runs.
/// Labels: `stream`, `result` ("ok" | "error").
pub fn scheduled_action_runs() -> Counter<u64> {
    meter()
        .u64_counter("syncq.scheduled_actions.runs")
        .with_description("Number of scheduled action runs")
        .build()
}

/// Counter: CDC changes applied.
/// Labels: `controller_id`, `kind`.
pub fn cdc_changes() -> Counter<u64> {
    meter()
        .u64_counter("syncq.cdc.changes")
        .with_description("Number of CDC changes handled")
        .build()
}

/// Histogram: operation duration in milliseconds.
/// Labels: `operation`.
pub fn operation_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("syncq.operation.duration_ms")
        .with_description("Operation duration in milliseconds")
        .with_unit("ms")
        .build()
}

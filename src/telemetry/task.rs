//! Task dispatch span helpers.

use tracing::Span;

use crate::model::task::{TaskId, TaskState};

/// Start a span covering the dispatch of one claimed task.
pub fn start_task_span(task_name: &str, task_id: &TaskId) -> Span {
    tracing::info_span!(
        "task.dispatch",
        "task.name" = task_name,
        "task.id" = %task_id,
    )
}

/// Record a state transition event on the given span.
pub fn record_state_transition(span: &Span, from: TaskState, to: TaskState) {
    span.in_scope(|| {
        tracing::info!(from = from.as_str(), to = to.as_str(), "state_transition");
    });
}

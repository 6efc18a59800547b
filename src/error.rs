//! Error types for syncq.

use thiserror::Error;

use crate::model::task::{TaskId, TaskState};

#[derive(Debug, Error)]
pub enum Error {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid state transition for task {id}: {from:?} -> {to:?}")]
    InvalidTransition {
        id: TaskId,
        from: Option<TaskState>,
        to: TaskState,
    },

    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("invalid task payload: {0}")]
    InvalidPayload(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("config error: {0}")]
    Config(String),

    #[error("cancelling task {id} because there is no action to handle {name:?}")]
    Unroutable { id: TaskId, name: String },

    #[error("task {id} ({name}) failed (retryable: {retryable}): {message}")]
    TaskFailed {
        id: TaskId,
        name: String,
        message: String,
        retryable: bool,
    },

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;

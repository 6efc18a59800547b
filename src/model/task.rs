//! Task data model.
//!
//! A task is a durable request to do something: "synchronise customer 123".
//! The same logical request may sit in the queue several times under one
//! `key`; the `name` decides which registered handler runs it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};

/// Payload carried by a task. Opaque to the queue.
pub type TaskData = serde_json::Map<String, serde_json::Value>;

// ---------------------------------------------------------------------------
// Task
// ---------------------------------------------------------------------------

/// A unit of work stored in the queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Driver-assigned identity.
    pub id: TaskId,

    /// Application identity hint. Repeated enqueues under the same key are
    /// repeated requests for one logical unit of work.
    pub key: String,

    /// Selects the handler registered with the sync manager.
    pub name: String,

    /// Arbitrary parameters for the handler.
    pub data: TaskData,

    pub created_at: DateTime<Utc>,

    /// The task may not be claimed before this instant.
    pub not_before: Option<DateTime<Utc>>,

    /// Current lifecycle state.
    pub state: TaskState,

    /// When the task was last claimed or transitioned.
    pub last_attempted: DateTime<Utc>,

    /// Message recorded with the last transition.
    pub last_attempt_message: Option<String>,
}

/// Newtype for task IDs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub Uuid);

impl TaskId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

/// Lifecycle state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskState {
    /// Waiting to be claimed.
    Ready,
    /// Claimed by a sync manager.
    InProgress,
    /// Soft failure, waiting for a refresh before it is claimable again.
    Retry,
    /// Completed successfully. Terminal.
    Done,
    /// Permanently failed. Terminal.
    Failed,
    /// Cancelled, e.g. no handler was registered. Terminal.
    Cancelled,
}

impl TaskState {
    pub const ALL: [TaskState; 6] = [
        TaskState::Ready,
        TaskState::InProgress,
        TaskState::Retry,
        TaskState::Done,
        TaskState::Failed,
        TaskState::Cancelled,
    ];

    /// Can transition from self to `to`?
    pub fn can_transition_to(self, to: TaskState) -> bool {
        use TaskState::*;
        matches!(
            (self, to),
            (Ready, InProgress)
                | (InProgress, Done)
                | (InProgress, Failed)
                | (InProgress, Retry)
                | (InProgress, Ready)   // lease expired without completion
                | (Retry, Ready)
                | (Ready, Cancelled)
                | (InProgress, Cancelled)
        )
    }

    /// States from which `to` may be entered.
    pub fn sources_of(to: TaskState) -> Vec<TaskState> {
        Self::ALL
            .into_iter()
            .filter(|from| from.can_transition_to(to))
            .collect()
    }

    /// Is this a terminal state?
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskState::Done | TaskState::Failed | TaskState::Cancelled
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskState::Ready => "READY",
            TaskState::InProgress => "IN_PROGRESS",
            TaskState::Retry => "RETRY",
            TaskState::Done => "DONE",
            TaskState::Failed => "FAILED",
            TaskState::Cancelled => "CANCELLED",
        }
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TaskState {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        TaskState::ALL
            .into_iter()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| Error::Other(format!("unknown task state: {s}")))
    }
}

/// Convert a serialized payload into task data. Only JSON objects are
/// accepted.
pub fn task_data_from_value(value: serde_json::Value) -> Result<TaskData> {
    match value {
        serde_json::Value::Object(map) => Ok(map),
        serde_json::Value::Null => Ok(TaskData::new()),
        other => Err(Error::InvalidPayload(format!(
            "task data must be a JSON object, got {other}"
        ))),
    }
}

//! Handlers run by the sync manager.
//!
//! A [`TaskAction`] handles queued tasks of one name. A [`ScheduledAction`]
//! is triggered by a timer instead of queue content.

use async_trait::async_trait;

use crate::error::Result;
use crate::model::task::Task;

/// Result of handling a task, with a message stored alongside it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    /// Done. The task is completed.
    Success(String),
    /// Failed and must not be retried.
    PermanentFailure(String),
    /// Failed, but may succeed later. The task is parked in `RETRY`.
    RetryableFailure(String),
}

impl TaskOutcome {
    pub fn success(message: impl Into<String>) -> Self {
        Self::Success(message.into())
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self::PermanentFailure(message.into())
    }

    pub fn retry(message: impl Into<String>) -> Self {
        Self::RetryableFailure(message.into())
    }

    pub fn message(&self) -> &str {
        match self {
            Self::Success(m) | Self::PermanentFailure(m) | Self::RetryableFailure(m) => m,
        }
    }
}

/// Handles tasks pulled from the queue.
///
/// Delivery is at-least-once: a task whose claim expires is handed out
/// again, so handlers must tolerate seeing the same task twice.
#[async_trait]
pub trait TaskAction: Send + Sync {
    async fn handle(&self, task: &Task) -> TaskOutcome;
}

/// Work run on a timer.
#[async_trait]
pub trait ScheduledAction: Send + Sync {
    async fn run(&self) -> Result<()>;

    /// Actions sharing a stream never run at the same time. Actions on
    /// different streams run side by side.
    fn stream(&self) -> String;
}

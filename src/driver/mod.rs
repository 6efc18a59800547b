//! Storage driver contract for the task queue.
//!
//! All coordination state lives behind a driver, so several processes can
//! share one queue. `pop` is the only operation that must be atomic; every
//! other operation is a plain state write.

pub mod memory;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::{Error, Result};
use crate::model::task::{Task, TaskData, TaskId, TaskState};

pub use memory::MemoryDriver;

/// A claimed task not resolved within this window is presumed abandoned
/// and becomes claimable again.
pub const DEFAULT_LEASE_TIMEOUT: Duration = Duration::from_secs(10 * 60);

/// Message recorded on insert.
pub(crate) const MSG_CREATED: &str = "Created";
/// Message recorded when a task is claimed.
pub(crate) const MSG_ATTEMPTING: &str = "Attempting";

/// Queue backend.
#[async_trait]
pub trait Driver: Send + Sync {
    /// Name of the driver, for logs.
    fn name(&self) -> &'static str;

    /// Insert a new `READY` task.
    async fn add_task(
        &self,
        name: &str,
        key: &str,
        not_before: Option<DateTime<Utc>>,
        data: TaskData,
    ) -> Result<TaskId>;

    /// Most recently created task with this name. Read-only.
    async fn get_task(&self, name: &str) -> Result<Option<Task>>;

    /// Claim the eligible task with the earliest `last_attempted`.
    ///
    /// Selection and claim happen in one atomic step; two concurrent calls
    /// never return the same task. `Ok(None)` means nothing is eligible.
    async fn pop(&self) -> Result<Option<Task>>;

    /// Move `RETRY` tasks last attempted at least `age` ago back to `READY`.
    /// Returns the number of tasks refreshed.
    async fn refresh_retry(&self, age: Duration) -> Result<u64>;

    /// Mark a claimed task as done.
    async fn complete(&self, id: TaskId, message: &str) -> Result<()> {
        self.transition(id, TaskState::Done, message).await
    }

    /// Cancel a task that has not finished.
    async fn cancel(&self, id: TaskId, message: &str) -> Result<()> {
        self.transition(id, TaskState::Cancelled, message).await
    }

    /// Mark a claimed task as permanently failed.
    async fn fail(&self, id: TaskId, message: &str) -> Result<()> {
        self.transition(id, TaskState::Failed, message).await
    }

    /// Mark a claimed task for a later retry.
    async fn retry(&self, id: TaskId, message: &str) -> Result<()> {
        self.transition(id, TaskState::Retry, message).await
    }

    /// Write a state transition with its message.
    ///
    /// Fails with [`Error::InvalidTransition`] and changes nothing if the
    /// task's current state may not move to `to`.
    async fn transition(&self, id: TaskId, to: TaskState, message: &str) -> Result<()>;

    /// Number of rows in the queue, in any state.
    async fn queue_length(&self) -> Result<i64>;

    /// Remove every task. Generally tasks should be cancelled instead.
    async fn clear(&self) -> Result<()>;
}

/// Convert a std duration into a chrono one for timestamp arithmetic.
pub(crate) fn chrono_duration(d: Duration) -> Result<chrono::Duration> {
    chrono::Duration::from_std(d).map_err(|e| Error::Other(format!("duration out of range: {e}")))
}

//! In-process driver.
//!
//! Same claim semantics as the Postgres driver, with a single lock standing
//! in for the database's row locking. Useful for tests and for embedding
//! the sync manager without a database.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use opentelemetry::KeyValue;
use parking_lot::Mutex;

use super::{DEFAULT_LEASE_TIMEOUT, Driver, MSG_ATTEMPTING, MSG_CREATED, chrono_duration};
use crate::error::{Error, Result};
use crate::model::task::{Task, TaskData, TaskId, TaskState};
use crate::telemetry::metrics;

/// Driver holding the queue in memory.
pub struct MemoryDriver {
    tasks: Mutex<Vec<Task>>,
    lease_timeout: Duration,
}

impl Default for MemoryDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryDriver {
    pub fn new() -> Self {
        Self::with_lease_timeout(DEFAULT_LEASE_TIMEOUT)
    }

    /// Create a driver that reclaims unfinished tasks after `lease_timeout`.
    pub fn with_lease_timeout(lease_timeout: Duration) -> Self {
        Self {
            tasks: Mutex::new(Vec::new()),
            lease_timeout,
        }
    }

    /// Snapshot of a task by id.
    pub fn task(&self, id: TaskId) -> Option<Task> {
        self.tasks.lock().iter().find(|t| t.id == id).cloned()
    }

    /// Snapshot of every task, in insertion order.
    pub fn tasks(&self) -> Vec<Task> {
        self.tasks.lock().clone()
    }
}

fn is_eligible(task: &Task, now: DateTime<Utc>, stale_before: DateTime<Utc>) -> bool {
    let claimable = match task.state {
        TaskState::Ready => true,
        TaskState::InProgress | TaskState::Retry => task.last_attempted < stale_before,
        TaskState::Done | TaskState::Failed | TaskState::Cancelled => false,
    };
    claimable && task.not_before.is_none_or(|at| at <= now)
}

#[async_trait]
impl Driver for MemoryDriver {
    fn name(&self) -> &'static str {
        "MemoryDriver"
    }

    async fn add_task(
        &self,
        name: &str,
        key: &str,
        not_before: Option<DateTime<Utc>>,
        data: TaskData,
    ) -> Result<TaskId> {
        let now = Utc::now();
        let id = TaskId::new();
        self.tasks.lock().push(Task {
            id,
            key: key.to_string(),
            name: name.to_string(),
            data,
            created_at: now,
            not_before,
            state: TaskState::Ready,
            last_attempted: now,
            last_attempt_message: Some(MSG_CREATED.to_string()),
        });

        metrics::tasks_enqueued().add(1, &[KeyValue::new("task_name", name.to_string())]);
        Ok(id)
    }

    async fn get_task(&self, name: &str) -> Result<Option<Task>> {
        let tasks = self.tasks.lock();
        // max_by_key keeps the last maximum, so later inserts win ties.
        Ok(tasks
            .iter()
            .filter(|t| t.name == name)
            .max_by_key(|t| t.created_at)
            .cloned())
    }

    async fn pop(&self) -> Result<Option<Task>> {
        let now = Utc::now();
        let stale_before = now - chrono_duration(self.lease_timeout)?;

        let claimed = {
            let mut tasks = self.tasks.lock();
            tasks
                .iter_mut()
                .filter(|t| is_eligible(t, now, stale_before))
                .min_by_key(|t| (t.last_attempted, t.created_at, t.id))
                .map(|task| {
                    task.state = TaskState::InProgress;
                    task.last_attempted = now;
                    task.last_attempt_message = Some(MSG_ATTEMPTING.to_string());
                    task.clone()
                })
        };

        metrics::task_claims().add(
            1,
            &[KeyValue::new(
                "result",
                if claimed.is_some() { "claimed" } else { "empty" },
            )],
        );
        Ok(claimed)
    }

    async fn refresh_retry(&self, age: Duration) -> Result<u64> {
        let now = Utc::now();
        let cutoff = now - chrono_duration(age)?;

        let mut refreshed = 0;
        for task in self
            .tasks
            .lock()
            .iter_mut()
            .filter(|t| t.state == TaskState::Retry && t.last_attempted <= cutoff)
        {
            task.state = TaskState::Ready;
            task.last_attempted = now;
            refreshed += 1;
        }

        if refreshed > 0 {
            metrics::task_state_transitions()
                .add(refreshed, &[KeyValue::new("to", TaskState::Ready.as_str())]);
        }
        Ok(refreshed)
    }

    async fn transition(&self, id: TaskId, to: TaskState, message: &str) -> Result<()> {
        let mut tasks = self.tasks.lock();
        let task = tasks
            .iter_mut()
            .find(|t| t.id == id)
            .ok_or_else(|| Error::NotFound(format!("task {id}")))?;

        if !task.state.can_transition_to(to) {
            return Err(Error::InvalidTransition {
                id,
                from: Some(task.state),
                to,
            });
        }

        task.state = to;
        task.last_attempted = Utc::now();
        task.last_attempt_message = Some(message.to_string());
        drop(tasks);

        metrics::task_state_transitions().add(1, &[KeyValue::new("to", to.as_str())]);
        Ok(())
    }

    async fn queue_length(&self) -> Result<i64> {
        Ok(self.tasks.lock().len() as i64)
    }

    async fn clear(&self) -> Result<()> {
        self.tasks.lock().clear();
        Ok(())
    }
}

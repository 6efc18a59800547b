//! Producer façade over the queue driver.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::debug;

use crate::driver::Driver;
use crate::error::Result;
use crate::model::task::{TaskId, task_data_from_value};

/// Used by clients that only put work on the queue.
#[derive(Clone)]
pub struct TaskManager {
    driver: Arc<dyn Driver>,
}

impl TaskManager {
    pub fn new(driver: Arc<dyn Driver>) -> Self {
        Self { driver }
    }

    /// Add a task to the queue.
    ///
    /// `data` must serialize to a JSON object (or null, for no data). The
    /// task cannot be claimed before `not_before` when one is given.
    pub async fn add_task<T: Serialize + ?Sized>(
        &self,
        name: &str,
        key: &str,
        not_before: Option<DateTime<Utc>>,
        data: &T,
    ) -> Result<TaskId> {
        let data = task_data_from_value(serde_json::to_value(data)?)?;
        let id = self.driver.add_task(name, key, not_before, data).await?;
        debug!(task_id = %id, task_name = name, task_key = key, "task added");
        Ok(id)
    }
}

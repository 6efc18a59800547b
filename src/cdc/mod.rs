//! Change data capture.
//!
//! A controller watches a source query yielding `(object_id, hash)` pairs.
//! Each run compares them with the hashes recorded on the previous run:
//! objects only in the source are created, objects only in the record are
//! deleted, objects whose hash moved are updated. Once the handler accepts
//! a change the record is brought up to date, so the next run starts from a
//! consistent baseline.

pub mod memory;
pub mod registry;

use std::sync::Arc;

use async_trait::async_trait;
use opentelemetry::KeyValue;
use tracing::{debug, info};
use uuid::Uuid;

use crate::action::ScheduledAction;
use crate::error::Result;
use crate::manager::TaskManager;
use crate::model::cdc::{Change, ChangeKind};
use crate::telemetry::metrics;

pub use memory::MemoryHashStore;
pub use registry::{ControllerConfig, ControllerRegistry};

/// Runs processed per invocation unless configured otherwise.
pub const DEFAULT_BATCH_SIZE: usize = 100;

/// Source of desired state plus the hashes recorded for it.
#[async_trait]
pub trait HashStore: Send + Sync {
    /// Up to `limit` differences between the source and the hashes recorded
    /// for `controller_id`, in no particular order.
    async fn diff(&self, controller_id: Uuid, limit: usize) -> Result<Vec<Change>>;

    /// Record `hash` as the current hash of an object.
    async fn upsert(&self, controller_id: Uuid, object_id: &str, hash: &str) -> Result<()>;

    /// Forget an object, if its recorded hash is still `hash`.
    async fn remove(&self, controller_id: Uuid, object_id: &str, hash: &str) -> Result<()>;
}

/// Callbacks applying changes downstream. Returning an error leaves the
/// recorded hash untouched, so the change comes back on a later run.
#[async_trait]
pub trait ChangeHandler: Send + Sync {
    async fn create(&self, change: &Change) -> Result<()>;
    async fn update(&self, change: &Change) -> Result<()>;
    async fn delete(&self, change: &Change) -> Result<()>;
}

/// Scheduled action running one CDC controller.
pub struct CdcAction {
    controller_id: Uuid,
    store: Arc<dyn HashStore>,
    handler: Arc<dyn ChangeHandler>,
    batch_size: usize,
}

impl CdcAction {
    pub fn new(
        controller_id: Uuid,
        store: Arc<dyn HashStore>,
        handler: Arc<dyn ChangeHandler>,
    ) -> Self {
        Self {
            controller_id,
            store,
            handler,
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }

    /// Handle at most `n` changes per run.
    pub fn with_batch_size(mut self, n: usize) -> Self {
        self.batch_size = n.max(1);
        self
    }

    pub fn controller_id(&self) -> Uuid {
        self.controller_id
    }

    /// Fetch one batch of changes and apply them in turn. Stops at the first
    /// failure. Returns how many changes were applied.
    pub async fn sync_once(&self) -> Result<usize> {
        let changes = self.store.diff(self.controller_id, self.batch_size).await?;
        if changes.is_empty() {
            return Ok(0);
        }

        debug!(
            controller_id = %self.controller_id,
            count = changes.len(),
            "objects retrieved for sync"
        );

        for change in &changes {
            self.apply(change).await?;
        }

        info!(
            controller_id = %self.controller_id,
            applied = changes.len(),
            "cdc batch applied"
        );
        Ok(changes.len())
    }

    async fn apply(&self, change: &Change) -> Result<()> {
        debug!(
            object_id = %change.object_id,
            hash = %change.hash,
            kind = %change.kind,
            "applying change"
        );

        match change.kind {
            ChangeKind::Create => self.handler.create(change).await?,
            ChangeKind::Update => self.handler.update(change).await?,
            ChangeKind::Delete => self.handler.delete(change).await?,
        }

        match change.kind {
            ChangeKind::Create | ChangeKind::Update => {
                self.store
                    .upsert(self.controller_id, &change.object_id, &change.hash)
                    .await?
            }
            ChangeKind::Delete => {
                self.store
                    .remove(self.controller_id, &change.object_id, &change.hash)
                    .await?
            }
        }

        metrics::cdc_changes().add(
            1,
            &[
                KeyValue::new("controller_id", self.controller_id.to_string()),
                KeyValue::new("kind", change.kind.as_str()),
            ],
        );
        Ok(())
    }
}

#[async_trait]
impl ScheduledAction for CdcAction {
    async fn run(&self) -> Result<()> {
        self.sync_once().await.map(|_| ())
    }

    /// Runs for one controller never overlap.
    fn stream(&self) -> String {
        self.controller_id.to_string()
    }
}

/// Change handler feeding the task queue: each change becomes a task named
/// `{prefix}.create`, `{prefix}.update` or `{prefix}.delete`, keyed by the
/// object id, with the change itself as data.
#[derive(Clone)]
pub struct EnqueueHandler {
    tasks: TaskManager,
    prefix: String,
}

impl EnqueueHandler {
    pub fn new(tasks: TaskManager, prefix: impl Into<String>) -> Self {
        Self {
            tasks,
            prefix: prefix.into(),
        }
    }

    /// Task name used for a change kind.
    pub fn task_name(&self, kind: ChangeKind) -> String {
        format!("{}.{}", self.prefix, kind.as_str().to_ascii_lowercase())
    }

    async fn enqueue(&self, change: &Change) -> Result<()> {
        self.tasks
            .add_task(&self.task_name(change.kind), &change.object_id, None, change)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl ChangeHandler for EnqueueHandler {
    async fn create(&self, change: &Change) -> Result<()> {
        self.enqueue(change).await
    }

    async fn update(&self, change: &Change) -> Result<()> {
        self.enqueue(change).await
    }

    async fn delete(&self, change: &Change) -> Result<()> {
        self.enqueue(change).await
    }
}

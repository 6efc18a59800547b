//! Core data model: queued tasks and change-data-capture decisions.

pub mod cdc;
pub mod task;

pub use cdc::{Change, ChangeKind};
pub use task::{Task, TaskData, TaskId, TaskState};

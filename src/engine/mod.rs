//! Sync engine: queue polling, task dispatch, scheduled actions on streams.

pub mod stream;
pub mod sync;

use std::sync::Arc;

use parking_lot::RwLock;

use crate::error::Error;

pub use sync::{SyncConfig, SyncManager};

/// Receives every non-fatal failure raised inside the sync loop.
pub type ErrorHandler = Arc<dyn Fn(&Error) + Send + Sync>;

/// Handler slot shared by the loop and the stream workers, swappable at
/// runtime.
#[derive(Clone)]
pub(crate) struct ErrorSink(Arc<RwLock<ErrorHandler>>);

impl ErrorSink {
    pub(crate) fn new() -> Self {
        Self(Arc::new(RwLock::new(default_error_handler())))
    }

    pub(crate) fn set(&self, handler: ErrorHandler) {
        *self.0.write() = handler;
    }

    pub(crate) fn report(&self, err: Error) {
        // Clone out so a handler that swaps the slot cannot deadlock.
        let handler = Arc::clone(&self.0.read());
        handler(&err);
    }
}

/// Log and carry on.
pub fn default_error_handler() -> ErrorHandler {
    Arc::new(|err: &Error| tracing::error!(error = %err, "sync error"))
}

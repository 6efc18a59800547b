//! Sync manager: the one loop that polls the queue, dispatches claimed tasks
//! to their handlers and hands scheduled actions to their streams.
//!
//! The manager holds no durable state. A restart loses armed timers, never
//! queued work.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use opentelemetry::KeyValue;
use parking_lot::{Mutex, RwLock};
use tokio::sync::{Notify, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{Instrument, debug, info};

use super::stream::{ScheduledRun, StreamPool};
use super::{ErrorHandler, ErrorSink};
use crate::action::{ScheduledAction, TaskAction, TaskOutcome};
use crate::driver::Driver;
use crate::error::{Error, Result};
use crate::model::task::{Task, TaskState};
use crate::telemetry::metrics;
use crate::telemetry::task::{record_state_transition, start_task_span};

/// Configuration for the sync loop.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Delay between queue polls. Must be non-zero.
    pub poll_interval: Duration,
    /// Minimum delay between two `refresh_retry` calls. Zero refreshes on
    /// every poll.
    pub refresh_interval: Duration,
    /// How long a `RETRY` task waits before it is made ready again.
    pub retry_age: Duration,
    /// Poll the queue at all. A manager without task handlers can turn this
    /// off and only run scheduled actions.
    pub dispatch_tasks: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            refresh_interval: Duration::from_secs(4),
            retry_age: Duration::from_secs(60 * 60),
            dispatch_tasks: true,
        }
    }
}

type Schedule = (Arc<dyn ScheduledAction>, Duration);

/// The central process for running actions.
pub struct SyncManager {
    driver: Arc<dyn Driver>,
    config: SyncConfig,
    handlers: RwLock<HashMap<String, Arc<dyn TaskAction>>>,
    errors: ErrorSink,
    streams: StreamPool,
    action_tx: mpsc::UnboundedSender<ScheduledRun>,
    action_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<ScheduledRun>>,
    timers: Mutex<Vec<JoinHandle<()>>>,
    /// Schedules registered outside a runtime, armed when `run` starts.
    pending: Mutex<Vec<Schedule>>,
    shutdown: Notify,
}

impl SyncManager {
    /// Fails with [`Error::Config`] if `config.poll_interval` is zero.
    pub fn new(driver: Arc<dyn Driver>, config: SyncConfig) -> Result<Self> {
        if config.poll_interval.is_zero() {
            return Err(Error::Config("poll interval must be non-zero".to_string()));
        }

        let errors = ErrorSink::new();
        let (action_tx, action_rx) = mpsc::unbounded_channel();
        Ok(Self {
            driver,
            config,
            handlers: RwLock::new(HashMap::new()),
            streams: StreamPool::new(errors.clone()),
            errors,
            action_tx,
            action_rx: tokio::sync::Mutex::new(action_rx),
            timers: Mutex::new(Vec::new()),
            pending: Mutex::new(Vec::new()),
            shutdown: Notify::new(),
        })
    }

    /// Route tasks named `task_name` to `handler`, replacing any previous one.
    pub fn register_task_handler(
        &self,
        handler: Arc<dyn TaskAction>,
        task_name: &str,
    ) -> Result<()> {
        if task_name.is_empty() {
            return Err(Error::Config("task name cannot be empty".to_string()));
        }
        self.handlers
            .write()
            .insert(task_name.to_string(), handler);
        debug!(task_name, "task handler registered");
        Ok(())
    }

    /// Is a handler registered for `task_name`?
    pub fn has_handler(&self, task_name: &str) -> bool {
        self.handlers.read().contains_key(task_name)
    }

    fn handler(&self, task_name: &str) -> Option<Arc<dyn TaskAction>> {
        self.handlers.read().get(task_name).cloned()
    }

    /// Replace the handler receiving errors from the loop and stream workers.
    pub fn set_error_handler<F>(&self, handler: F)
    where
        F: Fn(&Error) + Send + Sync + 'static,
    {
        self.errors.set(Arc::new(handler) as ErrorHandler);
    }

    /// Run `action` every `period`, first after one period has elapsed.
    ///
    /// Inside a tokio runtime the timer starts now and its ticks wait on the
    /// loop until `run` is going. Outside one, the timer starts with `run`.
    pub fn schedule(&self, action: Arc<dyn ScheduledAction>, period: Duration) {
        if period.is_zero() {
            self.errors.report(Error::Config(format!(
                "cannot schedule action on stream {} with a zero period",
                action.stream()
            )));
            return;
        }

        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => self.arm(&runtime, action, period),
            Err(_) => self.pending.lock().push((action, period)),
        }
    }

    fn arm(
        &self,
        runtime: &tokio::runtime::Handle,
        action: Arc<dyn ScheduledAction>,
        period: Duration,
    ) {
        let tx = self.action_tx.clone();
        let queued = Arc::new(AtomicBool::new(false));
        let handle = runtime.spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                // A run is already waiting; skip this tick.
                if queued.swap(true, Ordering::AcqRel) {
                    continue;
                }
                let run = ScheduledRun {
                    action: Arc::clone(&action),
                    queued: Arc::clone(&queued),
                };
                if tx.send(run).is_err() {
                    break;
                }
            }
        });
        self.timers.lock().push(handle);
    }

    /// Ask the loop to stop. Takes effect on the loop's next iteration; a
    /// handler already running is not interrupted.
    pub fn stop(&self) {
        self.shutdown.notify_one();
    }

    /// Number of distinct streams whose worker has been started. Keeps
    /// counting after `run` returns.
    pub fn stream_count(&self) -> usize {
        self.streams.len()
    }

    /// Run the loop until [`stop`](Self::stop) is called.
    ///
    /// Errors never end the loop; they go to the error handler.
    pub async fn run(&self) {
        let mut actions = self.action_rx.lock().await;

        let pending: Vec<Schedule> = self.pending.lock().drain(..).collect();
        if !pending.is_empty() {
            let runtime = tokio::runtime::Handle::current();
            for (action, period) in pending {
                self.arm(&runtime, action, period);
            }
        }

        let mut poll = tokio::time::interval(self.config.poll_interval);
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut refreshed = Instant::now();

        info!(
            driver = self.driver.name(),
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            dispatch_tasks = self.config.dispatch_tasks,
            "sync manager started"
        );

        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.notified() => {
                    info!("sync manager shutting down");
                    break;
                }
                Some(run) = actions.recv() => {
                    self.streams.dispatch(run);
                }
                _ = poll.tick(), if self.config.dispatch_tasks => {
                    self.poll_queue(&mut refreshed).await;
                }
            }
        }

        for timer in self.timers.lock().drain(..) {
            timer.abort();
        }
        self.streams.close();
    }

    /// Refresh retries when due, then claim and dispatch at most one task.
    ///
    /// Dispatch is awaited before returning, so the loop never polls again
    /// while a task is in flight.
    async fn poll_queue(&self, refreshed: &mut Instant) {
        if refreshed.elapsed() >= self.config.refresh_interval {
            match self.driver.refresh_retry(self.config.retry_age).await {
                Ok(0) => {}
                Ok(count) => debug!(count, "retry tasks made ready"),
                Err(e) => self.errors.report(e),
            }
            *refreshed = Instant::now();
        }

        match self.driver.pop().await {
            Ok(Some(task)) => self.dispatch_task(task).await,
            Ok(None) => {}
            Err(e) => self.errors.report(e),
        }
    }

    /// Hand a claimed task to its handler and record the outcome.
    pub async fn dispatch_task(&self, task: Task) {
        let span = start_task_span(&task.name, &task.id);

        async {
            let Some(handler) = self.handler(&task.name) else {
                // Unroutable tasks stay unroutable until a deploy, so retrying
                // them is wasted work.
                metrics::task_unroutable()
                    .add(1, &[KeyValue::new("task_name", task.name.clone())]);
                let err = Error::Unroutable {
                    id: task.id,
                    name: task.name.clone(),
                };
                record_state_transition(&span, TaskState::InProgress, TaskState::Cancelled);
                if let Err(e) = self.driver.cancel(task.id, &err.to_string()).await {
                    self.errors.report(e);
                }
                self.errors.report(err);
                return;
            };

            let start = std::time::Instant::now();
            let claimed = task.clone();
            let outcome = match tokio::spawn(async move { handler.handle(&claimed).await }).await {
                Ok(outcome) => outcome,
                Err(e) => TaskOutcome::retry(format!("handler aborted: {e}")),
            };
            let duration_ms = start.elapsed().as_millis() as u64;
            metrics::operation_duration_ms()
                .record(duration_ms as f64, &[KeyValue::new("operation", "task.handle")]);

            let result = match outcome {
                TaskOutcome::Success(message) => {
                    record_state_transition(&span, TaskState::InProgress, TaskState::Done);
                    info!(task_id = %task.id, duration_ms, "task completed");
                    self.driver.complete(task.id, &message).await
                }
                TaskOutcome::PermanentFailure(message) => {
                    record_state_transition(&span, TaskState::InProgress, TaskState::Failed);
                    let result = self.driver.fail(task.id, &message).await;
                    self.errors.report(Error::TaskFailed {
                        id: task.id,
                        name: task.name.clone(),
                        message,
                        retryable: false,
                    });
                    result
                }
                TaskOutcome::RetryableFailure(message) => {
                    record_state_transition(&span, TaskState::InProgress, TaskState::Retry);
                    let result = self.driver.retry(task.id, &message).await;
                    self.errors.report(Error::TaskFailed {
                        id: task.id,
                        name: task.name.clone(),
                        message,
                        retryable: true,
                    });
                    result
                }
            };

            if let Err(e) = result {
                self.errors.report(e);
            }
        }
        .instrument(span.clone())
        .await
    }
}

impl Drop for SyncManager {
    fn drop(&mut self) {
        for timer in self.timers.get_mut().drain(..) {
            timer.abort();
        }
    }
}

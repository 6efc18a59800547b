//! Sync manager behaviour against the in-memory driver.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use syncq::action::{ScheduledAction, TaskAction, TaskOutcome};
use syncq::driver::{Driver, MemoryDriver};
use syncq::engine::{SyncConfig, SyncManager};
use syncq::error::{Error, Result};
use syncq::model::{Task, TaskData, TaskState};

fn fast_config() -> SyncConfig {
    SyncConfig {
        poll_interval: Duration::from_millis(10),
        refresh_interval: Duration::from_millis(20),
        retry_age: Duration::from_secs(3600),
        dispatch_tasks: true,
    }
}

/// Poll `check` until it holds or two seconds pass.
async fn wait_until(mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    check()
}

/// Collects everything sent to the error handler.
fn capture_errors(manager: &SyncManager) -> Arc<Mutex<Vec<String>>> {
    let errors = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&errors);
    manager.set_error_handler(move |e: &Error| sink.lock().push(e.to_string()));
    errors
}

fn start(manager: &Arc<SyncManager>) -> tokio::task::JoinHandle<()> {
    let manager = Arc::clone(manager);
    tokio::spawn(async move { manager.run().await })
}

async fn stop(manager: &Arc<SyncManager>, handle: tokio::task::JoinHandle<()>) {
    manager.stop();
    tokio::time::timeout(Duration::from_secs(2), handle)
        .await
        .expect("sync loop did not stop")
        .unwrap();
}

struct Fixed(TaskOutcome);

#[async_trait]
impl TaskAction for Fixed {
    async fn handle(&self, _task: &Task) -> TaskOutcome {
        self.0.clone()
    }
}

struct Panics;

#[async_trait]
impl TaskAction for Panics {
    async fn handle(&self, _task: &Task) -> TaskOutcome {
        panic!("handler blew up");
    }
}

// ---------------------------------------------------------------------------
// Lifecycle
// ---------------------------------------------------------------------------

#[tokio::test]
async fn run_returns_after_stop() {
    let manager = Arc::new(SyncManager::new(
        Arc::new(MemoryDriver::new()),
        fast_config(),
    ).unwrap());
    let handle = start(&manager);
    tokio::time::sleep(Duration::from_millis(30)).await;
    stop(&manager, handle).await;
}

#[tokio::test]
async fn stop_before_run_is_not_lost() {
    let manager = Arc::new(SyncManager::new(
        Arc::new(MemoryDriver::new()),
        fast_config(),
    ).unwrap());
    manager.stop();
    tokio::time::timeout(Duration::from_secs(2), manager.run())
        .await
        .expect("sync loop ignored an early stop");
}

#[tokio::test]
async fn empty_task_name_is_rejected() {
    let manager = SyncManager::new(Arc::new(MemoryDriver::new()), fast_config()).unwrap();
    let result = manager.register_task_handler(Arc::new(Fixed(TaskOutcome::success("ok"))), "");
    assert!(matches!(result, Err(Error::Config(_))));

    manager
        .register_task_handler(Arc::new(Fixed(TaskOutcome::success("ok"))), "email")
        .unwrap();
    assert!(manager.has_handler("email"));
    assert!(!manager.has_handler("sms"));
}

// ---------------------------------------------------------------------------
// Task dispatch
// ---------------------------------------------------------------------------

#[tokio::test]
async fn successful_task_is_completed() {
    let driver = Arc::new(MemoryDriver::new());
    let manager = Arc::new(SyncManager::new(driver.clone(), fast_config()).unwrap());
    manager
        .register_task_handler(Arc::new(Fixed(TaskOutcome::success("sent"))), "email")
        .unwrap();
    let errors = capture_errors(&manager);

    let id = driver
        .add_task("email", "user-1", None, TaskData::new())
        .await
        .unwrap();

    let handle = start(&manager);
    assert!(wait_until(|| driver.task(id).unwrap().state == TaskState::Done).await);
    stop(&manager, handle).await;

    let task = driver.task(id).unwrap();
    assert_eq!(task.last_attempt_message.as_deref(), Some("sent"));
    assert!(errors.lock().is_empty());
}

#[tokio::test]
async fn unroutable_task_is_cancelled_once() {
    let driver = Arc::new(MemoryDriver::new());
    let manager = Arc::new(SyncManager::new(driver.clone(), fast_config()).unwrap());
    let errors = capture_errors(&manager);

    let id = driver
        .add_task("nobody.handles.this", "k", None, TaskData::new())
        .await
        .unwrap();

    let handle = start(&manager);
    assert!(wait_until(|| driver.task(id).unwrap().state == TaskState::Cancelled).await);
    // Give the loop a few more polls to prove the task stays put.
    tokio::time::sleep(Duration::from_millis(60)).await;
    stop(&manager, handle).await;

    let errors = errors.lock();
    assert_eq!(errors.len(), 1, "errors: {errors:?}");
    assert!(errors[0].contains("no action to handle"));

    let task = driver.task(id).unwrap();
    assert_eq!(task.state, TaskState::Cancelled);
    assert!(
        task.last_attempt_message
            .as_deref()
            .is_some_and(|m| m.contains("nobody.handles.this"))
    );
}

#[tokio::test]
async fn retryable_failure_parks_task_in_retry() {
    let driver = Arc::new(MemoryDriver::new());
    let manager = SyncManager::new(driver.clone(), fast_config()).unwrap();
    manager
        .register_task_handler(Arc::new(Fixed(TaskOutcome::retry("busy"))), "sync")
        .unwrap();
    let errors = capture_errors(&manager);

    let id = driver
        .add_task("sync", "k", None, TaskData::new())
        .await
        .unwrap();
    let task = driver.pop().await.unwrap().unwrap();
    manager.dispatch_task(task).await;

    let task = driver.task(id).unwrap();
    assert_eq!(task.state, TaskState::Retry);
    assert_eq!(task.last_attempt_message.as_deref(), Some("busy"));
    assert!(driver.pop().await.unwrap().is_none());

    let errors = errors.lock();
    assert_eq!(errors.len(), 1);
    assert!(errors[0].contains("retryable: true"));
}

#[tokio::test]
async fn permanent_failure_fails_task() {
    let driver = Arc::new(MemoryDriver::new());
    let manager = SyncManager::new(driver.clone(), fast_config()).unwrap();
    manager
        .register_task_handler(Arc::new(Fixed(TaskOutcome::permanent("bad input"))), "sync")
        .unwrap();
    let errors = capture_errors(&manager);

    let id = driver
        .add_task("sync", "k", None, TaskData::new())
        .await
        .unwrap();
    let task = driver.pop().await.unwrap().unwrap();
    manager.dispatch_task(task).await;

    assert_eq!(driver.task(id).unwrap().state, TaskState::Failed);
    assert_eq!(driver.refresh_retry(Duration::ZERO).await.unwrap(), 0);

    let errors = errors.lock();
    assert_eq!(errors.len(), 1);
    assert!(errors[0].contains("retryable: false"));
}

#[tokio::test]
async fn panicking_handler_is_retried() {
    let driver = Arc::new(MemoryDriver::new());
    let manager = SyncManager::new(driver.clone(), fast_config()).unwrap();
    manager
        .register_task_handler(Arc::new(Panics), "explode")
        .unwrap();
    let errors = capture_errors(&manager);

    let id = driver
        .add_task("explode", "k", None, TaskData::new())
        .await
        .unwrap();
    let task = driver.pop().await.unwrap().unwrap();
    manager.dispatch_task(task).await;

    assert_eq!(driver.task(id).unwrap().state, TaskState::Retry);
    assert_eq!(errors.lock().len(), 1);
}

#[tokio::test]
async fn retried_task_comes_back_after_refresh() {
    let driver = Arc::new(MemoryDriver::new());
    let config = SyncConfig {
        retry_age: Duration::ZERO,
        ..fast_config()
    };
    let manager = Arc::new(SyncManager::new(driver.clone(), config).unwrap());

    let attempts = Arc::new(AtomicUsize::new(0));
    struct Flaky(Arc<AtomicUsize>);
    #[async_trait]
    impl TaskAction for Flaky {
        async fn handle(&self, _task: &Task) -> TaskOutcome {
            if self.0.fetch_add(1, Ordering::SeqCst) == 0 {
                TaskOutcome::retry("first try fails")
            } else {
                TaskOutcome::success("second try works")
            }
        }
    }
    manager
        .register_task_handler(Arc::new(Flaky(attempts.clone())), "flaky")
        .unwrap();
    capture_errors(&manager);

    let id = driver
        .add_task("flaky", "k", None, TaskData::new())
        .await
        .unwrap();

    let handle = start(&manager);
    assert!(wait_until(|| driver.task(id).unwrap().state == TaskState::Done).await);
    stop(&manager, handle).await;
    assert_eq!(attempts.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn dispatch_disabled_leaves_queue_alone() {
    let driver = Arc::new(MemoryDriver::new());
    let config = SyncConfig {
        dispatch_tasks: false,
        ..fast_config()
    };
    let manager = Arc::new(SyncManager::new(driver.clone(), config).unwrap());
    let id = driver
        .add_task("email", "k", None, TaskData::new())
        .await
        .unwrap();

    let handle = start(&manager);
    tokio::time::sleep(Duration::from_millis(60)).await;
    stop(&manager, handle).await;

    assert_eq!(driver.task(id).unwrap().state, TaskState::Ready);
}

// ---------------------------------------------------------------------------
// Scheduled actions and streams
// ---------------------------------------------------------------------------

/// Sleeps while tracking how many runs overlap.
struct Tracked {
    stream: String,
    runs: Arc<AtomicUsize>,
    active: Arc<AtomicUsize>,
    max_active: Arc<AtomicUsize>,
    hold: Duration,
}

#[async_trait]
impl ScheduledAction for Tracked {
    async fn run(&self) -> Result<()> {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(self.hold).await;
        self.active.fetch_sub(1, Ordering::SeqCst);
        self.runs.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn stream(&self) -> String {
        self.stream.clone()
    }
}

struct Counters {
    runs: Arc<AtomicUsize>,
    active: Arc<AtomicUsize>,
    max_active: Arc<AtomicUsize>,
}

impl Counters {
    fn new() -> Self {
        Self {
            runs: Arc::new(AtomicUsize::new(0)),
            active: Arc::new(AtomicUsize::new(0)),
            max_active: Arc::new(AtomicUsize::new(0)),
        }
    }

    fn action(&self, stream: &str, hold: Duration) -> Arc<Tracked> {
        Arc::new(Tracked {
            stream: stream.to_string(),
            runs: self.runs.clone(),
            active: self.active.clone(),
            max_active: self.max_active.clone(),
            hold,
        })
    }
}

fn actions_only() -> SyncConfig {
    SyncConfig {
        dispatch_tasks: false,
        ..fast_config()
    }
}

#[tokio::test]
async fn scheduled_action_waits_one_period_then_repeats() {
    let manager = Arc::new(SyncManager::new(
        Arc::new(MemoryDriver::new()),
        actions_only(),
    ).unwrap());
    let counters = Counters::new();
    manager.schedule(counters.action("s", Duration::ZERO), Duration::from_millis(50));

    let handle = start(&manager);
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(counters.runs.load(Ordering::SeqCst), 0);

    assert!(wait_until(|| counters.runs.load(Ordering::SeqCst) >= 2).await);
    stop(&manager, handle).await;
    assert_eq!(manager.stream_count(), 1);
}

#[tokio::test]
async fn same_stream_actions_never_overlap() {
    let manager = Arc::new(SyncManager::new(
        Arc::new(MemoryDriver::new()),
        actions_only(),
    ).unwrap());
    let counters = Counters::new();
    let hold = Duration::from_millis(30);
    manager.schedule(counters.action("crm", hold), Duration::from_millis(10));
    manager.schedule(counters.action("crm", hold), Duration::from_millis(10));

    let handle = start(&manager);
    assert!(wait_until(|| counters.runs.load(Ordering::SeqCst) >= 4).await);
    stop(&manager, handle).await;

    assert_eq!(counters.max_active.load(Ordering::SeqCst), 1);
    assert_eq!(manager.stream_count(), 1);
}

#[tokio::test]
async fn different_streams_run_side_by_side() {
    let manager = Arc::new(SyncManager::new(
        Arc::new(MemoryDriver::new()),
        actions_only(),
    ).unwrap());
    let counters = Counters::new();
    let hold = Duration::from_millis(100);
    manager.schedule(counters.action("crm", hold), Duration::from_millis(10));
    manager.schedule(counters.action("billing", hold), Duration::from_millis(10));

    let handle = start(&manager);
    assert!(wait_until(|| counters.max_active.load(Ordering::SeqCst) >= 2).await);
    stop(&manager, handle).await;
    assert_eq!(manager.stream_count(), 2);
}

#[tokio::test]
async fn failing_action_is_reported_and_stream_survives() {
    struct Failing(Arc<AtomicUsize>);
    #[async_trait]
    impl ScheduledAction for Failing {
        async fn run(&self) -> Result<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Err(Error::Other("upstream down".to_string()))
        }
        fn stream(&self) -> String {
            "flaky".to_string()
        }
    }

    let manager = Arc::new(SyncManager::new(
        Arc::new(MemoryDriver::new()),
        actions_only(),
    ).unwrap());
    let errors = capture_errors(&manager);
    let runs = Arc::new(AtomicUsize::new(0));
    manager.schedule(Arc::new(Failing(runs.clone())), Duration::from_millis(10));

    let handle = start(&manager);
    assert!(wait_until(|| runs.load(Ordering::SeqCst) >= 3).await);
    stop(&manager, handle).await;

    assert!(wait_until(|| errors.lock().len() >= 3).await);
    assert!(errors.lock().iter().all(|e| e.contains("upstream down")));
}

#[tokio::test]
async fn zero_period_is_reported_not_scheduled() {
    let manager = SyncManager::new(Arc::new(MemoryDriver::new()), actions_only()).unwrap();
    let errors = capture_errors(&manager);
    let counters = Counters::new();

    manager.schedule(counters.action("s", Duration::ZERO), Duration::ZERO);

    assert_eq!(errors.lock().len(), 1);
    assert!(errors.lock()[0].contains("zero period"));
}

#[tokio::test]
async fn zero_poll_interval_is_rejected() {
    let config = SyncConfig {
        poll_interval: Duration::ZERO,
        ..fast_config()
    };
    let result = SyncManager::new(Arc::new(MemoryDriver::new()), config);
    assert!(matches!(result, Err(Error::Config(_))));
}

#[tokio::test]
async fn stop_does_not_interrupt_running_handler() {
    struct Slow;
    #[async_trait]
    impl TaskAction for Slow {
        async fn handle(&self, _task: &Task) -> TaskOutcome {
            tokio::time::sleep(Duration::from_millis(200)).await;
            TaskOutcome::success("finished")
        }
    }

    let driver = Arc::new(MemoryDriver::new());
    let manager = Arc::new(SyncManager::new(driver.clone(), fast_config()).unwrap());
    manager.register_task_handler(Arc::new(Slow), "slow").unwrap();

    let id = driver
        .add_task("slow", "k", None, TaskData::new())
        .await
        .unwrap();

    let handle = start(&manager);
    assert!(wait_until(|| driver.task(id).unwrap().state == TaskState::InProgress).await);
    stop(&manager, handle).await;

    let task = driver.task(id).unwrap();
    assert_eq!(task.state, TaskState::Done);
    assert_eq!(task.last_attempt_message.as_deref(), Some("finished"));
}

#[tokio::test]
async fn stream_count_survives_stop() {
    let manager = Arc::new(SyncManager::new(Arc::new(MemoryDriver::new()), actions_only()).unwrap());
    let counters = Counters::new();
    manager.schedule(counters.action("a", Duration::ZERO), Duration::from_millis(10));
    manager.schedule(counters.action("b", Duration::ZERO), Duration::from_millis(10));
    manager.schedule(counters.action("a", Duration::ZERO), Duration::from_millis(10));

    let handle = start(&manager);
    assert!(wait_until(|| counters.runs.load(Ordering::SeqCst) >= 6).await);
    assert_eq!(manager.stream_count(), 2);
    stop(&manager, handle).await;
    assert_eq!(manager.stream_count(), 2);
}

#[test]
fn schedule_outside_runtime_starts_with_run() {
    let manager = Arc::new(SyncManager::new(Arc::new(MemoryDriver::new()), actions_only()).unwrap());
    let counters = Counters::new();
    manager.schedule(counters.action("s", Duration::ZERO), Duration::from_millis(10));

    let runtime = tokio::runtime::Runtime::new().unwrap();
    runtime.block_on(async {
        let handle = start(&manager);
        assert!(wait_until(|| counters.runs.load(Ordering::SeqCst) >= 2).await);
        stop(&manager, handle).await;
    });
}

#[tokio::test]
async fn slow_action_does_not_build_a_backlog() {
    let manager = Arc::new(SyncManager::new(Arc::new(MemoryDriver::new()), actions_only()).unwrap());
    let counters = Counters::new();
    // Ten ticks per run: without coalescing the stream would queue them all.
    manager.schedule(
        counters.action("slow", Duration::from_millis(100)),
        Duration::from_millis(10),
    );

    let handle = start(&manager);
    assert!(wait_until(|| counters.runs.load(Ordering::SeqCst) >= 2).await);
    stop(&manager, handle).await;
    let at_stop = counters.runs.load(Ordering::SeqCst);

    // At most the run in flight and one queued run remain.
    tokio::time::sleep(Duration::from_millis(800)).await;
    assert!(counters.runs.load(Ordering::SeqCst) <= at_stop + 2);
}

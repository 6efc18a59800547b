//! Stream workers for scheduled actions.
//!
//! Each stream gets one long-lived worker reading from its own FIFO. The
//! worker runs one action to completion before taking the next, so two
//! actions on one stream never overlap while separate streams run side by
//! side. Useful when a remote system dislikes concurrent connections: put
//! every action that talks to it on one stream.
//!
//! Ticks coalesce: while a schedule already has a run waiting on its
//! stream, further ticks for it are dropped. An action slower than its
//! period therefore runs back to back instead of building a backlog.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use opentelemetry::KeyValue;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{Instrument, debug, info, info_span};

use super::ErrorSink;
use crate::action::ScheduledAction;
use crate::error::Error;
use crate::telemetry::metrics;

/// One pending run of a scheduled action.
pub(crate) struct ScheduledRun {
    pub(crate) action: Arc<dyn ScheduledAction>,
    /// Set while this schedule has a run queued; cleared when it starts.
    pub(crate) queued: Arc<AtomicBool>,
}

type RunSender = mpsc::UnboundedSender<ScheduledRun>;

#[derive(Default)]
struct Streams {
    senders: HashMap<String, RunSender>,
    started: HashSet<String>,
}

/// Lazily created workers, one per stream name.
pub(crate) struct StreamPool {
    streams: Mutex<Streams>,
    errors: ErrorSink,
}

impl StreamPool {
    pub(crate) fn new(errors: ErrorSink) -> Self {
        Self {
            streams: Mutex::new(Streams::default()),
            errors,
        }
    }

    /// Queue a run on its stream, starting the stream's worker on first
    /// use. Never blocks.
    pub(crate) fn dispatch(&self, run: ScheduledRun) {
        let name = run.action.stream();
        let mut guard = self.streams.lock();
        let streams = &mut *guard;

        let tx = streams.senders.entry(name.clone()).or_insert_with(|| {
            streams.started.insert(name.clone());
            spawn_worker(name.clone(), self.errors.clone())
        });

        // A worker only goes away if it was aborted; start a fresh one.
        if let Err(mpsc::error::SendError(run)) = tx.send(run) {
            let tx = spawn_worker(name.clone(), self.errors.clone());
            let _ = tx.send(run);
            streams.senders.insert(name, tx);
        }
    }

    /// Number of distinct streams started so far. Not reset by `close`.
    pub(crate) fn len(&self) -> usize {
        self.streams.lock().started.len()
    }

    /// Drop every sender. Workers finish what is already queued, then exit.
    pub(crate) fn close(&self) {
        self.streams.lock().senders.clear();
    }
}

fn spawn_worker(stream: String, errors: ErrorSink) -> RunSender {
    let (tx, rx) = mpsc::unbounded_channel();
    let span = info_span!("sync.stream", stream = %stream);
    tokio::spawn(run_stream(stream, rx, errors).instrument(span));
    tx
}

async fn run_stream(
    stream: String,
    mut rx: mpsc::UnboundedReceiver<ScheduledRun>,
    errors: ErrorSink,
) {
    info!(stream = %stream, "starting a new stream");

    while let Some(ScheduledRun { action, queued }) = rx.recv().await {
        queued.store(false, Ordering::Release);

        let start = Instant::now();
        // Run on its own task so a panicking action is reported instead of
        // taking the stream down.
        let result = match tokio::spawn(async move { action.run().await }).await {
            Ok(result) => result,
            Err(e) => Err(Error::Other(format!(
                "scheduled action on stream {stream} aborted: {e}"
            ))),
        };

        let duration_ms = start.elapsed().as_millis() as f64;
        metrics::scheduled_action_runs().add(
            1,
            &[
                KeyValue::new("stream", stream.clone()),
                KeyValue::new("result", if result.is_ok() { "ok" } else { "error" }),
            ],
        );
        metrics::operation_duration_ms().record(
            duration_ms,
            &[KeyValue::new("operation", "scheduled_action.run")],
        );

        if let Err(e) = result {
            errors.report(e);
        }
    }

    debug!(stream = %stream, "stream closed");
}

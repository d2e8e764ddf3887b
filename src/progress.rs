//! Non-blocking progress notifications
//!
//! Callbacks run on their own task behind a bounded channel. When the
//! callback falls behind, updates are dropped rather than stalling the
//! processing path.

use crate::results::UnitId;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::trace;

const FINISH_TIMEOUT: Duration = Duration::from_secs(5);

/// Snapshot sent after each chunk or batch completes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressUpdate {
    pub unit: UnitId,
    pub rows_done: usize,
    pub rows_failed: usize,
    pub total_rows: usize,
    pub units_done: usize,
}

impl ProgressUpdate {
    pub fn fraction(&self) -> f64 {
        if self.total_rows == 0 {
            1.0
        } else {
            (self.rows_done + self.rows_failed) as f64 / self.total_rows as f64
        }
    }
}

/// Caller-registered progress callback
pub type ProgressCallback = Arc<dyn Fn(&ProgressUpdate) + Send + Sync>;

/// Cloneable sending side of a [`ProgressReporter`]
#[derive(Debug, Clone, Default)]
pub struct ProgressSink {
    sender: Option<mpsc::Sender<ProgressUpdate>>,
    dropped: Arc<AtomicU64>,
}

impl ProgressSink {
    /// Queue an update; never waits
    pub fn report(&self, update: ProgressUpdate) {
        if let Some(sender) = &self.sender {
            if sender.try_send(update).is_err() {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                trace!("Progress callback lagging, update dropped");
            }
        }
    }
}

/// Delivers updates to a callback without blocking the sender
#[derive(Debug, Default)]
pub struct ProgressReporter {
    sink: ProgressSink,
    task: Option<JoinHandle<()>>,
}

impl ProgressReporter {
    /// A reporter that discards everything
    pub fn disabled() -> Self {
        Self::default()
    }

    /// Spawn the delivery task; must be called inside a tokio runtime
    pub fn spawn(callback: ProgressCallback, buffer: usize) -> Self {
        let (sender, mut receiver) = mpsc::channel::<ProgressUpdate>(buffer.max(1));
        let task = tokio::spawn(async move {
            while let Some(update) = receiver.recv().await {
                callback(&update);
            }
        });
        Self {
            sink: ProgressSink {
                sender: Some(sender),
                dropped: Arc::new(AtomicU64::new(0)),
            },
            task: Some(task),
        }
    }

    pub fn from_callback(callback: Option<ProgressCallback>, buffer: usize) -> Self {
        match callback {
            Some(callback) => Self::spawn(callback, buffer),
            None => Self::disabled(),
        }
    }

    /// Handle for the processing path
    pub fn sink(&self) -> ProgressSink {
        self.sink.clone()
    }

    pub fn report(&self, update: ProgressUpdate) {
        self.sink.report(update);
    }

    /// Updates dropped because the callback was slow
    pub fn dropped(&self) -> u64 {
        self.sink.dropped.load(Ordering::Relaxed)
    }

    /// Close the channel and wait for queued updates to be delivered
    ///
    /// Sinks handed out with [`sink`](Self::sink) keep the channel open; if
    /// any are still alive after `FINISH_TIMEOUT` the delivery task is
    /// aborted.
    pub async fn finish(mut self) {
        self.sink.sender.take();
        if let Some(mut task) = self.task.take() {
            if tokio::time::timeout(FINISH_TIMEOUT, &mut task).await.is_err() {
                task.abort();
            }
        }
    }
}

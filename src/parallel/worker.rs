//! Worker lifecycle
//!
//! Each worker is a tokio task draining its own unbounded job queue. What a
//! worker does with a job depends on its [`WorkerKind`]:
//!
//! - `Threaded` runs the job on tokio's blocking pool. Reducer panics are
//!   caught inside the job, so the worker survives them.
//! - `Isolated` runs each job on a fresh, named OS thread. A panic, a timeout
//!   or a kill is treated as the death of the worker: the in-flight job is
//!   handed back as crashed, queued jobs are returned, and the worker stays
//!   `Failed` until restarted.

use crate::cancel::CancelHandle;
use crate::config::ProcessingMode;
use crate::error::EngineError;
use crate::reducer::panic_message;
use crate::results::FailureKind;
use serde::{Deserialize, Serialize};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Execution flavor, resolved once when the pool starts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerKind {
    Threaded,
    Isolated,
}

impl WorkerKind {
    /// Resolve the configured mode against the dataset's estimated size
    pub fn resolve(mode: ProcessingMode, estimated_bytes: u64, threshold_bytes: u64) -> Self {
        match mode {
            ProcessingMode::Thread => WorkerKind::Threaded,
            ProcessingMode::Process => WorkerKind::Isolated,
            ProcessingMode::Auto if estimated_bytes > threshold_bytes => WorkerKind::Isolated,
            ProcessingMode::Auto => WorkerKind::Threaded,
        }
    }

    /// Whether reducer panics are caught inside the job
    pub fn catches_panics(self) -> bool {
        matches!(self, WorkerKind::Threaded)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    Idle,
    Busy,
    Failed,
    ShuttingDown,
}

impl WorkerStatus {
    pub fn accepts_work(self) -> bool {
        matches!(self, WorkerStatus::Idle | WorkerStatus::Busy)
    }
}

/// Snapshot of one worker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerState {
    pub worker_id: usize,
    pub kind: WorkerKind,
    pub status: WorkerStatus,
    /// Records queued or running on this worker
    pub pending_records: usize,
    pub completed_batches: u64,
    pub restarts: u32,
}

impl WorkerState {
    pub fn new(worker_id: usize, kind: WorkerKind) -> Self {
        Self {
            worker_id,
            kind,
            status: WorkerStatus::Idle,
            pending_records: 0,
            completed_batches: 0,
            restarts: 0,
        }
    }
}

/// Status table shared by the dispatcher and the workers
#[derive(Debug, Clone, Default)]
pub struct WorkerTable {
    inner: Arc<Mutex<Vec<WorkerState>>>,
}

impl WorkerTable {
    pub fn lock(&self) -> MutexGuard<'_, Vec<WorkerState>> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn snapshot(&self) -> Vec<WorkerState> {
        self.lock().clone()
    }

    /// Update a worker's status if it has not been restarted since `generation`
    fn set_status(
        &self,
        worker_id: usize,
        generation: u32,
        from: Option<WorkerStatus>,
        to: WorkerStatus,
    ) {
        let mut table = self.lock();
        if let Some(state) = table.get_mut(worker_id) {
            let current = state.restarts == generation;
            let expected = from.map_or(true, |from| state.status == from);
            if current && expected {
                state.status = to;
            }
        }
    }
}

/// Why a job did not complete on its worker
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Abandoned {
    /// The worker died while running the job
    Crashed { kind: FailureKind, message: String },
    /// The job never started; the worker died with it still queued
    Returned,
}

/// Type-erased unit of work sent to a worker
///
/// `run` reports its own result. `abandon` is called instead when the job
/// cannot finish on this worker.
pub struct Job {
    pub batch_id: u64,
    pub attempt: u32,
    pub run: Box<dyn FnOnce(bool) + Send + 'static>,
    pub abandon: Box<dyn FnOnce(Abandoned) + Send + 'static>,
}

impl std::fmt::Debug for Job {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Job")
            .field("batch_id", &self.batch_id)
            .field("attempt", &self.attempt)
            .finish()
    }
}

/// Handle the processor keeps for a running worker
#[derive(Debug)]
pub struct WorkerHandle {
    pub queue: mpsc::UnboundedSender<Job>,
    pub kill: CancelHandle,
    pub task: JoinHandle<()>,
}

impl WorkerHandle {
    /// Spawn a worker task for `worker_id` at the given restart generation
    pub fn spawn(
        worker_id: usize,
        generation: u32,
        kind: WorkerKind,
        table: WorkerTable,
        batch_timeout: Option<Duration>,
    ) -> Self {
        let (queue, jobs) = mpsc::unbounded_channel();
        let kill = CancelHandle::new();
        let worker = Worker {
            worker_id,
            generation,
            kind,
            table,
            batch_timeout,
            kill: kill.clone(),
        };
        let task = tokio::spawn(worker.run(jobs));
        Self { queue, kill, task }
    }
}

enum Exit {
    Done,
    Died { kind: FailureKind, message: String },
}

struct Worker {
    worker_id: usize,
    generation: u32,
    kind: WorkerKind,
    table: WorkerTable,
    batch_timeout: Option<Duration>,
    kill: CancelHandle,
}

impl Worker {
    async fn run(self, mut jobs: mpsc::UnboundedReceiver<Job>) {
        debug!(worker_id = self.worker_id, kind = ?self.kind, "Worker started");
        loop {
            let job = tokio::select! {
                biased;
                _ = self.kill.cancelled() => break,
                job = jobs.recv() => match job {
                    Some(job) => job,
                    None => {
                        debug!(worker_id = self.worker_id, "Worker queue closed");
                        return;
                    }
                },
            };

            self.set_status(Some(WorkerStatus::Idle), WorkerStatus::Busy);
            let Job {
                batch_id,
                attempt,
                run,
                abandon,
            } = job;

            match self.execute(run).await {
                Exit::Done => self.set_status(Some(WorkerStatus::Busy), WorkerStatus::Idle),
                Exit::Died { kind, message } => {
                    warn!(
                        worker_id = self.worker_id,
                        batch_id,
                        attempt,
                        %message,
                        "Worker died while running batch"
                    );
                    // Failed before the batch is handed back so it is not rescheduled here
                    self.set_status(None, WorkerStatus::Failed);
                    abandon(Abandoned::Crashed { kind, message });
                    break;
                }
            }
        }

        self.set_status(None, WorkerStatus::Failed);
        jobs.close();
        let mut returned = 0;
        while let Ok(job) = jobs.try_recv() {
            (job.abandon)(Abandoned::Returned);
            returned += 1;
        }
        warn!(worker_id = self.worker_id, returned, "Worker stopped, queued batches returned");
    }

    async fn execute(&self, run: Box<dyn FnOnce(bool) + Send + 'static>) -> Exit {
        let timeout = self.batch_timeout;
        let catch_panics = self.kind.catches_panics();
        let deadline = async move {
            match timeout {
                Some(limit) => tokio::time::sleep(limit).await,
                None => std::future::pending::<()>().await,
            }
        };

        match self.kind {
            WorkerKind::Threaded => {
                let mut handle = tokio::task::spawn_blocking(move || run(catch_panics));
                tokio::select! {
                    joined = &mut handle => match joined {
                        Ok(()) => Exit::Done,
                        Err(err) => Exit::Died {
                            kind: FailureKind::WorkerCrashed,
                            message: format!("worker task failed: {}", err),
                        },
                    },
                    _ = deadline => Exit::Died {
                        kind: FailureKind::TimedOut,
                        message: format!("batch exceeded {:?}", timeout.unwrap_or_default()),
                    },
                    _ = self.kill.cancelled() => Exit::Died {
                        kind: FailureKind::WorkerCrashed,
                        message: "worker killed".to_string(),
                    },
                }
            }
            WorkerKind::Isolated => {
                let (done, finished) = oneshot::channel::<Result<(), String>>();
                let spawned = std::thread::Builder::new()
                    .name(format!("chunkflow-worker-{}", self.worker_id))
                    .spawn(move || {
                        let outcome = catch_unwind(AssertUnwindSafe(|| run(catch_panics)))
                            .map_err(|payload| panic_message(payload.as_ref()));
                        let _ = done.send(outcome);
                    });
                if let Err(source) = spawned {
                    let err = EngineError::WorkerSpawn {
                        worker_id: self.worker_id,
                        source,
                    };
                    return Exit::Died {
                        kind: FailureKind::WorkerCrashed,
                        message: err.to_string(),
                    };
                }

                tokio::select! {
                    outcome = finished => match outcome {
                        Ok(Ok(())) => Exit::Done,
                        Ok(Err(panic)) => Exit::Died {
                            kind: FailureKind::WorkerCrashed,
                            message: format!("worker panicked: {}", panic),
                        },
                        Err(_) => Exit::Died {
                            kind: FailureKind::WorkerCrashed,
                            message: "worker thread exited without reporting".to_string(),
                        },
                    },
                    _ = deadline => Exit::Died {
                        kind: FailureKind::TimedOut,
                        message: format!("batch exceeded {:?}", timeout.unwrap_or_default()),
                    },
                    _ = self.kill.cancelled() => Exit::Died {
                        kind: FailureKind::WorkerCrashed,
                        message: "worker killed".to_string(),
                    },
                }
            }
        }
    }

    fn set_status(&self, from: Option<WorkerStatus>, to: WorkerStatus) {
        self.table.set_status(self.worker_id, self.generation, from, to);
    }
}

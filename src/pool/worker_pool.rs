//! Worker pool: owns the shared queue and N worker handles, and exposes the
//! public `add` / `execute` / `end` / `join` surface.
//!
//! # Lifecycle
//!
//! A pool starts with every handle Stopped and no subprocesses running.
//! Enqueued work wakes idle handles; each handle spawns its subprocess
//! lazily, reuses it across consecutive tasks, and terminates it whenever
//! the queue runs dry. `end` prevents new submissions and lets the queue
//! drain; `join` resolves once every handle has reported End, or rejects on
//! the first fatal error without waiting for the rest.

use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::pool::handle::{HandleState, WorkerDriver, WorkerStatus};
use crate::pool::pending::PendingResultRegistry;
use crate::pool::queue::{QueuedTask, TaskQueue};
use crate::protocol::{TaskFailure, TaskId};

/// Errors surfaced by the pool API.
#[derive(Debug, Error)]
pub enum PoolError {
    /// `add`/`execute` was called after `end`.
    #[error("Pool is ended")]
    Ended,

    /// The task payload could not be serialized.
    #[error("Invalid task payload: {0}")]
    InvalidPayload(#[from] serde_json::Error),

    /// The executed task failed.
    #[error("Task failed: {0}")]
    Task(#[from] TaskFailure),

    /// A worker failed while no task was in flight; the pool is
    /// structurally broken and callers should initiate shutdown.
    #[error("Worker {worker} failed fatally: {failure}")]
    Fatal { worker: usize, failure: TaskFailure },

    /// The pool shut down before the outcome could be delivered.
    #[error("Pool closed before the task completed")]
    Closed,
}

/// Completion and lifecycle notifications emitted by the pool.
#[derive(Debug, Clone)]
pub enum PoolEvent {
    /// A task finished successfully.
    TaskDone { id: TaskId, task: Value, result: Value },
    /// A task failed (handler error or mid-task worker crash).
    TaskError { id: TaskId, task: Value, failure: TaskFailure },
    /// A handle drained the queue after `end` and will not run again.
    WorkerEnd { worker: usize },
    /// A worker failed while idle; `join` rejects with the same failure.
    Fatal { worker: usize, failure: TaskFailure },
}

/// Configuration for a worker pool.
#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    /// Program executed for each worker subprocess. The program is expected
    /// to build a [`HandlerRegistry`](crate::worker::HandlerRegistry) and
    /// hand control to [`WorkerRuntime`](crate::worker::WorkerRuntime).
    pub worker_program: PathBuf,
    /// Extra arguments passed to the worker program.
    pub worker_args: Vec<String>,
    /// Handler name every worker must expose; validated at worker startup.
    pub method: String,
    /// Number of worker subprocesses. Defaults to
    /// [`default_worker_count`], one per available core.
    pub num_workers: usize,
}

impl WorkerPoolConfig {
    pub fn new(worker_program: impl Into<PathBuf>, method: impl Into<String>) -> Self {
        Self {
            worker_program: worker_program.into(),
            worker_args: Vec::new(),
            method: method.into(),
            num_workers: default_worker_count(),
        }
    }

    /// Sets extra arguments for the worker program.
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.worker_args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Sets the worker count. Values below 1 are clamped to 1.
    pub fn with_num_workers(mut self, num_workers: usize) -> Self {
        self.num_workers = num_workers.max(1);
        self
    }
}

/// Default worker count: one per available core, falling back to 1 when
/// parallelism cannot be determined.
pub fn default_worker_count() -> usize {
    std::thread::available_parallelism()
        .map(NonZeroUsize::get)
        .unwrap_or(1)
}

/// Point-in-time counters for a pool.
#[derive(Debug, Clone, Default)]
pub struct PoolStats {
    /// Total number of workers in the pool.
    pub num_workers: usize,
    /// Workers currently driving a task.
    pub busy_workers: usize,
    /// Tasks waiting in the queue.
    pub queued: usize,
    /// Tasks that completed successfully.
    pub tasks_done: u64,
    /// Tasks that failed.
    pub tasks_failed: u64,
}

impl PoolStats {
    /// Total number of tasks that reached a terminal state.
    pub fn total_processed(&self) -> u64 {
        self.tasks_done + self.tasks_failed
    }
}

/// State shared between the pool handle and its worker drivers.
pub(crate) struct PoolShared {
    pub(crate) config: WorkerPoolConfig,
    pub(crate) queue: TaskQueue,
    pub(crate) pending: PendingResultRegistry,
    pub(crate) workers: Vec<Arc<HandleState>>,
    ended: AtomicBool,
    alive: AtomicUsize,
    tasks_done: AtomicU64,
    tasks_failed: AtomicU64,
    events_tx: mpsc::UnboundedSender<PoolEvent>,
    completion_tx: Mutex<Option<oneshot::Sender<Result<(), PoolError>>>>,
}

impl PoolShared {
    pub(crate) fn is_ended(&self) -> bool {
        self.ended.load(Ordering::SeqCst)
    }

    pub(crate) fn emit(&self, event: PoolEvent) {
        // Nobody listening is fine; events are advisory.
        let _ = self.events_tx.send(event);
    }

    /// Merges tasks into the queue and wakes enough idle drivers to cover
    /// them. Also the landing point for worker-originated `AddTask`
    /// messages, which are accepted even while the pool is draining.
    pub(crate) fn enqueue(&self, tasks: Vec<QueuedTask>) {
        let count = tasks.len();
        self.queue.push_batch(tasks);
        self.wake_idle(count);
    }

    /// Returns an undelivered task to the queue head and wakes a driver for
    /// it, so the remaining workers keep draining after a fatal failure.
    pub(crate) fn requeue(&self, task: QueuedTask) {
        self.queue.push_front(task);
        self.wake_idle(1);
    }

    fn wake_idle(&self, max: usize) {
        let mut woken = 0;
        for state in &self.workers {
            if woken == max {
                break;
            }
            if state.status() == WorkerStatus::Stopped {
                state.wake.notify_one();
                woken += 1;
            }
        }
    }

    pub(crate) fn wake_all(&self) {
        for state in &self.workers {
            state.wake.notify_one();
        }
    }

    pub(crate) fn record_done(&self) {
        self.tasks_done.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn record_failed(&self) {
        self.tasks_failed.fetch_add(1, Ordering::SeqCst);
    }

    /// Rejects the pool's completion future. First fatal wins; later calls
    /// only emit the event.
    pub(crate) fn report_fatal(&self, worker: usize, failure: TaskFailure) {
        warn!(worker, error = %failure, "Worker failed fatally");
        self.emit(PoolEvent::Fatal { worker, failure: failure.clone() });
        if let Some(tx) = self.take_completion() {
            let _ = tx.send(Err(PoolError::Fatal { worker, failure }));
        }
    }

    /// Completion barrier: the last driver to finish settles the future.
    pub(crate) fn driver_finished(&self) {
        if self.alive.fetch_sub(1, Ordering::SeqCst) == 1 {
            if let Some(tx) = self.take_completion() {
                let _ = tx.send(Ok(()));
            }
        }
    }

    fn take_completion(&self) -> Option<oneshot::Sender<Result<(), PoolError>>> {
        self.completion_tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }
}

/// Pool of worker subprocesses sharing one FIFO task queue.
pub struct WorkerPool {
    shared: Arc<PoolShared>,
    events: Option<mpsc::UnboundedReceiver<PoolEvent>>,
    completion: Option<oneshot::Receiver<Result<(), PoolError>>>,
    drivers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Creates a pool with every handle idle and no subprocesses running.
    ///
    /// Must be called within a tokio runtime; driver tasks are spawned
    /// immediately, subprocesses only once work arrives.
    pub fn new(config: WorkerPoolConfig) -> Self {
        let num_workers = config.num_workers.max(1);
        let config = WorkerPoolConfig { num_workers, ..config };

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (completion_tx, completion_rx) = oneshot::channel();
        let workers: Vec<Arc<HandleState>> =
            (0..num_workers).map(|_| Arc::new(HandleState::new())).collect();

        let shared = Arc::new(PoolShared {
            config,
            queue: TaskQueue::new(),
            pending: PendingResultRegistry::new(),
            workers,
            ended: AtomicBool::new(false),
            alive: AtomicUsize::new(num_workers),
            tasks_done: AtomicU64::new(0),
            tasks_failed: AtomicU64::new(0),
            events_tx,
            completion_tx: Mutex::new(Some(completion_tx)),
        });

        let drivers = (0..num_workers)
            .map(|index| tokio::spawn(WorkerDriver::new(index, Arc::clone(&shared)).run()))
            .collect();

        info!(num_workers, "Worker pool started");

        Self {
            shared,
            events: Some(events_rx),
            completion: Some(completion_rx),
            drivers,
        }
    }

    /// Creates a pool and enqueues `initial_tasks`, waking up to
    /// `min(num_workers, initial_tasks.len())` handles.
    pub fn with_initial_tasks<T: Serialize>(
        config: WorkerPoolConfig,
        initial_tasks: &[T],
    ) -> Result<Self, PoolError> {
        let pool = Self::new(config);
        pool.add_batch(initial_tasks)?;
        Ok(pool)
    }

    /// Appends one task to the queue, waking an idle handle if any.
    ///
    /// Returns the id under which the task's `TaskDone`/`TaskError` event
    /// will be reported.
    pub fn add<T: Serialize>(&self, task: &T) -> Result<TaskId, PoolError> {
        if self.shared.is_ended() {
            return Err(PoolError::Ended);
        }
        let queued = QueuedTask::new(serde_json::to_value(task)?);
        let id = queued.id;
        debug!(task = %id, "Task enqueued");
        self.shared.enqueue(vec![queued]);
        Ok(id)
    }

    /// Appends a batch, preserving its order. Wakes up to
    /// `min(batch, idle)` handles.
    pub fn add_batch<T: Serialize>(&self, tasks: &[T]) -> Result<Vec<TaskId>, PoolError> {
        if self.shared.is_ended() {
            return Err(PoolError::Ended);
        }
        let queued: Vec<QueuedTask> = tasks
            .iter()
            .map(|task| Ok(QueuedTask::new(serde_json::to_value(task)?)))
            .collect::<Result<_, serde_json::Error>>()?;
        let ids: Vec<TaskId> = queued.iter().map(|t| t.id).collect();
        debug!(count = ids.len(), "Task batch enqueued");
        self.shared.enqueue(queued);
        Ok(ids)
    }

    /// Enqueues one task and waits for exactly its outcome: the `DoneTask`
    /// payload on success, its `TaskFailure` on failure.
    pub async fn execute<T: Serialize>(&self, task: &T) -> Result<Value, PoolError> {
        if self.shared.is_ended() {
            return Err(PoolError::Ended);
        }
        let queued = QueuedTask::new(serde_json::to_value(task)?);
        // Register before enqueueing so the outcome cannot race the caller.
        let rx = self.shared.pending.register(queued.id);
        debug!(task = %queued.id, "Task enqueued for execute");
        self.shared.enqueue(vec![queued]);
        match rx.await {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(failure)) => Err(PoolError::Task(failure)),
            Err(_) => Err(PoolError::Closed),
        }
    }

    /// Enqueues a batch and waits for all outcomes, rejecting with the
    /// first member failure regardless of the other members' results.
    pub async fn execute_batch<T: Serialize>(&self, tasks: &[T]) -> Result<Vec<Value>, PoolError> {
        if self.shared.is_ended() {
            return Err(PoolError::Ended);
        }
        let queued: Vec<QueuedTask> = tasks
            .iter()
            .map(|task| Ok(QueuedTask::new(serde_json::to_value(task)?)))
            .collect::<Result<_, serde_json::Error>>()?;
        let receivers: Vec<_> =
            queued.iter().map(|t| self.shared.pending.register(t.id)).collect();
        self.shared.enqueue(queued);

        futures::future::try_join_all(receivers.into_iter().map(|rx| async move {
            match rx.await {
                Ok(Ok(result)) => Ok(result),
                Ok(Err(failure)) => Err(PoolError::Task(failure)),
                Err(_) => Err(PoolError::Closed),
            }
        }))
        .await
    }

    /// True iff at least one handle is Stopped.
    pub fn is_idle(&self) -> bool {
        self.shared
            .workers
            .iter()
            .any(|state| state.status() == WorkerStatus::Stopped)
    }

    /// Stops accepting new tasks and lets the queue drain. Idle handles
    /// flush to End immediately; in-flight tasks always run to completion.
    pub fn end(&self) {
        info!("Worker pool ending");
        self.shared.ended.store(true, Ordering::SeqCst);
        self.shared.wake_all();
    }

    /// Waits for the pool to finish: `Ok` once every handle has reported
    /// End, `Err` on the first fatal error without waiting for the rest.
    pub async fn join(mut self) -> Result<(), PoolError> {
        let completion = self.completion.take().ok_or(PoolError::Closed)?;
        match completion.await {
            Ok(Ok(())) => {
                // All drivers have reported in; reap their tasks.
                for handle in self.drivers.drain(..) {
                    let _ = handle.await;
                }
                info!("Worker pool finished");
                Ok(())
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(PoolError::Closed),
        }
    }

    /// Takes the event stream. Yields `None` once the pool has fully shut
    /// down. Can be taken once.
    pub fn take_events(&mut self) -> Option<mpsc::UnboundedReceiver<PoolEvent>> {
        self.events.take()
    }

    /// Point-in-time pool counters.
    pub fn stats(&self) -> PoolStats {
        PoolStats {
            num_workers: self.shared.workers.len(),
            busy_workers: self
                .shared
                .workers
                .iter()
                .filter(|state| state.status() == WorkerStatus::Processing)
                .count(),
            queued: self.shared.queue.len(),
            tasks_done: self.shared.tasks_done.load(Ordering::SeqCst),
            tasks_failed: self.shared.tasks_failed.load(Ordering::SeqCst),
        }
    }

    pub fn num_workers(&self) -> usize {
        self.shared.workers.len()
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        // Parked drivers would otherwise wait forever for work that can no
        // longer arrive.
        self.shared.ended.store(true, Ordering::SeqCst);
        self.shared.wake_all();
    }
}

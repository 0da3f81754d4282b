//! Coordinator-side worker handle: status state machine, task handshake,
//! message routing, and crash recovery for one worker subprocess.
//!
//! Each handle runs as an independent driver task. A driver repeatedly pops
//! the oldest pending task, delivers it over the handle's IPC link, and
//! routes the worker's replies. When the queue is empty the driver
//! terminates its subprocess and either parks (more work may arrive) or,
//! once the pool is ending, reports End and finishes.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::pool::channel::{ChannelError, WorkerChannel};
use crate::pool::queue::QueuedTask;
use crate::pool::worker_pool::{PoolEvent, PoolShared};
use crate::protocol::{CoordinatorMessage, TaskFailure, WorkerMessage};

/// Externally visible state of one worker handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerStatus {
    /// No task in flight; the subprocess (if any) has been terminated.
    Stopped,
    /// A task has been dequeued and is being driven to completion.
    Processing,
}

const STATUS_STOPPED: u8 = 0;
const STATUS_PROCESSING: u8 = 1;

/// State shared between a driver and the pool that owns it.
#[derive(Debug)]
pub(crate) struct HandleState {
    status: AtomicU8,
    /// Parked drivers wait here; `add` and `end` wake them.
    pub(crate) wake: Notify,
}

impl HandleState {
    pub(crate) fn new() -> Self {
        Self {
            status: AtomicU8::new(STATUS_STOPPED),
            wake: Notify::new(),
        }
    }

    pub(crate) fn status(&self) -> WorkerStatus {
        match self.status.load(Ordering::SeqCst) {
            STATUS_PROCESSING => WorkerStatus::Processing,
            _ => WorkerStatus::Stopped,
        }
    }

    fn set_status(&self, status: WorkerStatus) {
        let raw = match status {
            WorkerStatus::Stopped => STATUS_STOPPED,
            WorkerStatus::Processing => STATUS_PROCESSING,
        };
        self.status.store(raw, Ordering::SeqCst);
    }
}

/// Drives one worker subprocess against the shared queue.
pub(crate) struct WorkerDriver {
    index: usize,
    shared: Arc<PoolShared>,
    state: Arc<HandleState>,
    channel: Option<WorkerChannel>,
}

impl WorkerDriver {
    pub(crate) fn new(index: usize, shared: Arc<PoolShared>) -> Self {
        let state = Arc::clone(&shared.workers[index]);
        Self { index, shared, state, channel: None }
    }

    /// Main driver loop; runs until the pool ends or a fatal error occurs.
    pub(crate) async fn run(mut self) {
        debug!(worker = self.index, "Worker driver started");
        loop {
            match self.shared.queue.pop() {
                Some(task) => {
                    self.state.set_status(WorkerStatus::Processing);
                    if let Err(failure) = self.process(task).await {
                        // The worker died before a task was delivered, so the
                        // failure is not attributable to any task: fatal.
                        self.state.set_status(WorkerStatus::Stopped);
                        self.shared.report_fatal(self.index, failure);
                        self.shared.driver_finished();
                        return;
                    }
                }
                None => {
                    // An idle handle holds no subprocess.
                    if let Some(channel) = self.channel.take() {
                        channel.terminate().await;
                    }
                    self.state.set_status(WorkerStatus::Stopped);
                    if self.shared.is_ended() && self.shared.queue.is_empty() {
                        info!(worker = self.index, "Worker reached end of queue");
                        self.shared.emit(PoolEvent::WorkerEnd { worker: self.index });
                        self.shared.driver_finished();
                        return;
                    }
                    // Re-check after publishing Stopped: a task pushed between
                    // our pop and the status store would otherwise be missed.
                    if !self.shared.queue.is_empty() {
                        continue;
                    }
                    self.state.wake.notified().await;
                }
            }
        }
    }

    /// Runs one task to completion through the subprocess.
    ///
    /// `Ok(())` covers both task outcomes, including a synthesized error for
    /// a worker that crashed mid-task (the handle recovers with a fresh
    /// subprocess). `Err` means the worker died before the task was
    /// delivered; the task has been returned to the queue head.
    async fn process(&mut self, task: QueuedTask) -> Result<(), TaskFailure> {
        if self.channel.is_none() {
            match WorkerChannel::spawn(&self.shared.config, self.index).await {
                Ok(channel) => self.channel = Some(channel),
                Err(e) => {
                    self.shared.requeue(task);
                    return Err(TaskFailure::transport(e.to_string()));
                }
            }
        }
        let Some(channel) = self.channel.as_mut() else {
            self.shared.requeue(task);
            return Err(TaskFailure::transport("worker channel unavailable"));
        };

        // Handshake: the worker asks for work before anything is sent.
        match channel.recv().await {
            Ok(WorkerMessage::GetTask) => {}
            Ok(other) => {
                warn!(worker = self.index, ?other, "Expected get_task during handshake");
                self.channel = None;
                self.shared.requeue(task);
                return Err(TaskFailure::transport("worker broke the request/response protocol"));
            }
            Err(e) => {
                let failure = failure_from_channel(&e);
                self.channel = None;
                self.shared.requeue(task);
                return Err(failure);
            }
        }

        let delivery = CoordinatorMessage::SetTask {
            id: task.id,
            payload: task.payload.clone(),
        };
        if let Err(e) = channel.send(&delivery).await {
            let failure = failure_from_channel(&e);
            self.channel = None;
            self.shared.requeue(task);
            return Err(failure);
        }

        debug!(worker = self.index, task = %task.id, "Task delivered");

        // The task is in flight: everything from here on is recoverable.
        loop {
            let Some(channel) = self.channel.as_mut() else {
                self.complete_err(&task, TaskFailure::transport("worker channel unavailable"));
                return Ok(());
            };
            match channel.recv().await {
                Ok(WorkerMessage::AddTask { payload }) => {
                    let follow_up = QueuedTask::new(payload);
                    debug!(
                        worker = self.index,
                        task = %task.id,
                        follow_up = %follow_up.id,
                        "Task fanned out follow-up work"
                    );
                    self.shared.enqueue(vec![follow_up]);
                }
                Ok(WorkerMessage::DoneTask { id, result }) => {
                    if id != task.id {
                        warn!(
                            worker = self.index,
                            expected = %task.id,
                            reported = %id,
                            "Worker reported completion for an unexpected task id"
                        );
                    }
                    self.complete_ok(&task, result);
                    return Ok(());
                }
                Ok(WorkerMessage::Error { id, failure }) => {
                    if id != task.id {
                        warn!(
                            worker = self.index,
                            expected = %task.id,
                            reported = %id,
                            "Worker reported failure for an unexpected task id"
                        );
                    }
                    self.complete_err(&task, failure);
                    return Ok(());
                }
                Ok(WorkerMessage::GetTask) => {
                    // A second request with a task still in flight violates
                    // the one-task-per-worker protocol; drop the worker.
                    warn!(worker = self.index, task = %task.id, "Worker requested work mid-task");
                    self.channel = None;
                    self.complete_err(
                        &task,
                        TaskFailure::transport("worker requested work with a task in flight"),
                    );
                    return Ok(());
                }
                Err(e) => {
                    let failure = failure_from_channel(&e);
                    warn!(
                        worker = self.index,
                        task = %task.id,
                        error = %failure,
                        "Worker died while a task was in flight"
                    );
                    self.channel = None;
                    self.complete_err(&task, failure);
                    return Ok(());
                }
            }
        }
    }

    fn complete_ok(&self, task: &QueuedTask, result: serde_json::Value) {
        debug!(worker = self.index, task = %task.id, "Task done");
        self.shared.record_done();
        self.shared.pending.settle(task.id, Ok(result.clone()));
        self.shared.emit(PoolEvent::TaskDone {
            id: task.id,
            task: task.payload.clone(),
            result,
        });
    }

    fn complete_err(&self, task: &QueuedTask, failure: TaskFailure) {
        debug!(worker = self.index, task = %task.id, error = %failure, "Task failed");
        self.shared.record_failed();
        self.shared.pending.settle(task.id, Err(failure.clone()));
        self.shared.emit(PoolEvent::TaskError {
            id: task.id,
            task: task.payload.clone(),
            failure,
        });
    }
}

fn failure_from_channel(err: &ChannelError) -> TaskFailure {
    match err {
        ChannelError::Disconnected { exit_code, signal } => {
            TaskFailure::crashed(*exit_code, *signal)
        }
        other => TaskFailure::transport(other.to_string()),
    }
}

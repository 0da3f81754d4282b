//! Wire protocol between the pool coordinator and its worker subprocesses.
//!
//! Messages travel as one JSON object per line over the worker's stdio.
//! The vocabulary is deliberately small and fixed:
//!
//! - `GetTask` (worker → coordinator): request work or permission to exit
//! - `SetTask` (coordinator → worker): execute this task
//! - `DoneTask` (worker → coordinator): the task succeeded
//! - `Error` (worker → coordinator): the task failed
//! - `AddTask` (worker → coordinator): enqueue follow-up work produced by
//!   the running task
//!
//! A worker never receives a new task before explicitly requesting one, so
//! in-flight work is bounded to exactly one task per worker.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Identifier assigned to a task when it enters the queue.
///
/// Pending `execute` callers and completion events are keyed on this id.
pub type TaskId = Uuid;

/// Environment variable carrying the task method name to a spawned worker.
pub const METHOD_ENV: &str = "FORKPOOL_METHOD";

/// Environment variable carrying the worker's index within the pool.
pub const WORKER_ID_ENV: &str = "FORKPOOL_WORKER_ID";

/// Messages sent by a worker subprocess to the coordinator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerMessage {
    /// Request the next task, or permission to exit if the queue is drained.
    GetTask,
    /// The current task completed successfully.
    DoneTask { id: TaskId, result: Value },
    /// The current task failed.
    Error { id: TaskId, failure: TaskFailure },
    /// Enqueue a follow-up task produced by the running handler.
    AddTask { payload: Value },
}

/// Messages sent by the coordinator to a worker subprocess.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CoordinatorMessage {
    /// Execute this task and report the outcome.
    SetTask { id: TaskId, payload: Value },
}

/// Classification of a task failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The task handler returned an error.
    Handler,
    /// The worker subprocess exited abnormally while the task was in flight.
    WorkerCrashed,
    /// The IPC link failed while the task was in flight.
    Transport,
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureKind::Handler => write!(f, "handler error"),
            FailureKind::WorkerCrashed => write!(f, "worker crashed"),
            FailureKind::Transport => write!(f, "transport failure"),
        }
    }
}

/// Failure report for a single task.
///
/// Produced by the worker runtime when a handler fails, or synthesized by
/// the coordinator when a worker dies while a task is in flight.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct TaskFailure {
    /// What went wrong.
    pub kind: FailureKind,
    /// Human-readable description.
    pub message: String,
    /// Error chain / backtrace captured at the failure site, when available.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backtrace: Option<String>,
    /// Exit code of the worker process, when the failure is a crash.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    /// Signal that terminated the worker process (Unix only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signal: Option<i32>,
}

impl TaskFailure {
    /// Builds a failure report from a handler error.
    pub fn handler(err: &anyhow::Error) -> Self {
        Self {
            kind: FailureKind::Handler,
            message: err.to_string(),
            backtrace: Some(format!("{err:?}")),
            exit_code: None,
            signal: None,
        }
    }

    /// Builds a failure report for a worker that died mid-task.
    pub fn crashed(exit_code: Option<i32>, signal: Option<i32>) -> Self {
        let message = match (exit_code, signal) {
            (Some(code), _) => format!("worker exited abnormally with code {code}"),
            (None, Some(sig)) => format!("worker killed by signal {sig}"),
            (None, None) => "worker exited abnormally".to_string(),
        };
        Self {
            kind: FailureKind::WorkerCrashed,
            message,
            backtrace: None,
            exit_code,
            signal,
        }
    }

    /// Builds a failure report for a broken IPC link.
    pub fn transport(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Transport,
            message: message.into(),
            backtrace: None,
            exit_code: None,
            signal: None,
        }
    }
}

//! Registry of callers waiting on a specific task's outcome.
//!
//! `execute` registers an entry before the task enters the queue; the
//! driver that finishes the task settles the entry with exactly that task's
//! result or failure. Tasks submitted through `add` have no entry here and
//! surface only through the event stream.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use serde_json::Value;
use tokio::sync::oneshot;

use crate::protocol::{TaskFailure, TaskId};

/// Terminal outcome of a single task.
pub type TaskOutcome = Result<Value, TaskFailure>;

/// Map from task identity to the waiting caller's completion channel.
#[derive(Debug, Default)]
pub struct PendingResultRegistry {
    inner: Mutex<HashMap<TaskId, oneshot::Sender<TaskOutcome>>>,
}

impl PendingResultRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an entry for `id` and returns the receiving half.
    pub fn register(&self, id: TaskId) -> oneshot::Receiver<TaskOutcome> {
        let (tx, rx) = oneshot::channel();
        self.lock().insert(id, tx);
        rx
    }

    /// Delivers the outcome to a waiting caller, removing the entry.
    ///
    /// Returns `false` if nobody was waiting on `id`.
    pub fn settle(&self, id: TaskId, outcome: TaskOutcome) -> bool {
        match self.lock().remove(&id) {
            Some(tx) => {
                // The caller may have dropped the future; nothing to do then.
                let _ = tx.send(outcome);
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(
        &self,
    ) -> std::sync::MutexGuard<'_, HashMap<TaskId, oneshot::Sender<TaskOutcome>>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

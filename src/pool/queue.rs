//! FIFO queue of pending tasks shared by all worker drivers.
//!
//! The queue is the single source of work for the pool. It is mutated only
//! by enqueue (append) and driver dequeue (pop front), so each task is held
//! by exactly one driver at a time and tasks dispatch oldest-first.

use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};

use serde_json::Value;

use crate::protocol::TaskId;

/// A task that has been assigned an id and is waiting for a worker.
#[derive(Debug, Clone)]
pub struct QueuedTask {
    /// Identity used by pending callers and completion events.
    pub id: TaskId,
    /// Opaque caller-supplied payload.
    pub payload: Value,
}

impl QueuedTask {
    /// Wraps a payload with a freshly assigned id.
    pub fn new(payload: Value) -> Self {
        Self { id: TaskId::new_v4(), payload }
    }
}

/// Ordered collection of pending tasks.
#[derive(Debug, Default)]
pub struct TaskQueue {
    inner: Mutex<VecDeque<QueuedTask>>,
}

impl TaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends one task.
    pub fn push(&self, task: QueuedTask) {
        self.lock().push_back(task);
    }

    /// Appends a batch, preserving its order.
    pub fn push_batch(&self, tasks: Vec<QueuedTask>) {
        let mut queue = self.lock();
        queue.extend(tasks);
    }

    /// Returns a task to the head of the queue.
    ///
    /// Used when a worker dies before its dequeued task was delivered, so
    /// the task keeps its place ahead of younger work.
    pub(crate) fn push_front(&self, task: QueuedTask) {
        self.lock().push_front(task);
    }

    /// Removes and returns the oldest pending task.
    pub fn pop(&self) -> Option<QueuedTask> {
        self.lock().pop_front()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<QueuedTask>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

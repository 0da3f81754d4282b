//! Handler registration for worker processes.
//!
//! A worker binary builds a [`HandlerRegistry`] mapping method names to
//! handlers, then hands it to [`WorkerRuntime`](crate::worker::WorkerRuntime).
//! The runtime resolves the method it was launched for once, at startup, so
//! a misconfigured worker fails before requesting any work.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;

/// Handle a running task uses to fan out follow-up work.
///
/// Follow-up tasks are forwarded to the coordinator while the current task
/// is still running and join the back of the shared queue, even when the
/// pool is already draining.
#[derive(Debug, Clone)]
pub struct TaskContext {
    follow_up: mpsc::UnboundedSender<Value>,
}

impl TaskContext {
    pub(crate) fn channel() -> (Self, mpsc::UnboundedReceiver<Value>) {
        let (follow_up, rx) = mpsc::unbounded_channel();
        (Self { follow_up }, rx)
    }

    /// Enqueues a follow-up task on the pool this worker belongs to.
    pub fn add<T: Serialize>(&self, task: &T) -> Result<(), serde_json::Error> {
        let payload = serde_json::to_value(task)?;
        // The receiver only disappears while the runtime is tearing down,
        // at which point the follow-up would be dropped anyway.
        let _ = self.follow_up.send(payload);
        Ok(())
    }
}

/// A task implementation a worker can be asked to run.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    /// Runs one task to completion.
    ///
    /// The returned value becomes the task's result; an error becomes a
    /// per-task failure on the coordinator side. Neither ends the worker.
    async fn run(&self, task: Value, ctx: TaskContext) -> anyhow::Result<Value>;
}

struct FnHandler<F> {
    func: F,
}

#[async_trait]
impl<F> TaskHandler for FnHandler<F>
where
    F: Fn(Value, TaskContext) -> BoxFuture<'static, anyhow::Result<Value>> + Send + Sync,
{
    async fn run(&self, task: Value, ctx: TaskContext) -> anyhow::Result<Value> {
        (self.func)(task, ctx).await
    }
}

/// Method-name to handler mapping for one worker binary.
#[derive(Default, Clone)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn TaskHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a handler under `method`, replacing any previous one.
    pub fn register(&mut self, method: impl Into<String>, handler: Arc<dyn TaskHandler>) {
        self.handlers.insert(method.into(), handler);
    }

    /// Registers an async closure as a handler.
    pub fn register_fn<F, Fut>(&mut self, method: impl Into<String>, func: F)
    where
        F: Fn(Value, TaskContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        let handler = FnHandler {
            func: move |task, ctx| Box::pin(func(task, ctx)) as BoxFuture<'static, _>,
        };
        self.register(method, Arc::new(handler));
    }

    pub fn contains(&self, method: &str) -> bool {
        self.handlers.contains_key(method)
    }

    pub fn get(&self, method: &str) -> Option<Arc<dyn TaskHandler>> {
        self.handlers.get(method).cloned()
    }

    /// Registered method names, sorted for stable error messages.
    pub fn method_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("methods", &self.method_names())
            .finish()
    }
}

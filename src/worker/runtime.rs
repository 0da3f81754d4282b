//! Request/response loop that runs inside each worker subprocess.
//!
//! The runtime never holds more than one task: it asks for work, runs the
//! handler to completion, reports the outcome, and asks again. Follow-up
//! tasks emitted through [`TaskContext`] are forwarded to the coordinator
//! while the handler is still running. EOF on stdin is the coordinator's
//! shutdown signal and ends the loop cleanly.

use std::env;
use std::sync::Arc;

use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Stdout};
use tracing::{debug, error, info};

use crate::protocol::{CoordinatorMessage, TaskFailure, WorkerMessage, METHOD_ENV, WORKER_ID_ENV};
use crate::worker::registry::{HandlerRegistry, TaskContext, TaskHandler};

/// Errors that terminate a worker process.
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// The process was not launched by a pool coordinator.
    #[error("Environment variable {METHOD_ENV} is not set")]
    MissingMethod,

    /// The coordinator asked for a method this binary does not provide.
    #[error("Unknown method '{method}', available: {available:?}")]
    UnknownMethod {
        method: String,
        available: Vec<String>,
    },

    /// Stdio to the coordinator failed.
    #[error("I/O error on coordinator link: {0}")]
    Io(#[from] std::io::Error),

    /// The coordinator sent something that is not a protocol message.
    #[error("Malformed message from coordinator: {0}")]
    Decode(#[from] serde_json::Error),
}

/// Drives a single worker process against its coordinator.
pub struct WorkerRuntime {
    handler: Arc<dyn TaskHandler>,
    worker_id: Option<usize>,
}

impl std::fmt::Debug for WorkerRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerRuntime")
            .field("worker_id", &self.worker_id)
            .finish_non_exhaustive()
    }
}

impl WorkerRuntime {
    /// Resolves the handler for the method this process was launched with.
    ///
    /// Fails immediately on a missing or unregistered method, before any
    /// work is requested from the coordinator.
    pub fn from_env(registry: &HandlerRegistry) -> Result<Self, RuntimeError> {
        let method = env::var(METHOD_ENV).map_err(|_| RuntimeError::MissingMethod)?;
        let mut runtime = Self::with_method(&method, registry)?;
        runtime.worker_id = env::var(WORKER_ID_ENV).ok().and_then(|v| v.parse().ok());

        info!(method, worker = ?runtime.worker_id, "Worker runtime initialized");
        Ok(runtime)
    }

    /// Resolves the handler for an explicit method name.
    pub fn with_method(method: &str, registry: &HandlerRegistry) -> Result<Self, RuntimeError> {
        let handler = registry.get(method).ok_or_else(|| RuntimeError::UnknownMethod {
            method: method.to_string(),
            available: registry.method_names(),
        })?;
        Ok(Self { handler, worker_id: None })
    }

    /// Runs the request/response loop until the coordinator closes stdin.
    pub async fn run(self) -> Result<(), RuntimeError> {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        let mut stdout = tokio::io::stdout();

        loop {
            write_message(&mut stdout, &WorkerMessage::GetTask).await?;

            let Some(line) = lines.next_line().await? else {
                debug!(worker = ?self.worker_id, "Coordinator closed stdin, exiting");
                return Ok(());
            };
            let CoordinatorMessage::SetTask { id, payload } =
                serde_json::from_str(line.trim_end())?;

            debug!(worker = ?self.worker_id, task = %id, "Task received");

            let (ctx, mut follow_ups) = TaskContext::channel();
            let mut work = Box::pin(self.handler.run(payload, ctx));
            let outcome = loop {
                tokio::select! {
                    outcome = &mut work => break outcome,
                    Some(task) = follow_ups.recv() => {
                        write_message(&mut stdout, &WorkerMessage::AddTask { payload: task })
                            .await?;
                    }
                }
            };
            drop(work);
            // Forward follow-ups the handler emitted right before finishing.
            while let Ok(task) = follow_ups.try_recv() {
                write_message(&mut stdout, &WorkerMessage::AddTask { payload: task }).await?;
            }

            let reply = match outcome {
                Ok(result) => WorkerMessage::DoneTask { id, result },
                Err(err) => {
                    error!(worker = ?self.worker_id, task = %id, error = %err, "Handler failed");
                    WorkerMessage::Error { id, failure: TaskFailure::handler(&err) }
                }
            };
            write_message(&mut stdout, &reply).await?;
        }
    }
}

async fn write_message(stdout: &mut Stdout, message: &WorkerMessage) -> Result<(), RuntimeError> {
    let mut line = serde_json::to_string(message)?;
    line.push('\n');
    stdout.write_all(line.as_bytes()).await?;
    stdout.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> HandlerRegistry {
        let mut registry = HandlerRegistry::new();
        registry.register_fn("echo", |task, _ctx| async move { Ok(task) });
        registry
    }

    #[test]
    fn known_method_resolves() {
        assert!(WorkerRuntime::with_method("echo", &registry()).is_ok());
    }

    #[test]
    fn unknown_method_lists_available_handlers() {
        let err = WorkerRuntime::with_method("render", &registry()).unwrap_err();
        match err {
            RuntimeError::UnknownMethod { method, available } => {
                assert_eq!(method, "render");
                assert_eq!(available, vec!["echo"]);
            }
            other => panic!("expected UnknownMethod, got {other:?}"),
        }
    }

    #[test]
    fn from_env_requires_method() {
        // Test binaries are never launched by a coordinator, so the
        // variable is absent; nothing here mutates the environment.
        let err = WorkerRuntime::from_env(&registry()).unwrap_err();
        assert!(matches!(err, RuntimeError::MissingMethod));
    }
}

//! forkpool - task execution across a pool of worker subprocesses.
//!
//! A [`WorkerPool`] owns a FIFO queue of JSON tasks and a fixed number of
//! worker handles. Each handle drives a long-lived subprocess over a
//! line-delimited JSON protocol on stdio: the worker asks for work, receives
//! one task, may fan out follow-up tasks mid-run, and reports the outcome.
//! Workers are reused across consecutive tasks and terminated whenever the
//! queue runs dry; a crashed worker fails only the task it was running and
//! is replaced by a fresh subprocess.
//!
//! The coordinator side lives in [`pool`], the subprocess side in
//! [`worker`], and the wire format they share in [`protocol`].
//!
//! # Example
//!
//! Coordinator:
//!
//! ```no_run
//! use forkpool::{WorkerPool, WorkerPoolConfig};
//! use serde_json::json;
//!
//! # async fn run() -> Result<(), forkpool::PoolError> {
//! let config = WorkerPoolConfig::new("./my-worker", "render").with_num_workers(4);
//! let pool = WorkerPool::new(config);
//!
//! let thumbnail = pool.execute(&json!({"image": "a.png"})).await?;
//! pool.add(&json!({"image": "b.png"}))?;
//!
//! pool.end();
//! pool.join().await?;
//! # Ok(())
//! # }
//! ```
//!
//! Worker binary:
//!
//! ```no_run
//! use forkpool::{HandlerRegistry, WorkerRuntime};
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let mut registry = HandlerRegistry::new();
//!     registry.register_fn("render", |task, _ctx| async move {
//!         Ok(json!({"rendered": task}))
//!     });
//!     WorkerRuntime::from_env(&registry)?.run().await?;
//!     Ok(())
//! }
//! ```

pub mod pool;
pub mod protocol;
pub mod worker;

pub use pool::{
    default_worker_count, PoolError, PoolEvent, PoolStats, WorkerPool, WorkerPoolConfig,
    WorkerStatus,
};
pub use protocol::{FailureKind, TaskFailure, TaskId};
pub use worker::{HandlerRegistry, RuntimeError, TaskContext, TaskHandler, WorkerRuntime};

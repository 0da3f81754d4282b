//! Coordinator side: the worker pool, its shared task queue, and the
//! per-worker subprocess plumbing.

pub mod channel;
pub mod handle;
pub mod pending;
pub mod queue;
pub mod worker_pool;

pub use channel::{ChannelError, WorkerChannel};
pub use handle::WorkerStatus;
pub use pending::{PendingResultRegistry, TaskOutcome};
pub use queue::{QueuedTask, TaskQueue};
pub use worker_pool::{
    default_worker_count, PoolError, PoolEvent, PoolStats, WorkerPool, WorkerPoolConfig,
};

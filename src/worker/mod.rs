//! Worker side: handler registration and the request/response runtime that
//! runs inside each worker subprocess.

pub mod registry;
pub mod runtime;

pub use registry::{HandlerRegistry, TaskContext, TaskHandler};
pub use runtime::{RuntimeError, WorkerRuntime};

//! Worker binary used by the integration tests.
//!
//! Registers a handful of handlers exercising the interesting paths: plain
//! completion, mid-task fan-out, handler failure, and hard process death.

use anyhow::bail;
use forkpool::{HandlerRegistry, WorkerRuntime};
use serde_json::{json, Value};
use std::time::Duration;

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let mut registry = HandlerRegistry::new();

    registry.register_fn("echo", |task, _ctx| async move { Ok(json!({ "echo": task })) });

    // Enqueues every element of `spawn` as a follow-up task, then finishes
    // with its own `value`.
    registry.register_fn("fanout", |task: Value, ctx| async move {
        if let Some(children) = task.get("spawn").and_then(Value::as_array) {
            for child in children {
                ctx.add(child)?;
            }
        }
        Ok(task.get("value").cloned().unwrap_or(Value::Null))
    });

    registry.register_fn("flaky", |task: Value, _ctx| async move {
        if task.get("fail").and_then(Value::as_bool) == Some(true) {
            bail!("flaky handler was told to fail");
        }
        Ok(json!({ "survived": task }))
    });

    // Dies without reporting anything, like a segfaulting worker would.
    registry.register_fn("abort", |task: Value, _ctx| async move {
        if task.get("crash").and_then(Value::as_bool) == Some(false) {
            return Ok(json!("spared"));
        }
        std::process::exit(27);
    });

    registry.register_fn("sleepy", |task: Value, _ctx| async move {
        let millis = task.get("millis").and_then(Value::as_u64).unwrap_or(50);
        tokio::time::sleep(Duration::from_millis(millis)).await;
        Ok(json!({ "slept_ms": millis }))
    });

    WorkerRuntime::from_env(&registry)?.run().await?;
    Ok(())
}

//! End-to-end tests driving real worker subprocesses.
//!
//! The worker binary lives at `tests/bin/test_worker.rs`; cargo builds it
//! alongside the test suite and exposes its path through `CARGO_BIN_EXE_*`.

use std::collections::HashMap;
use std::time::Duration;

use forkpool::{
    FailureKind, PoolError, PoolEvent, TaskId, WorkerPool, WorkerPoolConfig,
};
use serde_json::{json, Value};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::timeout;

const WORKER_BIN: &str = env!("CARGO_BIN_EXE_forkpool-test-worker");
const TEST_TIMEOUT: Duration = Duration::from_secs(30);

fn config(method: &str, workers: usize) -> WorkerPoolConfig {
    WorkerPoolConfig::new(WORKER_BIN, method).with_num_workers(workers)
}

async fn join(pool: WorkerPool) -> Result<(), PoolError> {
    timeout(TEST_TIMEOUT, pool.join())
        .await
        .expect("pool did not finish in time")
}

/// Collects all events until the pool shuts down and the channel closes.
async fn drain_events(mut events: UnboundedReceiver<PoolEvent>) -> Vec<PoolEvent> {
    let mut collected = Vec::new();
    let deadline = tokio::time::Instant::now() + TEST_TIMEOUT;
    while let Ok(Some(event)) = timeout(deadline - tokio::time::Instant::now(), events.recv()).await
    {
        collected.push(event);
    }
    collected
}

#[tokio::test]
async fn execute_returns_the_handler_result() {
    let pool = WorkerPool::new(config("echo", 1));

    let result = timeout(TEST_TIMEOUT, pool.execute(&json!({"n": 7})))
        .await
        .expect("execute timed out")
        .expect("echo task succeeds");
    assert_eq!(result, json!({"echo": {"n": 7}}));

    pool.end();
    join(pool).await.expect("pool drains");
}

#[tokio::test]
async fn fanout_work_completes_before_the_pool_ends() {
    // One worker, one seed task that spawns two children mid-run. `end` is
    // called while the seed may still be in flight; the children were
    // queued by the worker and must still run to completion.
    let mut pool = WorkerPool::new(config("fanout", 1));
    let events = pool.take_events().expect("events");

    pool.add(&json!({
        "value": "seed",
        "spawn": [
            {"value": "child-a"},
            {"value": "child-b"},
        ],
    }))
    .expect("pool accepts work");

    pool.end();
    join(pool).await.expect("pool drains");

    let events = drain_events(events).await;
    let done_values: Vec<&Value> = events
        .iter()
        .filter_map(|event| match event {
            PoolEvent::TaskDone { result, .. } => Some(result),
            _ => None,
        })
        .collect();
    assert_eq!(done_values.len(), 3, "seed and both children completed");
    assert!(done_values.contains(&&json!("seed")));
    assert!(done_values.contains(&&json!("child-a")));
    assert!(done_values.contains(&&json!("child-b")));

    let ends = events
        .iter()
        .filter(|event| matches!(event, PoolEvent::WorkerEnd { .. }))
        .count();
    assert_eq!(ends, 1);
}

#[tokio::test]
async fn initial_tasks_run_and_fan_out() {
    // Single worker, two initial tasks, the first of which spawns a third
    // mid-run. All three must complete even though `end` is called right
    // after construction.
    let initial = [
        json!({"value": "t1", "spawn": [{"value": "t3"}]}),
        json!({"value": "t2"}),
    ];
    let mut pool = WorkerPool::with_initial_tasks(config("fanout", 1), &initial)
        .expect("initial tasks serialize");
    let events = pool.take_events().expect("events");

    pool.end();
    join(pool).await.expect("pool drains");

    let events = drain_events(events).await;
    let done_values: Vec<&Value> = events
        .iter()
        .filter_map(|event| match event {
            PoolEvent::TaskDone { result, .. } => Some(result),
            _ => None,
        })
        .collect();
    assert_eq!(done_values.len(), 3);
    for value in ["t1", "t2", "t3"] {
        assert!(done_values.contains(&&json!(value)), "missing {value}");
    }
}

#[tokio::test]
async fn crashed_worker_fails_only_its_task() {
    let mut pool = WorkerPool::new(config("abort", 1));
    let events = pool.take_events().expect("events");

    // First task kills the process mid-run; the next two run on a fresh
    // subprocess spawned by the same handle.
    pool.add_batch(&[
        json!({"crash": true}),
        json!({"crash": false}),
        json!({"crash": false}),
    ])
    .expect("pool accepts work");

    pool.end();
    join(pool).await.expect("a mid-task crash is not fatal");

    let events = drain_events(events).await;
    let mut dones = 0;
    let mut crashes = 0;
    for event in &events {
        match event {
            PoolEvent::TaskDone { result, .. } => {
                dones += 1;
                assert_eq!(result, &json!("spared"));
            }
            PoolEvent::TaskError { failure, .. } => {
                crashes += 1;
                assert_eq!(failure.kind, FailureKind::WorkerCrashed);
                assert_eq!(failure.exit_code, Some(27));
            }
            PoolEvent::WorkerEnd { .. } => {}
            other => panic!("unexpected event: {other:?}"),
        }
    }
    assert_eq!(dones, 2);
    assert_eq!(crashes, 1);
}

#[tokio::test]
async fn ending_an_empty_pool_spawns_no_subprocesses() {
    let mut pool = WorkerPool::new(config("echo", 3));
    let events = pool.take_events().expect("events");

    pool.end();
    join(pool).await.expect("empty pool drains immediately");

    let events = drain_events(events).await;
    assert_eq!(events.len(), 3);
    assert!(events
        .iter()
        .all(|event| matches!(event, PoolEvent::WorkerEnd { .. })));
}

#[tokio::test]
async fn execute_batch_rejects_with_the_failing_member() {
    let pool = WorkerPool::new(config("flaky", 2));

    let outcome = timeout(
        TEST_TIMEOUT,
        pool.execute_batch(&[
            json!({"fail": false, "n": 1}),
            json!({"fail": true}),
            json!({"fail": false, "n": 2}),
        ]),
    )
    .await
    .expect("batch timed out");

    match outcome {
        Err(PoolError::Task(failure)) => {
            assert_eq!(failure.kind, FailureKind::Handler);
            assert!(failure.message.contains("told to fail"));
        }
        other => panic!("expected the flaky member's failure, got {other:?}"),
    }

    pool.end();
    join(pool).await.expect("pool drains");
}

#[tokio::test]
async fn execute_resolves_with_handler_failures() {
    let pool = WorkerPool::new(config("flaky", 1));

    let err = timeout(TEST_TIMEOUT, pool.execute(&json!({"fail": true})))
        .await
        .expect("execute timed out")
        .expect_err("flaky task fails");
    match err {
        PoolError::Task(failure) => {
            assert_eq!(failure.kind, FailureKind::Handler);
            assert!(failure.backtrace.is_some(), "handler failures carry context");
        }
        other => panic!("expected task failure, got {other:?}"),
    }

    pool.end();
    join(pool).await.expect("pool drains");
}

#[tokio::test]
async fn submissions_after_end_are_rejected() {
    let pool = WorkerPool::new(config("echo", 1));
    pool.end();

    assert!(matches!(pool.add(&json!(1)), Err(PoolError::Ended)));
    assert!(matches!(
        pool.execute(&json!(1)).await,
        Err(PoolError::Ended)
    ));

    join(pool).await.expect("pool drains");
}

#[tokio::test]
async fn unknown_method_is_fatal() {
    // The worker validates its method at startup and exits before asking
    // for work, so the task was never delivered and the failure cannot be
    // pinned on it.
    let pool = WorkerPool::new(config("no-such-method", 1));
    pool.add(&json!({"n": 1})).expect("pool accepts work");

    match join(pool).await {
        Err(PoolError::Fatal { worker, failure }) => {
            assert_eq!(worker, 0);
            assert_eq!(failure.kind, FailureKind::WorkerCrashed);
        }
        other => panic!("expected fatal join error, got {other:?}"),
    }
}

#[tokio::test]
async fn every_task_reaches_exactly_one_terminal_event() {
    let mut pool = WorkerPool::new(config("sleepy", 4));
    let events = pool.take_events().expect("events");

    let tasks: Vec<Value> = (0..12).map(|n| json!({"millis": 5, "n": n})).collect();
    let ids = pool.add_batch(&tasks).expect("pool accepts work");

    pool.end();
    join(pool).await.expect("pool drains");

    let mut outcomes: HashMap<TaskId, usize> = ids.iter().map(|id| (*id, 0)).collect();
    for event in drain_events(events).await {
        match event {
            PoolEvent::TaskDone { id, .. } | PoolEvent::TaskError { id, .. } => {
                *outcomes.get_mut(&id).expect("event for a known task") += 1;
            }
            PoolEvent::WorkerEnd { .. } => {}
            other => panic!("unexpected event: {other:?}"),
        }
    }
    assert!(outcomes.values().all(|&count| count == 1));
}

#[tokio::test]
async fn sequential_executes_accumulate_stats() {
    let pool = WorkerPool::new(config("echo", 1));

    for n in 0..5 {
        let result = timeout(TEST_TIMEOUT, pool.execute(&json!(n)))
            .await
            .expect("execute timed out")
            .expect("echo succeeds");
        assert_eq!(result, json!({"echo": n}));
    }

    let stats = pool.stats();
    assert_eq!(stats.tasks_done, 5);
    assert_eq!(stats.tasks_failed, 0);

    pool.end();
    join(pool).await.expect("pool drains");
}

mod common;

use std::collections::BTreeSet;
use std::error::Error;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::StreamExt;
use quarry_api::{
    ApiError, FnHandler, HandlerError, JobDraft, JobResult, JobState, Queue, SubmitOptions,
};
use quarry_core::{Job, JobError, JobEvent, JobId};
use quarry_engine::{EngineConfig, JobHandlerRegistry};
use quarry_store::{JobFilter, JobStore, StoreConfig};
use serde_json::json;

fn test_config() -> EngineConfig {
    EngineConfig::default()
        .with_workers(2)
        .with_lease_duration(Duration::from_secs(2))
        .with_poll_interval(Duration::from_millis(10), Duration::from_millis(50))
        .with_housekeeping_interval(Duration::from_millis(50))
}

fn test_handlers(order: Arc<Mutex<Vec<String>>>) -> JobHandlerRegistry {
    let mut handlers = JobHandlerRegistry::new();

    handlers.register(FnHandler::new("echo", move |job: &Job, _ctx| {
        let order = order.clone();
        let payload = job.payload.clone();
        Box::pin(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            if let Some(tag) = payload.get("tag").and_then(|t| t.as_str()) {
                order.lock().unwrap().push(tag.to_string());
            }
            Ok(JobResult::with_output("echoed", payload))
        })
    }));

    handlers.register(FnHandler::new("flag", |job: &Job, _ctx| {
        let fail = job.payload.get("fail").and_then(|v| v.as_bool()).unwrap_or(false);
        Box::pin(async move {
            if fail {
                Err(HandlerError::Fatal("flagged to fail".into()))
            } else {
                Ok(JobResult::new("flag ok"))
            }
        })
    }));

    handlers
}

async fn wait_for_state(id: JobId, state: JobState, timeout: Duration) -> Job {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let job = JobStore::get(id).await.expect("job disappeared");
        if job.state == state {
            return job;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {}: job is {}",
            state,
            job.state
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn submit_executes_and_watch_ends_at_completion() -> Result<(), Box<dyn Error>> {
    let _guard = common::setup().await?;

    let order = Arc::new(Mutex::new(Vec::new()));
    let queue = Queue::start(
        StoreConfig::memory(),
        test_config(),
        test_handlers(order.clone()),
    )
    .await?;

    let id = queue
        .submit("echo", json!({"msg": "hi"}), SubmitOptions::default())
        .await?;

    let mut events = queue.watch(id).await?;
    let mut saw_terminal = false;
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        match tokio::time::timeout_at(deadline, events.next()).await {
            Ok(Some(event)) => {
                assert_eq!(event.job_id(), id);
                if event.is_terminal() {
                    assert!(matches!(event, JobEvent::Completed { .. }));
                    saw_terminal = true;
                }
            }
            Ok(None) => break,
            Err(_) => panic!("watch stream did not terminate"),
        }
    }

    let job = queue.job(id).await?;
    assert_eq!(job.state, JobState::Completed);
    // The stream either carried the terminal event or attached after the
    // job was already done (and was empty by contract).
    if saw_terminal {
        assert!(job.result.is_some());
    }

    // A watch on a terminal job is empty.
    let mut replay = queue.watch(id).await?;
    assert!(replay.next().await.is_none());

    queue.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn unknown_dependency_is_rejected() -> Result<(), Box<dyn Error>> {
    let _guard = common::setup().await?;

    let queue = Queue::start(
        StoreConfig::memory(),
        test_config(),
        JobHandlerRegistry::new(),
    )
    .await?;

    let ghost = JobId::new();
    let result = queue
        .submit(
            "echo",
            json!({}),
            SubmitOptions {
                depends_on: BTreeSet::from([ghost]),
                ..Default::default()
            },
        )
        .await;
    assert!(matches!(result, Err(ApiError::UnknownDependency(id)) if id == ghost));
    assert!(queue.jobs(JobFilter::default()).await?.is_empty());

    queue.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn cyclic_graph_is_rejected_with_nothing_inserted() -> Result<(), Box<dyn Error>> {
    let _guard = common::setup().await?;

    let queue = Queue::start(
        StoreConfig::memory(),
        test_config(),
        JobHandlerRegistry::new(),
    )
    .await?;

    let a = JobDraft::new("echo", json!({"tag": "a"}));
    let b = JobDraft::new("echo", json!({"tag": "b"})).after(&a);
    let a = a.after(&b);

    let result = queue.submit_graph(vec![a, b]).await;
    assert!(matches!(
        result,
        Err(ApiError::Job(JobError::CyclicDependency(_)))
    ));
    assert!(queue.jobs(JobFilter::default()).await?.is_empty());

    queue.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn graph_executes_in_dependency_order() -> Result<(), Box<dyn Error>> {
    let _guard = common::setup().await?;

    let order = Arc::new(Mutex::new(Vec::new()));
    let queue = Queue::start(
        StoreConfig::memory(),
        test_config(),
        test_handlers(order.clone()),
    )
    .await?;

    let extract = JobDraft::new("echo", json!({"tag": "extract"}));
    let transform = JobDraft::new("echo", json!({"tag": "transform"})).after(&extract);
    let load = JobDraft::new("echo", json!({"tag": "load"})).after(&transform);
    let load_id = load.id();

    let ids = queue.submit_graph(vec![load, extract, transform]).await?;
    assert_eq!(ids.len(), 3);
    assert_eq!(ids[0], load_id);

    wait_for_state(load_id, JobState::Completed, Duration::from_secs(10)).await;
    assert_eq!(
        *order.lock().unwrap(),
        vec!["extract", "transform", "load"]
    );

    queue.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn delayed_submission_holds_the_job_back() -> Result<(), Box<dyn Error>> {
    let _guard = common::setup().await?;

    let order = Arc::new(Mutex::new(Vec::new()));
    let queue = Queue::start(
        StoreConfig::memory(),
        test_config(),
        test_handlers(order),
    )
    .await?;

    let id = queue
        .submit(
            "echo",
            json!({}),
            SubmitOptions {
                delay: Some(Duration::from_millis(400)),
                ..Default::default()
            },
        )
        .await?;

    // Still unclaimed while the delay runs, despite eager workers.
    tokio::time::sleep(Duration::from_millis(200)).await;
    let held = queue.job(id).await?;
    assert_eq!(held.state, JobState::Ready);
    assert_eq!(held.attempts, 0);

    let done = wait_for_state(id, JobState::Completed, Duration::from_secs(5)).await;
    assert_eq!(done.attempts, 1);

    queue.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn cancelled_job_is_terminal_and_watch_is_empty() -> Result<(), Box<dyn Error>> {
    let _guard = common::setup().await?;

    let queue = Queue::start(
        StoreConfig::memory(),
        test_config(),
        JobHandlerRegistry::new(),
    )
    .await?;

    // Parked behind a never-completing dependency.
    let blocker = queue.submit("echo", json!({}), SubmitOptions::default()).await?;
    let id = queue
        .submit(
            "echo",
            json!({}),
            SubmitOptions {
                depends_on: BTreeSet::from([blocker]),
                ..Default::default()
            },
        )
        .await?;

    queue.cancel(id, Some("not needed".into())).await?;
    let job = queue.job(id).await?;
    assert_eq!(job.state, JobState::Cancelled);
    assert_eq!(job.cancel_reason.as_deref(), Some("not needed"));

    // Idempotent.
    queue.cancel(id, None).await?;
    assert_eq!(queue.job(id).await?.cancel_reason.as_deref(), Some("not needed"));

    let mut events = queue.watch(id).await?;
    assert!(events.next().await.is_none());

    queue.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn restart_reruns_a_failed_job_with_new_payload() -> Result<(), Box<dyn Error>> {
    let _guard = common::setup().await?;

    let order = Arc::new(Mutex::new(Vec::new()));
    let queue = Queue::start(
        StoreConfig::memory(),
        test_config(),
        test_handlers(order),
    )
    .await?;

    let id = queue
        .submit("flag", json!({"fail": true}), SubmitOptions::default())
        .await?;

    let failed = wait_for_state(id, JobState::Failed, Duration::from_secs(5)).await;
    assert!(failed.is_terminal());
    assert_eq!(failed.last_error.as_deref(), Some("flagged to fail"));

    let fresh = queue.restart(id, Some(json!({"fail": false})), 0).await?;
    assert_eq!(fresh.state, JobState::Ready);
    assert!(fresh.last_error.is_none());

    let done = wait_for_state(id, JobState::Completed, Duration::from_secs(5)).await;
    assert_eq!(done.result.map(|r| r.summary), Some("flag ok".to_string()));

    queue.shutdown().await;
    Ok(())
}

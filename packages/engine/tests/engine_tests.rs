mod common;

use std::collections::BTreeSet;
use std::error::Error;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use quarry_core::{Job, JobEvent, JobId, JobResult, JobState};
use quarry_engine::{
    ActorRef, EngineConfig, FnHandler, HandlerError, JobHandlerRegistry, SupervisorMessage,
    start_engine,
};
use quarry_store::JobStore;
use serde_json::json;

fn test_config() -> EngineConfig {
    EngineConfig::default()
        .with_workers(2)
        .with_lease_duration(Duration::from_secs(2))
        .with_poll_interval(Duration::from_millis(10), Duration::from_millis(50))
        .with_housekeeping_interval(Duration::from_millis(50))
}

async fn stop_engine(
    supervisor: ActorRef<SupervisorMessage>,
    handle: tokio::task::JoinHandle<()>,
) {
    let _ = supervisor.send_message(SupervisorMessage::Shutdown);
    let _ = handle.await;
    // Let in-flight worker polls drain before the table is reset.
    tokio::time::sleep(Duration::from_millis(50)).await;
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

async fn wait_for_terminal(id: JobId, timeout: Duration) -> Job {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let job = JobStore::get(id).await.expect("job disappeared");
        if job.is_terminal() {
            return job;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for a terminal state: job is {}",
            job.state
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

fn register_echo(handlers: &mut JobHandlerRegistry) {
    handlers.register(FnHandler::new("echo", |job: &Job, _ctx| {
        let payload = job.payload.clone();
        Box::pin(async move { Ok(JobResult::with_output("echoed", payload)) })
    }));
}

#[tokio::test(flavor = "multi_thread")]
async fn executes_a_submitted_job() -> Result<(), Box<dyn Error>> {
    let _guard = common::setup().await?;

    let job = JobStore::insert(&Job::new("echo", json!({"msg": "hi"}))).await?;

    let mut handlers = JobHandlerRegistry::new();
    register_echo(&mut handlers);
    let (supervisor, handle) = start_engine(handlers, test_config()).await?;

    let done = wait_for_state(job.id, JobState::Completed, Duration::from_secs(5)).await;
    assert_eq!(done.attempts, 1);
    assert!(done.lease.is_none());
    assert_eq!(
        done.result.and_then(|r| r.output),
        Some(json!({"msg": "hi"}))
    );

    stop_engine(supervisor, handle).await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn reported_failures_retry_until_success() -> Result<(), Box<dyn Error>> {
    let _guard = common::setup().await?;

    let failures = Arc::new(AtomicUsize::new(0));
    let failures_in_handler = failures.clone();

    let mut handlers = JobHandlerRegistry::new();
    handlers.register(FnHandler::new("flaky", move |_job: &Job, _ctx| {
        let failures = failures_in_handler.clone();
        Box::pin(async move {
            if failures.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(HandlerError::Retry("transient".into()))
            } else {
                Ok(JobResult::new("finally"))
            }
        })
    }));

    let job = Job::new("flaky", json!({}))
        .with_retries(2)
        .with_retry_wait_ms(30);
    JobStore::insert(&job).await?;

    let (supervisor, handle) = start_engine(handlers, test_config()).await?;

    let done = wait_for_state(job.id, JobState::Completed, Duration::from_secs(5)).await;
    assert_eq!(done.attempts, 3);
    assert_eq!(done.retries_remaining, 0);
    assert_eq!(failures.load(Ordering::SeqCst), 3);

    stop_engine(supervisor, handle).await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn fatal_failure_skips_remaining_retries() -> Result<(), Box<dyn Error>> {
    let _guard = common::setup().await?;

    let mut handlers = JobHandlerRegistry::new();
    handlers.register(FnHandler::new("doomed", |_job: &Job, _ctx| {
        Box::pin(async move { Err(HandlerError::Fatal("bad payload".into())) })
    }));

    let job = Job::new("doomed", json!({})).with_retries(5);
    JobStore::insert(&job).await?;

    let (supervisor, handle) = start_engine(handlers, test_config()).await?;

    let failed = wait_for_terminal(job.id, Duration::from_secs(5)).await;
    assert_eq!(failed.state, JobState::Failed);
    assert_eq!(failed.retries_remaining, 0);
    assert_eq!(failed.attempts, 1);
    assert_eq!(failed.last_error.as_deref(), Some("bad payload"));

    stop_engine(supervisor, handle).await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn handler_panics_become_failures() -> Result<(), Box<dyn Error>> {
    let _guard = common::setup().await?;

    let mut handlers = JobHandlerRegistry::new();
    handlers.register(FnHandler::new("explosive", |_job: &Job, _ctx| {
        Box::pin(async move { panic!("kaboom") })
    }));

    let job = Job::new("explosive", json!({}));
    JobStore::insert(&job).await?;

    let (supervisor, handle) = start_engine(handlers, test_config()).await?;

    let failed = wait_for_terminal(job.id, Duration::from_secs(5)).await;
    assert_eq!(failed.state, JobState::Failed);
    assert_eq!(failed.last_error.as_deref(), Some("handler panicked"));

    stop_engine(supervisor, handle).await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn missing_handler_fails_terminally() -> Result<(), Box<dyn Error>> {
    let _guard = common::setup().await?;

    let job = Job::new("unknown", json!({})).with_retries(3);
    JobStore::insert(&job).await?;

    let (supervisor, handle) = start_engine(JobHandlerRegistry::new(), test_config()).await?;

    let failed = wait_for_terminal(job.id, Duration::from_secs(5)).await;
    assert_eq!(failed.state, JobState::Failed);
    assert_eq!(failed.retries_remaining, 0);

    stop_engine(supervisor, handle).await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn higher_priority_runs_first() -> Result<(), Box<dyn Error>> {
    let _guard = common::setup().await?;

    let order = Arc::new(Mutex::new(Vec::new()));
    let order_in_handler = order.clone();

    let mut handlers = JobHandlerRegistry::new();
    handlers.register(FnHandler::new("mark", move |job: &Job, _ctx| {
        let order = order_in_handler.clone();
        let tag = job.payload["tag"].as_str().unwrap_or("?").to_string();
        Box::pin(async move {
            order.lock().unwrap().push(tag);
            Ok(JobResult::new("marked"))
        })
    }));

    let low = Job::new("mark", json!({"tag": "low"})).with_priority(1);
    let high = Job::new("mark", json!({"tag": "high"})).with_priority(5);
    JobStore::insert(&low).await?;
    JobStore::insert(&high).await?;

    let config = test_config().with_workers(1);
    let (supervisor, handle) = start_engine(handlers, config).await?;

    wait_for_state(low.id, JobState::Completed, Duration::from_secs(5)).await;
    wait_for_state(high.id, JobState::Completed, Duration::from_secs(5)).await;
    assert_eq!(*order.lock().unwrap(), vec!["high", "low"]);

    stop_engine(supervisor, handle).await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn dependent_runs_after_its_prerequisite() -> Result<(), Box<dyn Error>> {
    let _guard = common::setup().await?;

    let order = Arc::new(Mutex::new(Vec::new()));
    let order_in_handler = order.clone();

    let mut handlers = JobHandlerRegistry::new();
    handlers.register(FnHandler::new("mark", move |job: &Job, _ctx| {
        let order = order_in_handler.clone();
        let tag = job.payload["tag"].as_str().unwrap_or("?").to_string();
        Box::pin(async move {
            order.lock().unwrap().push(tag);
            Ok(JobResult::new("marked"))
        })
    }));

    let first = Job::new("mark", json!({"tag": "first"}));
    let second = Job::new("mark", json!({"tag": "second"}))
        .with_priority(100)
        .with_depends_on(BTreeSet::from([first.id]));
    JobStore::insert(&first).await?;
    JobStore::insert(&second).await?;
    assert_eq!(JobStore::get(second.id).await?.state, JobState::Waiting);

    let (supervisor, handle) = start_engine(handlers, test_config()).await?;

    wait_for_state(second.id, JobState::Completed, Duration::from_secs(5)).await;
    assert_eq!(*order.lock().unwrap(), vec!["first", "second"]);

    stop_engine(supervisor, handle).await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn dependent_of_a_terminal_failure_stays_waiting() -> Result<(), Box<dyn Error>> {
    let _guard = common::setup().await?;

    let mut handlers = JobHandlerRegistry::new();
    handlers.register(FnHandler::new("doomed", |_job: &Job, _ctx| {
        Box::pin(async move { Err(HandlerError::Fatal("no".into())) })
    }));

    let doomed = Job::new("doomed", json!({}));
    let blocked = Job::new("doomed", json!({})).with_depends_on(BTreeSet::from([doomed.id]));
    JobStore::insert(&doomed).await?;
    JobStore::insert(&blocked).await?;

    let (supervisor, handle) = start_engine(handlers, test_config()).await?;

    wait_for_terminal(doomed.id, Duration::from_secs(5)).await;

    // Give the housekeeping sweep several cycles to (wrongly) promote it.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(JobStore::get(blocked.id).await?.state, JobState::Waiting);

    stop_engine(supervisor, handle).await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn crashed_worker_lease_is_reclaimed_and_rerun() -> Result<(), Box<dyn Error>> {
    let _guard = common::setup().await?;

    let job = Job::new("echo", json!({"msg": "again"})).with_retries(2);
    JobStore::insert(&job).await?;

    // A worker that claims and then never renews nor reports.
    let now = Utc::now();
    JobStore::try_claim(job.id, "ghost", now + chrono::Duration::milliseconds(200), now)
        .await?
        .unwrap();

    let mut handlers = JobHandlerRegistry::new();
    register_echo(&mut handlers);
    let (supervisor, handle) = start_engine(handlers, test_config()).await?;

    let done = wait_for_state(job.id, JobState::Completed, Duration::from_secs(5)).await;
    // Reclamation is not a reported failure: the budget is untouched.
    assert_eq!(done.retries_remaining, 2);
    assert_eq!(done.attempts, 2);

    stop_engine(supervisor, handle).await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn cancelled_mid_run_discards_the_result() -> Result<(), Box<dyn Error>> {
    let _guard = common::setup().await?;

    let mut handlers = JobHandlerRegistry::new();
    handlers.register(FnHandler::new("slow", |_job: &Job, _ctx| {
        Box::pin(async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            Ok(JobResult::new("too late"))
        })
    }));

    let job = Job::new("slow", json!({}));
    JobStore::insert(&job).await?;

    let (supervisor, handle) = start_engine(handlers, test_config()).await?;

    wait_for_state(job.id, JobState::Running, Duration::from_secs(5)).await;
    JobStore::cancel(job.id, Some("operator".into()), Utc::now()).await?;

    // The worker finishes its handler, notices the lost claim, and drops
    // the stale completion.
    tokio::time::sleep(Duration::from_millis(600)).await;
    let after = JobStore::get(job.id).await?;
    assert_eq!(after.state, JobState::Cancelled);
    assert!(after.result.is_none());

    stop_engine(supervisor, handle).await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn progress_and_log_events_stream_in_order() -> Result<(), Box<dyn Error>> {
    let _guard = common::setup().await?;

    let mut handlers = JobHandlerRegistry::new();
    handlers.register(FnHandler::new("steps", |_job: &Job, ctx| {
        Box::pin(async move {
            for step in 1..=3u64 {
                ctx.report_progress(step, 3).await.map_err(|e| e.to_string())?;
            }
            ctx.log("all steps done").await.map_err(|e| e.to_string())?;
            Ok(JobResult::new("stepped"))
        })
    }));

    let (supervisor, handle) = start_engine(handlers, test_config()).await?;

    // Subscribe before the job exists so no event can be missed.
    let mut events = match ractor::rpc::call(
        &supervisor,
        |reply| SupervisorMessage::Subscribe { reply },
        Some(Duration::from_secs(1)),
    )
    .await
    {
        Ok(ractor::rpc::CallResult::Success(rx)) => rx,
        other => panic!("subscribe failed: {:?}", other),
    };

    let job = Job::new("steps", json!({}));
    JobStore::insert(&job).await?;

    let mut progress_seen = Vec::new();
    let mut log_seen = false;
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let event = tokio::time::timeout_at(deadline, events.recv())
            .await
            .expect("timed out waiting for events")
            .expect("event channel closed");
        if event.job_id() != job.id {
            continue;
        }
        match event {
            JobEvent::Progressed { progress, .. } => progress_seen.push(progress.completed),
            JobEvent::Logged { message, .. } => log_seen = message == "all steps done",
            JobEvent::Completed { .. } => break,
            _ => {}
        }
    }

    assert_eq!(progress_seen, vec![1, 2, 3]);
    assert!(log_seen);

    let done = JobStore::get(job.id).await?;
    assert_eq!(done.progress.completed, 3);
    assert_eq!(done.progress.total, 3);
    assert!(done.log.iter().any(|e| e.message == "all steps done"));

    stop_engine(supervisor, handle).await;
    Ok(())
}

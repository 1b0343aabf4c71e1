//! Small end-to-end demo: register handlers, submit a dependency graph,
//! and tail the event stream.
//!
//! Run with: cargo run -p quarry_api --example demo

use std::error::Error;
use std::time::Duration;

use futures_util::StreamExt;
use quarry_api::{
    FnHandler, HandlerError, JobDraft, JobResult, Queue, SubmitOptions,
};
use quarry_core::Job;
use quarry_engine::{EngineConfig, JobHandlerRegistry};
use quarry_store::StoreConfig;
use serde_json::json;

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let mut handlers = JobHandlerRegistry::new();

    handlers.register(FnHandler::new("echo", |job: &Job, _ctx| {
        let payload = job.payload.clone();
        Box::pin(async move {
            tracing::info!("echo: {:?}", payload);
            Ok(JobResult::with_output("echo completed", payload))
        })
    }));

    handlers.register(FnHandler::new("count", |job: &Job, ctx| {
        let total = job.payload.get("to").and_then(|v| v.as_u64()).unwrap_or(5);
        Box::pin(async move {
            for n in 1..=total {
                tokio::time::sleep(Duration::from_millis(200)).await;
                ctx.report_progress(n, total)
                    .await
                    .map_err(|e| HandlerError::Retry(e.to_string()))?;
            }
            ctx.log("count finished")
                .await
                .map_err(|e| HandlerError::Retry(e.to_string()))?;
            Ok(JobResult::new(format!("counted to {total}")))
        })
    }));

    handlers.register(FnHandler::new("flaky", |job: &Job, _ctx| {
        let attempt = job.attempts;
        Box::pin(async move {
            if attempt < 2 {
                Err(HandlerError::Retry("not this time".into()))
            } else {
                Ok(JobResult::new("third time lucky"))
            }
        })
    }));

    let config = EngineConfig::default()
        .with_workers(2)
        .with_poll_interval(Duration::from_millis(50), Duration::from_millis(500))
        .with_housekeeping_interval(Duration::from_millis(200));
    let queue = Queue::start(StoreConfig::memory(), config, handlers).await?;

    // A little pipeline: count after echo, flaky on the side.
    let hello = JobDraft::new("echo", json!({"msg": "hello"}));
    let count = JobDraft::new("count", json!({"to": 5})).after(&hello);
    let count_id = count.id();
    queue.submit_graph(vec![hello, count]).await?;

    queue
        .submit(
            "flaky",
            json!({}),
            SubmitOptions {
                retries: 3,
                retry_wait: Some(Duration::from_millis(300)),
                ..Default::default()
            },
        )
        .await?;

    let mut events = queue.watch(count_id).await?;
    while let Some(event) = events.next().await {
        tracing::info!("{}", event.description());
    }

    let finished = queue.job(count_id).await?;
    tracing::info!(
        "pipeline done: {} ({:?})",
        finished.state,
        finished.result.map(|r| r.summary)
    );

    queue.shutdown().await;
    Ok(())
}

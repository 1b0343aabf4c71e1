//! Worker actor: poll, claim, execute, report.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::Utc;
use futures_util::FutureExt;
use quarry_core::{Job, JobEvent, JobId};
use quarry_store::{JobStore, StoreError};
use ractor::{Actor, ActorProcessingErr, ActorRef};
use tokio::sync::broadcast;

use crate::config::EngineConfig;
use crate::handler::{HandlerError, JobContext, JobHandlerRegistry};
use crate::messages::WorkerMessage;
use crate::resolver::DependencyResolver;
use crate::scheduler::Scheduler;

/// State for the worker actor.
pub struct WorkerState {
    worker_id: String,
    scheduler: Scheduler,
    handlers: Arc<JobHandlerRegistry>,
    events: broadcast::Sender<JobEvent>,
    config: EngineConfig,
    /// Current idle poll interval; doubles while no work is found, resets
    /// on a successful claim.
    idle_interval: Duration,
}

/// Worker actor arguments.
pub struct WorkerArgs {
    pub worker_id: String,
    pub handlers: Arc<JobHandlerRegistry>,
    pub events: broadcast::Sender<JobEvent>,
    pub config: EngineConfig,
}

/// Worker actor that executes jobs.
pub struct WorkerActor;

impl Actor for WorkerActor {
    type Msg = WorkerMessage;
    type State = WorkerState;
    type Arguments = WorkerArgs;

    async fn pre_start(
        &self,
        myself: ActorRef<Self::Msg>,
        args: Self::Arguments,
    ) -> Result<Self::State, ActorProcessingErr> {
        tracing::info!("Starting worker: {}", args.worker_id);

        let state = WorkerState {
            worker_id: args.worker_id,
            scheduler: Scheduler::new(&args.config),
            handlers: args.handlers,
            events: args.events,
            idle_interval: args.config.poll_interval_min,
            config: args.config,
        };

        myself.send_message(WorkerMessage::Poll)?;
        Ok(state)
    }

    async fn handle(
        &self,
        myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        match message {
            WorkerMessage::Poll => {
                match state.scheduler.claim_next(&state.worker_id).await {
                    Ok(Some(job)) => {
                        state.idle_interval = state.config.poll_interval_min;
                        execute(state, job).await;
                        let _ = myself
                            .send_after(state.config.poll_interval_min, || WorkerMessage::Poll);
                    }
                    Ok(None) => {
                        state.idle_interval =
                            (state.idle_interval * 2).min(state.config.poll_interval_max);
                        let _ = myself.send_after(state.idle_interval, || WorkerMessage::Poll);
                    }
                    Err(e) => {
                        // Transient store trouble backs the poll off; it is
                        // never converted into a job failure.
                        tracing::warn!("worker {}: store unavailable: {}", state.worker_id, e);
                        state.idle_interval =
                            (state.idle_interval * 2).min(state.config.poll_interval_max);
                        let _ = myself.send_after(state.idle_interval, || WorkerMessage::Poll);
                    }
                }
            }

            WorkerMessage::Shutdown => {
                tracing::info!("Shutting down worker: {}", state.worker_id);
                myself.stop(None);
            }
        }

        Ok(())
    }
}

/// Run one claimed job to its reported outcome.
async fn execute(state: &mut WorkerState, job: Job) {
    let job_id = job.id;
    let worker_id = state.worker_id.clone();
    let started = std::time::Instant::now();

    let _ = state.events.send(JobEvent::Started {
        job_id,
        worker_id: worker_id.clone(),
        attempt: job.attempts,
        timestamp: Utc::now(),
    });

    // Keep the lease alive while the handler runs. The handler is never
    // interrupted; if the lease is lost the flag makes us discard the
    // result afterwards.
    let lease_lost = Arc::new(AtomicBool::new(false));
    let renewer = tokio::spawn(renew_lease_loop(
        job_id,
        worker_id.clone(),
        state.config.lease_duration,
        lease_lost.clone(),
    ));

    let outcome = match state.handlers.get(&job.job_type) {
        Some(handler) => {
            let ctx = JobContext::new(job_id, worker_id.clone(), state.events.clone());
            match AssertUnwindSafe(handler.handle(&job, ctx)).catch_unwind().await {
                Ok(result) => result,
                Err(_) => Err(HandlerError::Retry("handler panicked".into())),
            }
        }
        None => Err(HandlerError::Fatal(format!(
            "no handler for job type: {}",
            job.job_type
        ))),
    };

    renewer.abort();

    if lease_lost.load(Ordering::Acquire) {
        tracing::warn!(
            "worker {}: lease lost while running job {}; result discarded",
            worker_id,
            job_id
        );
        return;
    }

    let now = Utc::now();
    match outcome {
        Ok(result) => match JobStore::complete(job_id, &worker_id, &result, now).await {
            Ok(_) => {
                let _ = state.events.send(JobEvent::Completed {
                    job_id,
                    duration_ms: started.elapsed().as_millis() as u64,
                    timestamp: now,
                });

                // Unblock dependents right away; the housekeeping sweep is
                // the catch-all if this fails.
                match DependencyResolver::on_completed(job_id).await {
                    Ok(promoted) => {
                        for job in promoted {
                            let _ = state.events.send(JobEvent::Promoted {
                                job_id: job.id,
                                timestamp: Utc::now(),
                            });
                        }
                    }
                    Err(e) => tracing::warn!(
                        "dependency resolution after job {} failed: {}",
                        job_id,
                        e
                    ),
                }
            }
            Err(StoreError::LeaseExpired(_)) => {
                tracing::warn!(
                    "worker {}: stale completion report for job {}; dropped",
                    worker_id,
                    job_id
                );
            }
            Err(e) => {
                tracing::warn!(
                    "worker {}: could not commit completion of job {}: {}",
                    worker_id,
                    job_id,
                    e
                );
            }
        },

        Err(handler_err) => {
            let will_retry = !handler_err.is_fatal() && job.retries_remaining > 0;
            let retry_at = will_retry.then(|| {
                now + chrono::Duration::from_std(job.retry_delay())
                    .unwrap_or_else(|_| chrono::Duration::seconds(0))
            });

            match JobStore::fail(job_id, &worker_id, handler_err.message(), retry_at, now).await {
                Ok(updated) => {
                    let _ = state.events.send(JobEvent::Failed {
                        job_id,
                        error: handler_err.message().to_string(),
                        retries_remaining: updated.retries_remaining,
                        will_retry,
                        timestamp: now,
                    });
                }
                Err(StoreError::LeaseExpired(_)) => {
                    tracing::warn!(
                        "worker {}: stale failure report for job {}; dropped",
                        worker_id,
                        job_id
                    );
                }
                Err(e) => {
                    tracing::warn!(
                        "worker {}: could not commit failure of job {}: {}",
                        worker_id,
                        job_id,
                        e
                    );
                }
            }
        }
    }
}

/// Renew the lease at a third of its duration until aborted or lost.
async fn renew_lease_loop(
    job_id: JobId,
    worker_id: String,
    lease_duration: Duration,
    lost: Arc<AtomicBool>,
) {
    let period = lease_duration / 3;
    let mut interval = tokio::time::interval(period);
    interval.tick().await;

    loop {
        interval.tick().await;
        let now = Utc::now();
        let expires_at = now
            + chrono::Duration::from_std(lease_duration)
                .unwrap_or_else(|_| chrono::Duration::seconds(30));

        match JobStore::renew_lease(job_id, &worker_id, expires_at, now).await {
            Ok(Some(_)) => {}
            Ok(None) => {
                tracing::warn!(
                    "worker {}: lease on job {} no longer held",
                    worker_id,
                    job_id
                );
                lost.store(true, Ordering::Release);
                break;
            }
            // Transient store trouble; the next tick tries again. The
            // lease survives as long as one renewal lands per duration.
            Err(e) => {
                tracing::warn!(
                    "worker {}: lease renewal for job {} failed: {}",
                    worker_id,
                    job_id,
                    e
                );
            }
        }
    }
}

//! Supervisor actor: worker pool and the housekeeping tick.

use std::sync::Arc;

use chrono::Utc;
use quarry_core::JobEvent;
use quarry_store::JobStore;
use ractor::{Actor, ActorProcessingErr, ActorRef, SupervisionEvent};
use tokio::sync::broadcast;

use crate::config::EngineConfig;
use crate::handler::JobHandlerRegistry;
use crate::messages::{SupervisorMessage, WorkerMessage};
use crate::resolver::DependencyResolver;
use crate::worker::{WorkerActor, WorkerArgs};

/// State for the supervisor actor.
pub struct SupervisorState {
    /// All worker actors.
    pub workers: Vec<ActorRef<WorkerMessage>>,
    /// Event broadcaster shared with workers and subscribers.
    pub event_tx: broadcast::Sender<JobEvent>,
    /// Handler registry shared with workers.
    pub handlers: Arc<JobHandlerRegistry>,
}

/// Supervisor actor arguments.
pub struct SupervisorArgs {
    pub handlers: JobHandlerRegistry,
    pub config: EngineConfig,
}

/// Supervisor actor that owns the worker pool.
pub struct Supervisor;

impl Actor for Supervisor {
    type Msg = SupervisorMessage;
    type State = SupervisorState;
    type Arguments = SupervisorArgs;

    async fn pre_start(
        &self,
        myself: ActorRef<Self::Msg>,
        args: Self::Arguments,
    ) -> Result<Self::State, ActorProcessingErr> {
        tracing::info!("Starting job engine supervisor");

        let (event_tx, _) = broadcast::channel(1024);
        let handlers = Arc::new(args.handlers);

        let mut workers = Vec::with_capacity(args.config.workers);
        for n in 0..args.config.workers {
            let worker_args = WorkerArgs {
                worker_id: format!("worker-{}", n + 1),
                handlers: handlers.clone(),
                events: event_tx.clone(),
                config: args.config.clone(),
            };
            let (worker, _handle) =
                Actor::spawn_linked(None, WorkerActor, worker_args, myself.get_cell())
                    .await
                    .map_err(|e| {
                        ActorProcessingErr::from(format!("Failed to spawn worker: {}", e))
                    })?;
            workers.push(worker);
        }

        // Start the periodic housekeeping tick.
        let myself_clone = myself.clone();
        let period = args.config.housekeeping_interval;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                interval.tick().await;
                if myself_clone.send_message(SupervisorMessage::Tick).is_err() {
                    break;
                }
            }
        });

        Ok(SupervisorState {
            workers,
            event_tx,
            handlers,
        })
    }

    async fn handle(
        &self,
        myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        match message {
            SupervisorMessage::Tick => {
                housekeeping(state).await;
            }

            SupervisorMessage::Subscribe { reply } => {
                let _ = reply.send(state.event_tx.subscribe());
            }

            SupervisorMessage::Broadcast { event } => {
                let _ = state.event_tx.send(event);
            }

            SupervisorMessage::Shutdown => {
                tracing::info!("Shutting down supervisor");
                for worker in &state.workers {
                    let _ = worker.send_message(WorkerMessage::Shutdown);
                }
                myself.stop(None);
            }
        }

        Ok(())
    }

    async fn handle_supervisor_evt(
        &self,
        _myself: ActorRef<Self::Msg>,
        message: SupervisionEvent,
        _state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        if let SupervisionEvent::ActorTerminated(cell, _, reason) = message {
            tracing::warn!(
                "Worker {} terminated: {:?}",
                cell.get_name().unwrap_or_default(),
                reason
            );
        }
        Ok(())
    }
}

/// One housekeeping pass: reclaim lapsed leases, release due retries, and
/// sweep waiting jobs for promotions.
async fn housekeeping(state: &mut SupervisorState) {
    let now = Utc::now();

    match JobStore::reclaim_expired(now).await {
        Ok(reclaimed) => {
            for job in reclaimed {
                let worker_id = job
                    .lease
                    .as_ref()
                    .map(|l| l.worker_id.clone())
                    .unwrap_or_default();
                tracing::warn!("job {} reclaimed from {}", job.id, worker_id);
                let _ = state.event_tx.send(JobEvent::Reclaimed {
                    job_id: job.id,
                    worker_id,
                    timestamp: now,
                });
            }
        }
        Err(e) => tracing::warn!("lease reclamation failed: {}", e),
    }

    match JobStore::release_due_retries(now).await {
        Ok(released) => {
            for job in released {
                let _ = state.event_tx.send(JobEvent::RetryReady {
                    job_id: job.id,
                    retries_remaining: job.retries_remaining,
                    timestamp: now,
                });
            }
        }
        Err(e) => tracing::warn!("retry release failed: {}", e),
    }

    match DependencyResolver::sweep().await {
        Ok(promoted) => {
            for job in promoted {
                let _ = state.event_tx.send(JobEvent::Promoted {
                    job_id: job.id,
                    timestamp: now,
                });
            }
        }
        Err(e) => tracing::warn!("dependency sweep failed: {}", e),
    }
}

/// Start the engine: the supervisor, its worker pool, and housekeeping.
pub async fn start_engine(
    handlers: JobHandlerRegistry,
    config: EngineConfig,
) -> Result<(ActorRef<SupervisorMessage>, tokio::task::JoinHandle<()>), ractor::SpawnErr> {
    let (actor, handle) = Actor::spawn(None, Supervisor, SupervisorArgs { handlers, config }).await?;
    Ok((actor, handle))
}

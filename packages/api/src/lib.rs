//! Caller-facing surface of the quarry job queue.
//!
//! [`Queue::start`] initializes the store, spawns the engine, and returns a
//! handle for submitting work, cancelling and restarting jobs, and
//! subscribing to progress.
//!
//! ```ignore
//! let mut handlers = JobHandlerRegistry::new();
//! handlers.register(FnHandler::new("echo", |job, _ctx| { ... }));
//!
//! let queue = Queue::start(StoreConfig::memory(), EngineConfig::default(), handlers).await?;
//! let id = queue.submit("echo", json!({"msg": "hi"}), SubmitOptions::default()).await?;
//! let mut events = queue.watch(id).await?;
//! while let Some(event) = events.next().await { ... }
//! ```

mod error;
mod submit;
mod watch;

use std::time::Duration;

use quarry_core::{Job, JobEvent, JobId};
use quarry_engine::{EngineConfig, JobHandlerRegistry, SupervisorMessage, start_engine};
use quarry_store::{JobFilter, JobStore, StoreConfig};
use ractor::ActorRef;
use tokio::sync::broadcast;

pub use error::ApiError;
pub use submit::{JobDraft, SubmitOptions};
pub use watch::JobEventStream;

// Re-export what callers need to define handlers and configure the system.
pub use quarry_core::{Backoff, JobResult, JobState};
pub use quarry_engine::{FnHandler, HandlerError, JobContext, JobHandler};

/// Timeout for control calls into the supervisor.
const CONTROL_TIMEOUT: Duration = Duration::from_secs(5);

/// Handle to a running job queue.
pub struct Queue {
    supervisor: ActorRef<SupervisorMessage>,
    engine: tokio::task::JoinHandle<()>,
}

impl Queue {
    /// Initialize the store, start the engine, and return the handle.
    pub async fn start(
        store: StoreConfig,
        engine: EngineConfig,
        handlers: JobHandlerRegistry,
    ) -> Result<Self, ApiError> {
        quarry_store::init(store).await?;

        let (supervisor, handle) = start_engine(handlers, engine)
            .await
            .map_err(|e| ApiError::Engine(e.to_string()))?;

        tracing::info!("Job queue started");
        Ok(Self {
            supervisor,
            engine: handle,
        })
    }

    /// Submit one job. See [`SubmitOptions`] for policy knobs.
    pub async fn submit(
        &self,
        job_type: impl Into<String>,
        payload: serde_json::Value,
        options: SubmitOptions,
    ) -> Result<JobId, ApiError> {
        submit::submit(self, job_type.into(), payload, options).await
    }

    /// Submit a dependency graph of jobs. The whole graph is validated
    /// before anything is inserted; a cycle rejects the batch.
    pub async fn submit_graph(&self, drafts: Vec<JobDraft>) -> Result<Vec<JobId>, ApiError> {
        submit::submit_graph(self, drafts).await
    }

    /// Cancel a job. A no-op if it is already terminal; a running job keeps
    /// executing until its worker notices at renewal or report time.
    pub async fn cancel(&self, id: JobId, reason: Option<String>) -> Result<(), ApiError> {
        let now = chrono::Utc::now();
        if let Some(job) = JobStore::cancel(id, reason.clone(), now).await? {
            self.publish(JobEvent::Cancelled {
                job_id: job.id,
                reason,
                timestamp: now,
            });
        }
        Ok(())
    }

    /// Reset a terminal job for a fresh run, optionally with a new payload
    /// and retry budget.
    pub async fn restart(
        &self,
        id: JobId,
        new_payload: Option<serde_json::Value>,
        retries: u32,
    ) -> Result<Job, ApiError> {
        let now = chrono::Utc::now();
        let job = JobStore::restart(id, new_payload, retries, now).await?;
        self.publish(JobEvent::Restarted {
            job_id: job.id,
            timestamp: now,
        });
        Ok(job)
    }

    /// Get a job by id.
    pub async fn job(&self, id: JobId) -> Result<Job, ApiError> {
        Ok(JobStore::get(id).await?)
    }

    /// List jobs, highest priority first.
    pub async fn jobs(&self, filter: JobFilter) -> Result<Vec<Job>, ApiError> {
        Ok(JobStore::list(filter).await?)
    }

    /// Subscribe to all queue events.
    pub async fn subscribe(&self) -> Result<broadcast::Receiver<JobEvent>, ApiError> {
        match ractor::rpc::call(
            &self.supervisor,
            |reply| SupervisorMessage::Subscribe { reply },
            Some(CONTROL_TIMEOUT),
        )
        .await
        {
            Ok(ractor::rpc::CallResult::Success(rx)) => Ok(rx),
            other => Err(ApiError::Engine(format!("subscribe failed: {other:?}"))),
        }
    }

    /// Lazy, restartable stream of one job's events, ending at its terminal
    /// state. Already-terminal jobs produce an empty stream.
    pub async fn watch(&self, id: JobId) -> Result<JobEventStream, ApiError> {
        watch::watch(self, id).await
    }

    /// Stop the workers and the supervisor, then wait for them.
    pub async fn shutdown(self) {
        let _ = self.supervisor.send_message(SupervisorMessage::Shutdown);
        let _ = self.engine.await;
        tracing::info!("Job queue stopped");
    }

    pub(crate) fn publish(&self, event: JobEvent) {
        let _ = self
            .supervisor
            .send_message(SupervisorMessage::Broadcast { event });
    }
}

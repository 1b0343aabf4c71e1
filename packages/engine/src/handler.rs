//! Job handler trait, execution context, and registry.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use chrono::Utc;
use quarry_core::{Job, JobError, JobEvent, JobId, JobResult};
use quarry_store::{JobStore, StoreError};
use tokio::sync::broadcast;

/// Failure disposition reported by a handler.
#[derive(Debug, Clone)]
pub enum HandlerError {
    /// Count against the retry budget and re-run after the backoff wait.
    Retry(String),
    /// Terminal regardless of remaining retries.
    Fatal(String),
}

impl HandlerError {
    pub fn message(&self) -> &str {
        match self {
            HandlerError::Retry(m) | HandlerError::Fatal(m) => m,
        }
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, HandlerError::Fatal(_))
    }
}

impl From<String> for HandlerError {
    fn from(message: String) -> Self {
        HandlerError::Retry(message)
    }
}

impl From<&str> for HandlerError {
    fn from(message: &str) -> Self {
        HandlerError::Retry(message.to_string())
    }
}

/// Result type for job handlers.
pub type HandlerResult = Result<JobResult, HandlerError>;

/// Future type for async job handlers.
pub type HandlerFuture = Pin<Box<dyn Future<Output = HandlerResult> + Send>>;

/// Errors from context reporting calls.
#[derive(Debug, thiserror::Error)]
pub enum ReportError {
    #[error(transparent)]
    Invalid(#[from] JobError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Reporting handle given to the executing handler.
///
/// Progress and log writes are committed through the store, conditioned on
/// the worker still holding the job's lease; a write after the lease lapsed
/// returns [`StoreError::LeaseExpired`] and changes nothing.
#[derive(Clone)]
pub struct JobContext {
    job_id: JobId,
    worker_id: String,
    events: broadcast::Sender<JobEvent>,
}

impl JobContext {
    pub(crate) fn new(
        job_id: JobId,
        worker_id: String,
        events: broadcast::Sender<JobEvent>,
    ) -> Self {
        Self {
            job_id,
            worker_id,
            events,
        }
    }

    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Record progress for the current run. `completed` may never exceed
    /// `total` nor move backwards.
    pub async fn report_progress(&self, completed: u64, total: u64) -> Result<(), ReportError> {
        if completed > total {
            return Err(JobError::InvalidProgress { completed, total }.into());
        }
        let now = Utc::now();
        let job = JobStore::set_progress(self.job_id, &self.worker_id, completed, total, now)
            .await?;
        let _ = self.events.send(JobEvent::Progressed {
            job_id: self.job_id,
            progress: job.progress,
            timestamp: now,
        });
        Ok(())
    }

    /// Append a line to the job's log.
    pub async fn log(&self, message: impl Into<String>) -> Result<(), ReportError> {
        let message = message.into();
        let now = Utc::now();
        JobStore::append_log(self.job_id, &message, now).await?;
        let _ = self.events.send(JobEvent::Logged {
            job_id: self.job_id,
            message,
            timestamp: now,
        });
        Ok(())
    }
}

/// Trait for job handlers.
///
/// Implement this trait to define how jobs of a specific type are processed.
pub trait JobHandler: Send + Sync + 'static {
    /// The job type this handler processes.
    fn job_type(&self) -> &str;

    /// Process a job and return the result.
    fn handle(&self, job: &Job, ctx: JobContext) -> HandlerFuture;
}

/// Registry for job handlers.
///
/// Maps job types to their handlers for dynamic dispatch; one handler per
/// type, the last registration wins.
#[derive(Default)]
pub struct JobHandlerRegistry {
    handlers: HashMap<String, Arc<dyn JobHandler>>,
}

impl JobHandlerRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Register a handler for a job type.
    pub fn register<H: JobHandler>(&mut self, handler: H) {
        let job_type = handler.job_type().to_string();
        self.handlers.insert(job_type, Arc::new(handler));
    }

    /// Get a handler for a job type.
    pub fn get(&self, job_type: &str) -> Option<Arc<dyn JobHandler>> {
        self.handlers.get(job_type).cloned()
    }

    /// Check if a handler exists for a job type.
    pub fn has_handler(&self, job_type: &str) -> bool {
        self.handlers.contains_key(job_type)
    }

    /// List all registered job types.
    pub fn job_types(&self) -> Vec<&str> {
        self.handlers.keys().map(|s| s.as_str()).collect()
    }
}

/// A simple function-based job handler.
pub struct FnHandler<F>
where
    F: Fn(&Job, JobContext) -> HandlerFuture + Send + Sync + 'static,
{
    job_type: String,
    handler: F,
}

impl<F> FnHandler<F>
where
    F: Fn(&Job, JobContext) -> HandlerFuture + Send + Sync + 'static,
{
    /// Create a new function-based handler.
    pub fn new(job_type: impl Into<String>, handler: F) -> Self {
        Self {
            job_type: job_type.into(),
            handler,
        }
    }
}

impl<F> JobHandler for FnHandler<F>
where
    F: Fn(&Job, JobContext) -> HandlerFuture + Send + Sync + 'static,
{
    fn job_type(&self) -> &str {
        &self.job_type
    }

    fn handle(&self, job: &Job, ctx: JobContext) -> HandlerFuture {
        (self.handler)(job, ctx)
    }
}

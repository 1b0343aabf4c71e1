//! Job submission: single jobs and dependency graphs.

use std::collections::{BTreeSet, HashMap};
use std::time::Duration;

use chrono::Utc;
use quarry_core::{Backoff, Job, JobEvent, JobId, JobState, toposort};
use quarry_engine::DependencyResolver;
use quarry_store::JobStore;
use serde_json::Value as JsonValue;

use crate::{ApiError, Queue};

/// Policy knobs accepted at submission.
#[derive(Debug, Clone, Default)]
pub struct SubmitOptions {
    /// Higher runs first among ready jobs.
    pub priority: i32,
    /// Worker-reported failures tolerated before the job fails terminally.
    pub retries: u32,
    /// Base wait before a retry; the job default applies when absent.
    pub retry_wait: Option<Duration>,
    /// Backoff curve over the base wait.
    pub backoff: Option<Backoff>,
    /// Jobs that must complete before this one runs.
    pub depends_on: BTreeSet<JobId>,
    /// Hold the job back for this long after submission.
    pub delay: Option<Duration>,
}

impl SubmitOptions {
    fn apply(self, job_type: String, payload: JsonValue) -> Job {
        let mut job = Job::new(job_type, payload)
            .with_priority(self.priority)
            .with_retries(self.retries);
        if let Some(wait) = self.retry_wait {
            job = job.with_retry_wait_ms(wait.as_millis() as u64);
        }
        if let Some(backoff) = self.backoff {
            job = job.with_backoff(backoff);
        }
        job = job.with_depends_on(self.depends_on);
        if let Some(delay) = self.delay {
            job = job.with_delay(delay);
        }
        job
    }
}

/// One job of a graph submission, with its id minted up front so later
/// drafts can depend on it.
#[derive(Debug, Clone)]
pub struct JobDraft {
    id: JobId,
    job_type: String,
    payload: JsonValue,
    options: SubmitOptions,
}

impl JobDraft {
    pub fn new(job_type: impl Into<String>, payload: JsonValue) -> Self {
        Self {
            id: JobId::new(),
            job_type: job_type.into(),
            payload,
            options: SubmitOptions::default(),
        }
    }

    /// The id this draft will be submitted under.
    pub fn id(&self) -> JobId {
        self.id
    }

    pub fn with_options(mut self, options: SubmitOptions) -> Self {
        self.options = options;
        self
    }

    /// Make this draft depend on another draft of the same batch.
    pub fn after(mut self, other: &JobDraft) -> Self {
        self.options.depends_on.insert(other.id);
        self
    }

    fn into_job(self) -> Job {
        let mut job = self.options.apply(self.job_type, self.payload);
        job.id = self.id;
        job
    }
}

/// Submit one job: validate, persist, announce, and promote immediately if
/// its dependencies are already complete.
pub(crate) async fn submit(
    queue: &Queue,
    job_type: String,
    payload: JsonValue,
    options: SubmitOptions,
) -> Result<JobId, ApiError> {
    let job = options.apply(job_type, payload);
    job.validate()?;
    ensure_dependencies_exist(&job.depends_on).await?;

    let inserted = JobStore::insert(&job).await?;
    tracing::info!("job {} submitted ({})", inserted.id, inserted.job_type);
    queue.publish(JobEvent::Submitted {
        job: inserted.clone(),
        timestamp: Utc::now(),
    });

    promote_if_unblocked(queue, &inserted).await?;
    Ok(inserted.id)
}

/// Submit a dependency graph. The whole batch is toposorted first — a cycle
/// rejects it with nothing inserted — then persisted leaves-first. Returns
/// ids in the order the drafts were given.
pub(crate) async fn submit_graph(
    queue: &Queue,
    drafts: Vec<JobDraft>,
) -> Result<Vec<JobId>, ApiError> {
    let submitted_order: Vec<JobId> = drafts.iter().map(JobDraft::id).collect();

    let mut jobs: HashMap<JobId, Job> = HashMap::with_capacity(drafts.len());
    let mut edges: HashMap<JobId, BTreeSet<JobId>> = HashMap::with_capacity(drafts.len());
    let mut external: BTreeSet<JobId> = BTreeSet::new();
    for draft in drafts {
        let job = draft.into_job();
        job.validate()?;
        edges.insert(job.id, job.depends_on.clone());
        jobs.insert(job.id, job);
    }
    for deps in edges.values() {
        for dep in deps {
            if !edges.contains_key(dep) {
                external.insert(*dep);
            }
        }
    }

    let order = toposort(&edges)?;
    ensure_dependencies_exist(&external).await?;

    for id in order {
        let job = jobs.remove(&id).expect("toposort covers every draft");
        let inserted = JobStore::insert(&job).await?;
        queue.publish(JobEvent::Submitted {
            job: inserted.clone(),
            timestamp: Utc::now(),
        });
        promote_if_unblocked(queue, &inserted).await?;
    }

    tracing::info!("graph of {} jobs submitted", submitted_order.len());
    Ok(submitted_order)
}

/// Reject submissions that name a dependency the store has never seen.
async fn ensure_dependencies_exist(depends_on: &BTreeSet<JobId>) -> Result<(), ApiError> {
    if depends_on.is_empty() {
        return Ok(());
    }
    let states = JobStore::dependency_states(depends_on).await?;
    for dep in depends_on {
        if !states.contains_key(dep) {
            return Err(ApiError::UnknownDependency(*dep));
        }
    }
    Ok(())
}

/// A job submitted behind already-completed prerequisites becomes ready at
/// once instead of waiting for the next sweep.
async fn promote_if_unblocked(queue: &Queue, job: &Job) -> Result<(), ApiError> {
    if job.state != JobState::Waiting {
        return Ok(());
    }
    if let Some(promoted) = DependencyResolver::try_promote(job).await? {
        queue.publish(JobEvent::Promoted {
            job_id: promoted.id,
            timestamp: Utc::now(),
        });
    }
    Ok(())
}

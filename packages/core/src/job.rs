//! Job domain types for work items in the queue.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use ulid::Ulid;

use crate::error::JobError;
use crate::retry::Backoff;
use crate::state::JobState;

/// Unique identifier for a job, using ULID for chronological sorting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub Ulid);

impl JobId {
    /// Create a new unique job ID.
    pub fn new() -> Self {
        Self(Ulid::new())
    }

    /// Parse a job ID from a string.
    pub fn parse(s: &str) -> Result<Self, ulid::DecodeError> {
        Ok(Self(Ulid::from_string(s)?))
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Priority bounds accepted at submission.
pub const PRIORITY_MIN: i32 = -1_000;
pub const PRIORITY_MAX: i32 = 1_000;

/// Largest retry budget accepted at submission.
pub const RETRIES_MAX: u32 = 100;

/// Time-boxed claim a worker holds while a job runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    /// Worker that claimed the job.
    pub worker_id: String,
    /// Instant after which the job may be reclaimed.
    pub expires_at: DateTime<Utc>,
}

impl Lease {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    /// Whether `worker_id` still holds a live claim at `now`.
    pub fn held_by(&self, worker_id: &str, now: DateTime<Utc>) -> bool {
        self.worker_id == worker_id && !self.is_expired(now)
    }
}

/// Completion counters reported by the executing worker.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Progress {
    pub completed: u64,
    pub total: u64,
}

impl Progress {
    /// Fraction done, if a total has been announced.
    pub fn percent(&self) -> Option<f64> {
        if self.total == 0 {
            None
        } else {
            Some((self.completed as f64 / self.total as f64) * 100.0)
        }
    }
}

/// One timestamped line in a job's append-only log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub at: DateTime<Utc>,
    pub message: String,
}

/// Result of a completed job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobResult {
    /// Human-readable summary of the result.
    pub summary: String,
    /// Optional structured output data as JSON.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<JsonValue>,
}

impl JobResult {
    pub fn new(summary: impl Into<String>) -> Self {
        Self {
            summary: summary.into(),
            output: None,
        }
    }

    pub fn with_output(summary: impl Into<String>, output: JsonValue) -> Self {
        Self {
            summary: summary.into(),
            output: Some(output),
        }
    }
}

/// A job represents one schedulable unit of work.
///
/// In-memory values are transient projections of the persisted record; the
/// store is the single source of truth, and every mutation becomes effective
/// only once committed there.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    /// Unique identifier for this job.
    pub id: JobId,
    /// Type of job (used for routing to handlers).
    pub job_type: String,
    /// Opaque payload handed to the handler.
    pub payload: JsonValue,
    /// Current lifecycle state.
    pub state: JobState,
    /// Execution priority; higher runs first among ready jobs.
    pub priority: i32,
    /// Remaining worker-reported-failure retries.
    pub retries_remaining: u32,
    /// Base wait before a retry, in milliseconds.
    pub retry_wait_ms: u64,
    /// How the retry wait grows across attempts.
    pub retry_backoff: Backoff,
    /// Number of claims so far.
    #[serde(default)]
    pub attempts: u32,
    /// Jobs that must complete before this one may become ready.
    #[serde(default)]
    pub depends_on: BTreeSet<JobId>,
    /// Completion counters for the current run.
    #[serde(default)]
    pub progress: Progress,
    /// Append-only log.
    #[serde(default)]
    pub log: Vec<LogEntry>,
    /// Present while (and only while) the job is running.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lease: Option<Lease>,
    /// Set on successful completion.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<JobResult>,
    /// Last worker-reported failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cancel_reason: Option<String>,
    /// Earliest claim time; carries both retry waits and delayed submission.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub not_before: Option<DateTime<Utc>>,
    /// When the job was created.
    pub created_at: DateTime<Utc>,
    /// When the job was last updated.
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// Create a new ready job with default policy.
    pub fn new(job_type: impl Into<String>, payload: JsonValue) -> Self {
        let now = Utc::now();
        Self {
            id: JobId::new(),
            job_type: job_type.into(),
            payload,
            state: JobState::Ready,
            priority: 0,
            retries_remaining: 0,
            retry_wait_ms: 5 * 60 * 1000,
            retry_backoff: Backoff::default(),
            attempts: 0,
            depends_on: BTreeSet::new(),
            progress: Progress::default(),
            log: Vec::new(),
            lease: None,
            result: None,
            last_error: None,
            cancel_reason: None,
            not_before: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Set the priority for this job.
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Set the retry budget for this job.
    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries_remaining = retries;
        self
    }

    /// Set the base retry wait.
    pub fn with_retry_wait_ms(mut self, wait_ms: u64) -> Self {
        self.retry_wait_ms = wait_ms;
        self
    }

    /// Set the backoff curve.
    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.retry_backoff = backoff;
        self
    }

    /// Set the prerequisites. A non-empty set starts the job in `waiting`.
    pub fn with_depends_on(mut self, depends_on: BTreeSet<JobId>) -> Self {
        self.state = if depends_on.is_empty() {
            JobState::Ready
        } else {
            JobState::Waiting
        };
        self.depends_on = depends_on;
        self
    }

    /// Hold the job back until the given instant.
    pub fn with_not_before(mut self, not_before: DateTime<Utc>) -> Self {
        self.not_before = Some(not_before);
        self
    }

    /// Hold the job back for the given duration from now.
    pub fn with_delay(self, delay: std::time::Duration) -> Self {
        let delta =
            chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::days(365));
        self.with_not_before(Utc::now() + delta)
    }

    /// Check submission-time constraints.
    pub fn validate(&self) -> Result<(), JobError> {
        if self.job_type.is_empty() {
            return Err(JobError::Validation("job type must not be empty".into()));
        }
        if !(PRIORITY_MIN..=PRIORITY_MAX).contains(&self.priority) {
            return Err(JobError::Validation(format!(
                "priority {} outside {}..={}",
                self.priority, PRIORITY_MIN, PRIORITY_MAX
            )));
        }
        if self.retries_remaining > RETRIES_MAX {
            return Err(JobError::Validation(format!(
                "retries {} exceed maximum {}",
                self.retries_remaining, RETRIES_MAX
            )));
        }
        if self.depends_on.contains(&self.id) {
            return Err(JobError::CyclicDependency(self.id));
        }
        Ok(())
    }

    /// Completed, cancelled, or failed with the retry budget exhausted.
    pub fn is_terminal(&self) -> bool {
        match self.state {
            JobState::Completed | JobState::Cancelled => true,
            JobState::Failed => self.retries_remaining == 0,
            _ => false,
        }
    }

    /// Whether the job carries an unexpired lease at `now`.
    pub fn has_live_lease(&self, now: DateTime<Utc>) -> bool {
        self.lease.as_ref().is_some_and(|l| !l.is_expired(now))
    }

    /// Record progress for the current run.
    ///
    /// Rejects reports on a job that is not running, totals that shrink
    /// below what is already completed, and counters that move backwards.
    pub fn apply_progress(&mut self, completed: u64, total: u64) -> Result<(), JobError> {
        if self.state != JobState::Running {
            return Err(JobError::ProgressOutsideRun(self.state));
        }
        if completed > total || completed < self.progress.completed {
            return Err(JobError::InvalidProgress { completed, total });
        }
        self.progress = Progress { completed, total };
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Append a line to the job log.
    pub fn record_log(&mut self, message: impl Into<String>) {
        self.log.push(LogEntry {
            at: Utc::now(),
            message: message.into(),
        });
    }

    /// Wait before the next run, from this job's policy and attempt count.
    pub fn retry_delay(&self) -> std::time::Duration {
        self.retry_backoff.delay(self.retry_wait_ms, self.attempts)
    }
}

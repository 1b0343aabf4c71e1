//! Event types emitted as jobs move through the lifecycle.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::job::{Job, JobId, Progress};

/// Events broadcast by the queue for subscribers and per-job watches.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum JobEvent {
    /// A job was accepted and persisted.
    Submitted { job: Job, timestamp: DateTime<Utc> },
    /// A waiting job's dependencies all completed.
    Promoted {
        job_id: JobId,
        timestamp: DateTime<Utc>,
    },
    /// A failed job's retry wait elapsed; it is claimable again.
    RetryReady {
        job_id: JobId,
        retries_remaining: u32,
        timestamp: DateTime<Utc>,
    },
    /// A worker claimed the job.
    Started {
        job_id: JobId,
        worker_id: String,
        attempt: u32,
        timestamp: DateTime<Utc>,
    },
    /// The executing worker reported progress.
    Progressed {
        job_id: JobId,
        progress: Progress,
        timestamp: DateTime<Utc>,
    },
    /// The executing worker appended a log line.
    Logged {
        job_id: JobId,
        message: String,
        timestamp: DateTime<Utc>,
    },
    /// The job finished successfully.
    Completed {
        job_id: JobId,
        duration_ms: u64,
        timestamp: DateTime<Utc>,
    },
    /// A worker reported a failure.
    Failed {
        job_id: JobId,
        error: String,
        retries_remaining: u32,
        will_retry: bool,
        timestamp: DateTime<Utc>,
    },
    /// A running job's lease expired and it returned to the ready pool.
    Reclaimed {
        job_id: JobId,
        worker_id: String,
        timestamp: DateTime<Utc>,
    },
    /// The job was cancelled.
    Cancelled {
        job_id: JobId,
        reason: Option<String>,
        timestamp: DateTime<Utc>,
    },
    /// A terminal job was reset and resubmitted.
    Restarted {
        job_id: JobId,
        timestamp: DateTime<Utc>,
    },
}

impl JobEvent {
    /// Get the timestamp of the event.
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            JobEvent::Submitted { timestamp, .. } => *timestamp,
            JobEvent::Promoted { timestamp, .. } => *timestamp,
            JobEvent::RetryReady { timestamp, .. } => *timestamp,
            JobEvent::Started { timestamp, .. } => *timestamp,
            JobEvent::Progressed { timestamp, .. } => *timestamp,
            JobEvent::Logged { timestamp, .. } => *timestamp,
            JobEvent::Completed { timestamp, .. } => *timestamp,
            JobEvent::Failed { timestamp, .. } => *timestamp,
            JobEvent::Reclaimed { timestamp, .. } => *timestamp,
            JobEvent::Cancelled { timestamp, .. } => *timestamp,
            JobEvent::Restarted { timestamp, .. } => *timestamp,
        }
    }

    /// Get the job this event concerns.
    pub fn job_id(&self) -> JobId {
        match self {
            JobEvent::Submitted { job, .. } => job.id,
            JobEvent::Promoted { job_id, .. } => *job_id,
            JobEvent::RetryReady { job_id, .. } => *job_id,
            JobEvent::Started { job_id, .. } => *job_id,
            JobEvent::Progressed { job_id, .. } => *job_id,
            JobEvent::Logged { job_id, .. } => *job_id,
            JobEvent::Completed { job_id, .. } => *job_id,
            JobEvent::Failed { job_id, .. } => *job_id,
            JobEvent::Reclaimed { job_id, .. } => *job_id,
            JobEvent::Cancelled { job_id, .. } => *job_id,
            JobEvent::Restarted { job_id, .. } => *job_id,
        }
    }

    /// Whether this event ends the stream of a watch on its job.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobEvent::Completed { .. }
                | JobEvent::Cancelled { .. }
                | JobEvent::Failed {
                    will_retry: false,
                    ..
                }
        )
    }

    /// Get a short description of this event for logging.
    pub fn description(&self) -> String {
        match self {
            JobEvent::Submitted { job, .. } => {
                format!("Job {} submitted ({})", job.id, job.job_type)
            }
            JobEvent::Promoted { job_id, .. } => format!("Job {} ready", job_id),
            JobEvent::RetryReady { job_id, .. } => format!("Job {} ready for retry", job_id),
            JobEvent::Started {
                job_id,
                worker_id,
                attempt,
                ..
            } => format!("Job {} started by {} (attempt {})", job_id, worker_id, attempt),
            JobEvent::Progressed {
                job_id, progress, ..
            } => format!(
                "Job {} progress {}/{}",
                job_id, progress.completed, progress.total
            ),
            JobEvent::Logged {
                job_id, message, ..
            } => format!("Job {}: {}", job_id, message),
            JobEvent::Completed {
                job_id,
                duration_ms,
                ..
            } => format!("Job {} completed in {}ms", job_id, duration_ms),
            JobEvent::Failed {
                job_id,
                error,
                will_retry,
                ..
            } => {
                let retry = if *will_retry { " (will retry)" } else { "" };
                format!("Job {} failed: {}{}", job_id, error, retry)
            }
            JobEvent::Reclaimed {
                job_id, worker_id, ..
            } => format!("Job {} reclaimed from {}", job_id, worker_id),
            JobEvent::Cancelled { job_id, reason, .. } => {
                let reason = reason.as_deref().unwrap_or("no reason");
                format!("Job {} cancelled: {}", job_id, reason)
            }
            JobEvent::Restarted { job_id, .. } => format!("Job {} restarted", job_id),
        }
    }
}

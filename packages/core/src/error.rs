//! Core error taxonomy.

use thiserror::Error;

use crate::job::JobId;
use crate::state::JobState;

/// Errors raised by the job entity and its validation rules.
#[derive(Debug, Error)]
pub enum JobError {
    /// Bad input at submission time.
    #[error("invalid job: {0}")]
    Validation(String),

    /// The submitted dependency graph contains a cycle.
    #[error("dependency cycle involving job {0}")]
    CyclicDependency(JobId),

    /// Progress report exceeds the total or moves backwards.
    #[error("invalid progress {completed}/{total}")]
    InvalidProgress { completed: u64, total: u64 },

    /// Progress reported for a job that is not running.
    #[error("progress reported while job is {0}")]
    ProgressOutsideRun(JobState),

    /// An edge that is not part of the lifecycle graph. This is a
    /// programming error, not an operational condition.
    #[error("illegal transition {from} -> {to}")]
    InvalidTransition { from: JobState, to: JobState },
}

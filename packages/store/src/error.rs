//! Store error taxonomy.

use thiserror::Error;

/// Errors surfaced by the job store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The connection was never initialized.
    #[error("store not initialized - call init first")]
    NotInitialized,

    /// Insert collided with an existing job id.
    #[error("duplicate job id {0}")]
    DuplicateId(String),

    /// No record for the given id.
    #[error("job not found: {0}")]
    NotFound(String),

    /// A lease-conditioned report arrived after the lease lapsed (or the
    /// job was cancelled out from under the worker). Callers log and drop.
    #[error("lease no longer held for job {0}")]
    LeaseExpired(String),

    /// The job is held by the reporting worker but the progress counters
    /// moved backwards.
    #[error("progress update rejected for job {0}")]
    ProgressRejected(String),

    /// Restart requested for a job that is not in a terminal state.
    #[error("job {0} is not restartable")]
    NotRestartable(String),

    /// Transient engine failure; callers back off and retry, never convert
    /// this into a job failure.
    #[error("store unavailable: {0}")]
    Unavailable(#[from] surrealdb::Error),

    /// A persisted record could not be mapped back to a job.
    #[error("corrupt job record: {0}")]
    Corrupt(String),
}

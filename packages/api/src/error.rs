//! API error taxonomy.

use quarry_core::{JobError, JobId};
use quarry_store::StoreError;
use thiserror::Error;

/// Errors surfaced to queue callers.
#[derive(Debug, Error)]
pub enum ApiError {
    /// Submission-time validation or cycle rejection.
    #[error(transparent)]
    Job(#[from] JobError),

    /// Store-level failure or rejection.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// A submitted job depends on an id the store has never seen.
    #[error("unknown dependency {0}")]
    UnknownDependency(JobId),

    /// The engine could not be started or reached.
    #[error("engine unavailable: {0}")]
    Engine(String),
}

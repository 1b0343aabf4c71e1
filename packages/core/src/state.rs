//! Job lifecycle states and the legal transitions between them.

use serde::{Deserialize, Serialize};

/// Lifecycle state of a job.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Waiting on unfinished dependencies.
    Waiting,
    /// Eligible for claiming by a worker.
    #[default]
    Ready,
    /// Claimed and executing under a lease.
    Running,
    /// Worker-reported failure; terminal once the retry budget is exhausted.
    Failed,
    /// Explicitly cancelled.
    Cancelled,
    /// Finished successfully.
    Completed,
}

impl JobState {
    /// Get a simple state string for display and store filters.
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Waiting => "waiting",
            JobState::Ready => "ready",
            JobState::Running => "running",
            JobState::Failed => "failed",
            JobState::Cancelled => "cancelled",
            JobState::Completed => "completed",
        }
    }

    /// Legal edges of the lifecycle graph.
    ///
    /// Restart of a terminal job is a separate explicit operation and is
    /// deliberately not an edge here. `Failed -> Ready` is only taken when
    /// the retry budget is non-zero; `Failed -> Cancelled` likewise — the
    /// retry-budget guard lives with the callers that hold the job.
    pub fn can_transition(from: JobState, to: JobState) -> bool {
        use JobState::*;
        matches!(
            (from, to),
            (Waiting, Ready)
                | (Ready, Running)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Ready)
                | (Failed, Ready)
                | (Waiting, Cancelled)
                | (Ready, Cancelled)
                | (Running, Cancelled)
                | (Failed, Cancelled)
        )
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

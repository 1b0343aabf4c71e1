//! Promotion of waiting jobs whose prerequisites completed.

use chrono::Utc;
use quarry_core::{Job, JobId, JobState};
use quarry_store::{JobStore, StoreError};

/// Decides when a waiting job becomes ready.
///
/// Safe under concurrent completions of several prerequisites of the same
/// dependent: every path re-checks the full dependency set against the
/// store rather than trusting a single notification, and the conditional
/// promotion admits exactly one winner. Dependents of a terminally failed
/// or cancelled prerequisite simply never pass the check and stay waiting.
///
/// The dependency graph is validated acyclic at submission time; nothing
/// here re-checks for cycles.
pub struct DependencyResolver;

impl DependencyResolver {
    /// React to the completion of `completed_id`: promote every dependent
    /// whose prerequisites are now all complete. Returns the promoted jobs.
    pub async fn on_completed(completed_id: JobId) -> Result<Vec<Job>, StoreError> {
        let dependents = JobStore::dependents_of(completed_id).await?;
        let mut promoted = Vec::new();
        for dependent in dependents {
            if let Some(job) = Self::try_promote(&dependent).await? {
                promoted.push(job);
            }
        }
        Ok(promoted)
    }

    /// Promote `job` if every prerequisite is complete.
    pub async fn try_promote(job: &Job) -> Result<Option<Job>, StoreError> {
        if job.state != JobState::Waiting {
            return Ok(None);
        }

        let states = JobStore::dependency_states(&job.depends_on).await?;
        let all_complete = job
            .depends_on
            .iter()
            .all(|dep| states.get(dep) == Some(&JobState::Completed));
        if !all_complete {
            return Ok(None);
        }

        let promoted = JobStore::promote_ready(job.id, Utc::now()).await?;
        if promoted.is_some() {
            tracing::debug!("job {} promoted to ready", job.id);
        }
        Ok(promoted)
    }

    /// Re-check every waiting job. Run periodically so a missed completion
    /// notification delays a promotion instead of losing it.
    pub async fn sweep() -> Result<Vec<Job>, StoreError> {
        let waiting = JobStore::waiting_jobs().await?;
        let mut promoted = Vec::new();
        for job in waiting {
            if let Some(job) = Self::try_promote(&job).await? {
                promoted.push(job);
            }
        }
        Ok(promoted)
    }
}

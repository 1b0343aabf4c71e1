//! Selection of the next job for a polling worker.

use chrono::Utc;
use quarry_core::Job;
use quarry_store::{JobStore, StoreError};

use crate::config::EngineConfig;

/// Contested claim rounds before reporting no work.
const CLAIM_ROUNDS: usize = 3;

/// Picks the highest-priority claimable job and claims it atomically.
///
/// Ordering is priority descending, then submission time ascending (FIFO
/// within a priority). Claiming is a per-record conditional update, so two
/// concurrent workers can never both receive the same job.
#[derive(Debug, Clone)]
pub struct Scheduler {
    claim_batch: usize,
    lease_duration: std::time::Duration,
}

impl Scheduler {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            claim_batch: config.claim_batch,
            lease_duration: config.lease_duration,
        }
    }

    /// Claim the next ready job for `worker_id`.
    ///
    /// An empty pool is `Ok(None)`, not an error; callers decide when to
    /// poll again. Losing every candidate of a batch to other workers
    /// re-scans a bounded number of rounds.
    pub async fn claim_next(&self, worker_id: &str) -> Result<Option<Job>, StoreError> {
        for _ in 0..CLAIM_ROUNDS {
            let now = Utc::now();
            let candidates = JobStore::ready_candidates(now, self.claim_batch).await?;
            if candidates.is_empty() {
                return Ok(None);
            }

            let expires_at = now
                + chrono::Duration::from_std(self.lease_duration)
                    .unwrap_or_else(|_| chrono::Duration::seconds(30));
            for candidate in candidates {
                if let Some(job) =
                    JobStore::try_claim(candidate.id, worker_id, expires_at, now).await?
                {
                    tracing::debug!("worker {} claimed job {}", worker_id, job.id);
                    return Ok(Some(job));
                }
            }
        }

        Ok(None)
    }
}

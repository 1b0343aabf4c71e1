//! Engine configuration.

use std::time::Duration;

/// Tunables for the worker pool and the housekeeping pass.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Number of workers to spawn.
    pub workers: usize,
    /// How long a claim lasts before it may be reclaimed.
    pub lease_duration: Duration,
    /// Poll interval after a successful claim.
    pub poll_interval_min: Duration,
    /// Poll interval ceiling while idle.
    pub poll_interval_max: Duration,
    /// Cadence of the reclaim / retry-release / dependency-sweep pass.
    pub housekeeping_interval: Duration,
    /// Ready candidates fetched per claim round.
    pub claim_batch: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            lease_duration: Duration::from_secs(30),
            poll_interval_min: Duration::from_millis(100),
            poll_interval_max: Duration::from_secs(5),
            housekeeping_interval: Duration::from_secs(1),
            claim_batch: 8,
        }
    }
}

impl EngineConfig {
    /// Set the number of workers.
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    /// Set the lease duration.
    pub fn with_lease_duration(mut self, lease_duration: Duration) -> Self {
        self.lease_duration = lease_duration;
        self
    }

    /// Set the idle poll interval bounds.
    pub fn with_poll_interval(mut self, min: Duration, max: Duration) -> Self {
        self.poll_interval_min = min;
        self.poll_interval_max = max;
        self
    }

    /// Set the housekeeping cadence.
    pub fn with_housekeeping_interval(mut self, interval: Duration) -> Self {
        self.housekeeping_interval = interval;
        self
    }
}

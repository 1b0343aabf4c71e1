//! Mapping between the in-memory job entity and the persisted record.
//!
//! The record keeps the job id as a plain `job_id` field so the
//! engine-assigned record id never collides with the domain id, and stores
//! timestamps as native datetimes so range predicates (claim eligibility,
//! lease expiry) compare correctly inside the engine.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use quarry_core::{Backoff, Job, JobId, JobResult, JobState, Lease, LogEntry, Progress};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use surrealdb::sql::Datetime;

use crate::error::StoreError;

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct LeaseRecord {
    pub worker_id: String,
    pub expires_at: Datetime,
}

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct LogRecord {
    pub at: Datetime,
    pub message: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct ProgressRecord {
    pub completed: u64,
    pub total: u64,
}

/// Persisted form of one job.
#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct JobRecord {
    pub job_id: String,
    pub job_type: String,
    pub payload: JsonValue,
    pub state: JobState,
    pub priority: i32,
    pub retries_remaining: u32,
    pub retry_wait_ms: u64,
    pub retry_backoff: Backoff,
    pub attempts: u32,
    pub depends_on: Vec<String>,
    pub progress: ProgressRecord,
    pub log: Vec<LogRecord>,
    pub lease: Option<LeaseRecord>,
    pub result: Option<JobResult>,
    pub last_error: Option<String>,
    pub cancel_reason: Option<String>,
    pub not_before: Option<Datetime>,
    pub created_at: Datetime,
    pub updated_at: Datetime,
}

impl JobRecord {
    pub fn from_job(job: &Job) -> Self {
        Self {
            job_id: job.id.to_string(),
            job_type: job.job_type.clone(),
            payload: job.payload.clone(),
            state: job.state,
            priority: job.priority,
            retries_remaining: job.retries_remaining,
            retry_wait_ms: job.retry_wait_ms,
            retry_backoff: job.retry_backoff,
            attempts: job.attempts,
            depends_on: job.depends_on.iter().map(JobId::to_string).collect(),
            progress: ProgressRecord {
                completed: job.progress.completed,
                total: job.progress.total,
            },
            log: job
                .log
                .iter()
                .map(|entry| LogRecord {
                    at: entry.at.into(),
                    message: entry.message.clone(),
                })
                .collect(),
            lease: job.lease.as_ref().map(|lease| LeaseRecord {
                worker_id: lease.worker_id.clone(),
                expires_at: lease.expires_at.into(),
            }),
            result: job.result.clone(),
            last_error: job.last_error.clone(),
            cancel_reason: job.cancel_reason.clone(),
            not_before: job.not_before.map(Datetime::from),
            created_at: job.created_at.into(),
            updated_at: job.updated_at.into(),
        }
    }

    pub fn try_into_job(self) -> Result<Job, StoreError> {
        let id = parse_id(&self.job_id)?;
        let depends_on: BTreeSet<JobId> = self
            .depends_on
            .iter()
            .map(|raw| parse_id(raw))
            .collect::<Result<_, _>>()?;

        Ok(Job {
            id,
            job_type: self.job_type,
            payload: self.payload,
            state: self.state,
            priority: self.priority,
            retries_remaining: self.retries_remaining,
            retry_wait_ms: self.retry_wait_ms,
            retry_backoff: self.retry_backoff,
            attempts: self.attempts,
            depends_on,
            progress: Progress {
                completed: self.progress.completed,
                total: self.progress.total,
            },
            log: self
                .log
                .into_iter()
                .map(|entry| LogEntry {
                    at: to_utc(entry.at),
                    message: entry.message,
                })
                .collect(),
            lease: self.lease.map(|lease| Lease {
                worker_id: lease.worker_id,
                expires_at: to_utc(lease.expires_at),
            }),
            result: self.result,
            last_error: self.last_error,
            cancel_reason: self.cancel_reason,
            not_before: self.not_before.map(to_utc),
            created_at: to_utc(self.created_at),
            updated_at: to_utc(self.updated_at),
        })
    }
}

fn parse_id(raw: &str) -> Result<JobId, StoreError> {
    JobId::parse(raw).map_err(|e| StoreError::Corrupt(format!("bad job id {raw}: {e}")))
}

fn to_utc(dt: Datetime) -> DateTime<Utc> {
    dt.into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn record_round_trip_preserves_the_job() {
        let dep = JobId::new();
        let mut job = Job::new("transcode", json!({"input": "a.wav"}))
            .with_priority(5)
            .with_retries(2)
            .with_backoff(Backoff::Linear)
            .with_depends_on(BTreeSet::from([dep]));
        job.state = JobState::Running;
        job.attempts = 1;
        job.lease = Some(Lease {
            worker_id: "worker-1".into(),
            expires_at: Utc::now() + chrono::Duration::seconds(30),
        });
        job.progress = Progress {
            completed: 2,
            total: 8,
        };
        job.record_log("claimed by worker-1");

        let back = JobRecord::from_job(&job).try_into_job().unwrap();
        assert_eq!(back.id, job.id);
        assert_eq!(back.state, job.state);
        assert_eq!(back.progress, job.progress);
        assert_eq!(back.depends_on, job.depends_on);
        assert_eq!(back.lease, job.lease);
        assert_eq!(back.retries_remaining, job.retries_remaining);
        assert_eq!(back.log.len(), 1);
    }

    #[test]
    fn corrupt_id_is_reported() {
        let job = Job::new("noop", json!({}));
        let mut record = JobRecord::from_job(&job);
        record.job_id = "not-a-ulid".into();
        assert!(matches!(
            record.try_into_job(),
            Err(StoreError::Corrupt(_))
        ));
    }
}

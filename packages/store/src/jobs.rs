//! Job persistence and the atomic conditional transitions.
//!
//! Every state-changing operation here is one conditional `UPDATE` whose
//! `WHERE` clause names the expected state (and lease, where relevant). An
//! update that matches nothing did not happen; callers receive `None` or a
//! classified error instead of a partially applied write. This is the only
//! coordination primitive workers share.

use std::collections::{BTreeSet, HashMap};

use chrono::{DateTime, Utc};
use quarry_core::{Job, JobId, JobResult, JobState};
use serde::Deserialize;
use surrealdb::sql::Datetime;

use crate::connection::get_db;
use crate::error::StoreError;
use crate::record::JobRecord;

/// Filter options for listing jobs.
#[derive(Debug, Default, Clone)]
pub struct JobFilter {
    pub state: Option<JobState>,
    pub job_type: Option<String>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

/// Store operations over persisted jobs.
pub struct JobStore;

impl JobStore {
    /// Persist a new job. Fails with [`StoreError::DuplicateId`] when the id
    /// is already present.
    pub async fn insert(job: &Job) -> Result<Job, StoreError> {
        let db = get_db()?;
        let record = JobRecord::from_job(job);

        let created: Option<JobRecord> = match db
            .create(("job", job.id.to_string()))
            .content(record)
            .await
        {
            Ok(created) => created,
            Err(e) => {
                if Self::fetch(job.id).await?.is_some() {
                    return Err(StoreError::DuplicateId(job.id.to_string()));
                }
                return Err(e.into());
            }
        };

        created
            .map(JobRecord::try_into_job)
            .transpose()?
            .ok_or_else(|| StoreError::Corrupt("create returned no record".into()))
    }

    /// Get a job by id, if present.
    pub async fn fetch(id: JobId) -> Result<Option<Job>, StoreError> {
        let db = get_db()?;
        let record: Option<JobRecord> = db.select(("job", id.to_string())).await?;
        record.map(JobRecord::try_into_job).transpose()
    }

    /// Get a job by id.
    pub async fn get(id: JobId) -> Result<Job, StoreError> {
        Self::fetch(id)
            .await?
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    /// List jobs with optional filtering, highest priority first, oldest
    /// first within a priority.
    pub async fn list(filter: JobFilter) -> Result<Vec<Job>, StoreError> {
        let db = get_db()?;

        let mut conditions = Vec::new();
        if filter.state.is_some() {
            conditions.push("state = $state");
        }
        if filter.job_type.is_some() {
            conditions.push("job_type = $job_type");
        }

        let where_clause = if conditions.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", conditions.join(" AND "))
        };
        let limit_clause = filter
            .limit
            .map(|l| format!("LIMIT {l}"))
            .unwrap_or_default();
        let offset_clause = filter
            .offset
            .map(|o| format!("START {o}"))
            .unwrap_or_default();

        let query = format!(
            "SELECT * FROM job {} ORDER BY priority DESC, created_at ASC {} {}",
            where_clause, limit_clause, offset_clause
        );

        let mut result = db.query(&query);
        if let Some(state) = filter.state {
            result = result.bind(("state", state.as_str()));
        }
        if let Some(job_type) = filter.job_type {
            result = result.bind(("job_type", job_type));
        }

        let mut response = result.await?;
        let records: Vec<JobRecord> = response.take(0)?;
        records.into_iter().map(JobRecord::try_into_job).collect()
    }

    /// Claimable jobs at `now`, in claim order.
    pub async fn ready_candidates(now: DateTime<Utc>, limit: usize) -> Result<Vec<Job>, StoreError> {
        let db = get_db()?;
        let mut response = db
            .query(
                r#"
                SELECT * FROM job
                WHERE state = 'ready' AND (not_before = NONE OR not_before <= $now)
                ORDER BY priority DESC, created_at ASC
                LIMIT $limit
                "#,
            )
            .bind(("now", Datetime::from(now)))
            .bind(("limit", limit as i64))
            .await?;

        let records: Vec<JobRecord> = response.take(0)?;
        records.into_iter().map(JobRecord::try_into_job).collect()
    }

    /// Atomically claim a ready job for `worker_id`.
    ///
    /// Returns `None` when another worker won the record or it stopped being
    /// claimable; exactly one concurrent caller can receive the job.
    pub async fn try_claim(
        id: JobId,
        worker_id: &str,
        expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>, StoreError> {
        let db = get_db()?;
        let mut response = db
            .query(
                r#"
                UPDATE type::thing('job', $id)
                SET state = 'running',
                    lease = { worker_id: $worker, expires_at: $expires },
                    attempts += 1,
                    progress = { completed: 0, total: 0 },
                    log += [{ at: $now, message: $note }],
                    updated_at = $now
                WHERE state = 'ready' AND (not_before = NONE OR not_before <= $now)
                RETURN AFTER
                "#,
            )
            .bind(("id", id.to_string()))
            .bind(("worker", worker_id.to_string()))
            .bind(("expires", Datetime::from(expires_at)))
            .bind(("now", Datetime::from(now)))
            .bind(("note", format!("claimed by {worker_id}")))
            .await?;

        let record: Option<JobRecord> = response.take(0)?;
        record.map(JobRecord::try_into_job).transpose()
    }

    /// Extend the lease held by `worker_id`. Returns `None` when the lease
    /// is no longer held (expired, reclaimed, or cancelled).
    pub async fn renew_lease(
        id: JobId,
        worker_id: &str,
        expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>, StoreError> {
        let db = get_db()?;
        let mut response = db
            .query(
                r#"
                UPDATE type::thing('job', $id)
                SET lease.expires_at = $expires, updated_at = $now
                WHERE state = 'running'
                  AND lease.worker_id = $worker
                  AND lease.expires_at > $now
                RETURN AFTER
                "#,
            )
            .bind(("id", id.to_string()))
            .bind(("worker", worker_id.to_string()))
            .bind(("expires", Datetime::from(expires_at)))
            .bind(("now", Datetime::from(now)))
            .await?;

        let record: Option<JobRecord> = response.take(0)?;
        record.map(JobRecord::try_into_job).transpose()
    }

    /// Commit a successful run, conditioned on a live lease.
    pub async fn complete(
        id: JobId,
        worker_id: &str,
        result: &JobResult,
        now: DateTime<Utc>,
    ) -> Result<Job, StoreError> {
        let db = get_db()?;
        let mut response = db
            .query(
                r#"
                UPDATE type::thing('job', $id)
                SET state = 'completed',
                    result = $result,
                    lease = NONE,
                    log += [{ at: $now, message: 'completed' }],
                    updated_at = $now
                WHERE state = 'running'
                  AND lease.worker_id = $worker
                  AND lease.expires_at > $now
                RETURN AFTER
                "#,
            )
            .bind(("id", id.to_string()))
            .bind(("worker", worker_id.to_string()))
            .bind(("result", result.clone()))
            .bind(("now", Datetime::from(now)))
            .await?;

        let record: Option<JobRecord> = response.take(0)?;
        match record {
            Some(record) => record.try_into_job(),
            None => Err(Self::classify_stale(id, worker_id, now).await?),
        }
    }

    /// Commit a worker-reported failure, conditioned on a live lease.
    ///
    /// `retry_at` present schedules a retry: the budget decrements by one
    /// and the job waits as `failed` until released. Absent, the failure is
    /// terminal and the remaining budget is zeroed (fatal reports).
    pub async fn fail(
        id: JobId,
        worker_id: &str,
        error: &str,
        retry_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<Job, StoreError> {
        let db = get_db()?;
        let note = format!("failed: {error}");

        let mut response = match retry_at {
            Some(retry_at) => {
                db.query(
                    r#"
                    UPDATE type::thing('job', $id)
                    SET state = 'failed',
                        retries_remaining -= 1,
                        last_error = $error,
                        not_before = $retry_at,
                        lease = NONE,
                        log += [{ at: $now, message: $note }],
                        updated_at = $now
                    WHERE state = 'running'
                      AND lease.worker_id = $worker
                      AND lease.expires_at > $now
                      AND retries_remaining > 0
                    RETURN AFTER
                    "#,
                )
                .bind(("id", id.to_string()))
                .bind(("worker", worker_id.to_string()))
                .bind(("error", error.to_string()))
                .bind(("retry_at", Datetime::from(retry_at)))
                .bind(("now", Datetime::from(now)))
                .bind(("note", note))
                .await?
            }
            None => {
                db.query(
                    r#"
                    UPDATE type::thing('job', $id)
                    SET state = 'failed',
                        retries_remaining = 0,
                        last_error = $error,
                        not_before = NONE,
                        lease = NONE,
                        log += [{ at: $now, message: $note }],
                        updated_at = $now
                    WHERE state = 'running'
                      AND lease.worker_id = $worker
                      AND lease.expires_at > $now
                    RETURN AFTER
                    "#,
                )
                .bind(("id", id.to_string()))
                .bind(("worker", worker_id.to_string()))
                .bind(("error", error.to_string()))
                .bind(("now", Datetime::from(now)))
                .bind(("note", note))
                .await?
            }
        };

        let record: Option<JobRecord> = response.take(0)?;
        match record {
            Some(record) => record.try_into_job(),
            None => Err(Self::classify_stale(id, worker_id, now).await?),
        }
    }

    /// Cancel a job. Terminal jobs are left untouched (`Ok(None)`); a
    /// running job keeps executing until its worker notices at renewal or
    /// report time.
    pub async fn cancel(
        id: JobId,
        reason: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>, StoreError> {
        let existing = Self::get(id).await?;
        if existing.is_terminal() {
            return Ok(None);
        }

        let db = get_db()?;
        let mut response = db
            .query(
                r#"
                UPDATE type::thing('job', $id)
                SET state = 'cancelled',
                    cancel_reason = $reason,
                    lease = NONE,
                    not_before = NONE,
                    log += [{ at: $now, message: 'cancelled' }],
                    updated_at = $now
                WHERE state IN ['waiting', 'ready', 'running']
                   OR (state = 'failed' AND retries_remaining > 0)
                RETURN AFTER
                "#,
            )
            .bind(("id", id.to_string()))
            .bind(("reason", reason))
            .bind(("now", Datetime::from(now)))
            .await?;

        let record: Option<JobRecord> = response.take(0)?;
        record.map(JobRecord::try_into_job).transpose()
    }

    /// Promote a waiting job whose dependencies have been verified complete.
    pub async fn promote_ready(id: JobId, now: DateTime<Utc>) -> Result<Option<Job>, StoreError> {
        let db = get_db()?;
        let mut response = db
            .query(
                r#"
                UPDATE type::thing('job', $id)
                SET state = 'ready',
                    log += [{ at: $now, message: 'dependencies complete' }],
                    updated_at = $now
                WHERE state = 'waiting'
                RETURN AFTER
                "#,
            )
            .bind(("id", id.to_string()))
            .bind(("now", Datetime::from(now)))
            .await?;

        let record: Option<JobRecord> = response.take(0)?;
        record.map(JobRecord::try_into_job).transpose()
    }

    /// Return every running job whose lease lapsed to the ready pool.
    ///
    /// The retry budget is untouched: a crashed worker is not a reported
    /// failure. Returns the jobs as they were when the lease lapsed, so
    /// callers can see which worker lost each one.
    pub async fn reclaim_expired(now: DateTime<Utc>) -> Result<Vec<Job>, StoreError> {
        let db = get_db()?;
        let mut response = db
            .query(
                r#"
                UPDATE job
                SET state = 'ready',
                    lease = NONE,
                    log += [{ at: $now, message: 'lease expired; returned to ready' }],
                    updated_at = $now
                WHERE state = 'running' AND lease != NONE AND lease.expires_at <= $now
                RETURN BEFORE
                "#,
            )
            .bind(("now", Datetime::from(now)))
            .await?;

        let records: Vec<JobRecord> = response.take(0)?;
        records.into_iter().map(JobRecord::try_into_job).collect()
    }

    /// Move failed jobs whose retry wait has elapsed back to ready.
    pub async fn release_due_retries(now: DateTime<Utc>) -> Result<Vec<Job>, StoreError> {
        let db = get_db()?;
        let mut response = db
            .query(
                r#"
                UPDATE job
                SET state = 'ready',
                    not_before = NONE,
                    log += [{ at: $now, message: 'retry wait elapsed' }],
                    updated_at = $now
                WHERE state = 'failed'
                  AND retries_remaining > 0
                  AND not_before != NONE
                  AND not_before <= $now
                RETURN AFTER
                "#,
            )
            .bind(("now", Datetime::from(now)))
            .await?;

        let records: Vec<JobRecord> = response.take(0)?;
        records.into_iter().map(JobRecord::try_into_job).collect()
    }

    /// All waiting jobs.
    pub async fn waiting_jobs() -> Result<Vec<Job>, StoreError> {
        Self::list(JobFilter {
            state: Some(JobState::Waiting),
            ..Default::default()
        })
        .await
    }

    /// Waiting jobs that name `id` as a prerequisite.
    pub async fn dependents_of(id: JobId) -> Result<Vec<Job>, StoreError> {
        let db = get_db()?;
        let mut response = db
            .query("SELECT * FROM job WHERE state = 'waiting' AND depends_on CONTAINS $id")
            .bind(("id", id.to_string()))
            .await?;

        let records: Vec<JobRecord> = response.take(0)?;
        records.into_iter().map(JobRecord::try_into_job).collect()
    }

    /// Current states of the given jobs. Ids with no record are absent from
    /// the result.
    pub async fn dependency_states(
        ids: &BTreeSet<JobId>,
    ) -> Result<HashMap<JobId, JobState>, StoreError> {
        if ids.is_empty() {
            return Ok(HashMap::new());
        }

        #[derive(Deserialize)]
        struct StateRow {
            job_id: String,
            state: JobState,
        }

        let db = get_db()?;
        let raw: Vec<String> = ids.iter().map(JobId::to_string).collect();
        let mut response = db
            .query("SELECT job_id, state FROM job WHERE job_id IN $ids")
            .bind(("ids", raw))
            .await?;

        let rows: Vec<StateRow> = response.take(0)?;
        rows.into_iter()
            .map(|row| {
                JobId::parse(&row.job_id)
                    .map(|id| (id, row.state))
                    .map_err(|e| StoreError::Corrupt(format!("bad job id {}: {e}", row.job_id)))
            })
            .collect()
    }

    /// Record run progress, conditioned on a live lease and monotonic
    /// counters.
    pub async fn set_progress(
        id: JobId,
        worker_id: &str,
        completed: u64,
        total: u64,
        now: DateTime<Utc>,
    ) -> Result<Job, StoreError> {
        let db = get_db()?;
        let mut response = db
            .query(
                r#"
                UPDATE type::thing('job', $id)
                SET progress = { completed: $completed, total: $total },
                    updated_at = $now
                WHERE state = 'running'
                  AND lease.worker_id = $worker
                  AND lease.expires_at > $now
                  AND progress.completed <= $completed
                RETURN AFTER
                "#,
            )
            .bind(("id", id.to_string()))
            .bind(("worker", worker_id.to_string()))
            .bind(("completed", completed as i64))
            .bind(("total", total as i64))
            .bind(("now", Datetime::from(now)))
            .await?;

        let record: Option<JobRecord> = response.take(0)?;
        match record {
            Some(record) => record.try_into_job(),
            None => {
                let current = Self::fetch(id).await?;
                let holds = |job: &Job| {
                    job.state == JobState::Running
                        && job
                            .lease
                            .as_ref()
                            .is_some_and(|lease| lease.held_by(worker_id, now))
                };
                match current {
                    None => Err(StoreError::NotFound(id.to_string())),
                    Some(job) if holds(&job) => {
                        Err(StoreError::ProgressRejected(id.to_string()))
                    }
                    Some(_) => Err(StoreError::LeaseExpired(id.to_string())),
                }
            }
        }
    }

    /// Append a line to a job's log.
    pub async fn append_log(
        id: JobId,
        message: &str,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let db = get_db()?;
        let mut response = db
            .query(
                r#"
                UPDATE type::thing('job', $id)
                SET log += [{ at: $now, message: $message }], updated_at = $now
                RETURN AFTER
                "#,
            )
            .bind(("id", id.to_string()))
            .bind(("message", message.to_string()))
            .bind(("now", Datetime::from(now)))
            .await?;

        let record: Option<JobRecord> = response.take(0)?;
        if record.is_none() {
            return Err(StoreError::NotFound(id.to_string()));
        }
        Ok(())
    }

    /// Reset a terminal job for a fresh run, optionally with a new payload
    /// and a new retry budget. The only path that may re-enter `waiting`.
    pub async fn restart(
        id: JobId,
        new_payload: Option<serde_json::Value>,
        retries: u32,
        now: DateTime<Utc>,
    ) -> Result<Job, StoreError> {
        let job = Self::get(id).await?;
        if !job.is_terminal() {
            return Err(StoreError::NotRestartable(id.to_string()));
        }

        let target = if job.depends_on.is_empty() {
            JobState::Ready
        } else {
            let states = Self::dependency_states(&job.depends_on).await?;
            let all_complete = job
                .depends_on
                .iter()
                .all(|dep| states.get(dep) == Some(&JobState::Completed));
            if all_complete {
                JobState::Ready
            } else {
                JobState::Waiting
            }
        };

        let payload = new_payload.unwrap_or_else(|| job.payload.clone());

        let db = get_db()?;
        let mut response = db
            .query(
                r#"
                UPDATE type::thing('job', $id)
                SET state = $target,
                    payload = $payload,
                    retries_remaining = $retries,
                    attempts = 0,
                    progress = { completed: 0, total: 0 },
                    result = NONE,
                    last_error = NONE,
                    cancel_reason = NONE,
                    lease = NONE,
                    not_before = NONE,
                    log += [{ at: $now, message: 'restarted' }],
                    updated_at = $now
                WHERE state = $observed
                  AND (state != 'failed' OR retries_remaining = 0)
                RETURN AFTER
                "#,
            )
            .bind(("id", id.to_string()))
            .bind(("target", target.as_str()))
            .bind(("payload", payload))
            .bind(("retries", retries as i64))
            .bind(("observed", job.state.as_str()))
            .bind(("now", Datetime::from(now)))
            .await?;

        let record: Option<JobRecord> = response.take(0)?;
        match record {
            Some(record) => record.try_into_job(),
            None => Err(StoreError::NotRestartable(id.to_string())),
        }
    }

    /// Work out why a lease-conditioned report matched nothing.
    async fn classify_stale(
        id: JobId,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> Result<StoreError, StoreError> {
        match Self::fetch(id).await? {
            None => Ok(StoreError::NotFound(id.to_string())),
            Some(job) => {
                tracing::debug!(
                    "stale report for job {} by {}: state={}, lease={:?}",
                    id,
                    worker_id,
                    job.state,
                    job.lease
                );
                Ok(StoreError::LeaseExpired(id.to_string()))
            }
        }
    }
}

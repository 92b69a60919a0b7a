//! Durable job queue: submission, atomic lease-based claim, heartbeats,
//! cancellation, and the append-only per-job event log.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rusqlite::{params, Row};
use std::collections::HashMap;
use std::time::Duration;

use super::{now_rfc3339, parse_rfc3339, OptionalExt, ResearchStore};
use crate::events::ResearchEvent;
use crate::types::error::StorageError;
use crate::types::{JobId, JobStatus};

/// A persisted job row.
#[derive(Debug, Clone)]
pub struct JobRecord {
    pub job_id: JobId,
    pub job_type: String,
    pub params: serde_json::Value,
    pub status: JobStatus,
    pub progress_percent: Option<f64>,
    pub progress_message: Option<String>,
    pub result: Option<serde_json::Value>,
    pub canceled: bool,
    pub idempotency_key: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub heartbeat_at: Option<DateTime<Utc>>,
}

/// Outcome of a submission, distinguishing idempotency hits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CreatedJob {
    Created(JobId),
    Duplicate(JobId),
}

impl CreatedJob {
    pub fn job_id(&self) -> &JobId {
        match self {
            CreatedJob::Created(id) | CreatedJob::Duplicate(id) => id,
        }
    }

    pub fn is_created(&self) -> bool {
        matches!(self, CreatedJob::Created(_))
    }
}

/// One row of the append-only event log.
#[derive(Debug, Clone)]
pub struct JobEventRow {
    pub id: i64,
    pub job_id: JobId,
    pub created_at: DateTime<Utc>,
    pub event_type: String,
    pub payload: serde_json::Value,
}

const JOB_COLUMNS: &str = "job_id, job_type, params_json, status, progress_percent,
     progress_message, result_json, canceled, idempotency_key,
     created_at, updated_at, started_at, finished_at, heartbeat_at";

fn row_to_job(row: &Row<'_>) -> rusqlite::Result<Result<JobRecord, StorageError>> {
    let job_id: String = row.get(0)?;
    let job_type: String = row.get(1)?;
    let params_json: String = row.get(2)?;
    let status_str: String = row.get(3)?;
    let progress_percent: Option<f64> = row.get(4)?;
    let progress_message: Option<String> = row.get(5)?;
    let result_json: Option<String> = row.get(6)?;
    let canceled: i64 = row.get(7)?;
    let idempotency_key: Option<String> = row.get(8)?;
    let created_str: String = row.get(9)?;
    let updated_str: String = row.get(10)?;
    let started_str: Option<String> = row.get(11)?;
    let finished_str: Option<String> = row.get(12)?;
    let heartbeat_str: Option<String> = row.get(13)?;

    Ok((|| -> Result<JobRecord, StorageError> {
        let parse_opt = |s: Option<String>| -> Result<Option<DateTime<Utc>>, StorageError> {
            s.map(|s| parse_rfc3339(&s)).transpose()
        };
        Ok(JobRecord {
            job_id: JobId(job_id),
            job_type,
            params: serde_json::from_str(&params_json)
                .map_err(|e| StorageError::database(format!("bad params json: {e}")))?,
            status: status_str
                .parse()
                .map_err(|e: String| StorageError::database(e))?,
            progress_percent,
            progress_message,
            result: result_json
                .map(|s| serde_json::from_str(&s))
                .transpose()
                .map_err(|e| StorageError::database(format!("bad result json: {e}")))?,
            canceled: canceled != 0,
            idempotency_key,
            created_at: parse_rfc3339(&created_str)?,
            updated_at: parse_rfc3339(&updated_str)?,
            started_at: parse_opt(started_str)?,
            finished_at: parse_opt(finished_str)?,
            heartbeat_at: parse_opt(heartbeat_str)?,
        })
    })())
}

impl ResearchStore {
    /// Insert a `queued` job. With an idempotency key, a prior submission
    /// within the TTL wins: the check is linearized with the insert by the
    /// unique constraint (`INSERT OR IGNORE` + read-back in one transaction).
    pub async fn create_job(
        &self,
        job_type: &str,
        params: serde_json::Value,
        idempotency_key: Option<String>,
    ) -> Result<CreatedJob, StorageError> {
        let job_type = job_type.to_string();
        let ttl = self.config().idempotency_ttl;
        self.with_retry("create_job", move |conn| {
            let tx = conn.unchecked_transaction()?;
            let job_id = JobId::generate();
            let now = now_rfc3339();

            if let Some(key) = &idempotency_key {
                // Expire a stale holder of the key so the new submission can
                // claim it.
                let cutoff = (Utc::now()
                    - ChronoDuration::from_std(ttl).unwrap_or_else(|_| ChronoDuration::hours(24)))
                .to_rfc3339();
                tx.execute(
                    "UPDATE jobs SET idempotency_key = NULL
                     WHERE idempotency_key = ?1 AND created_at < ?2",
                    params![key, cutoff],
                )?;
            }

            let inserted = tx.execute(
                "INSERT OR IGNORE INTO jobs
                    (job_id, job_type, params_json, status, canceled, idempotency_key,
                     created_at, updated_at)
                 VALUES (?1, ?2, ?3, 'queued', 0, ?4, ?5, ?5)",
                params![
                    job_id.as_str(),
                    job_type,
                    params.to_string(),
                    idempotency_key,
                    now
                ],
            )?;

            let result = if inserted > 0 {
                CreatedJob::Created(job_id)
            } else {
                let key = idempotency_key
                    .as_deref()
                    .ok_or_else(|| StorageError::database("job insert ignored without key"))?;
                let existing: String = tx.query_row(
                    "SELECT job_id FROM jobs WHERE idempotency_key = ?1",
                    params![key],
                    |row| row.get(0),
                )?;
                CreatedJob::Duplicate(JobId(existing))
            };
            tx.commit()?;
            Ok(result)
        })
        .await
    }

    /// Fetch a job by id.
    pub async fn get_job(&self, job_id: &JobId) -> Result<Option<JobRecord>, StorageError> {
        let id = job_id.clone();
        self.with_retry("get_job", move |conn| {
            let mut stmt =
                conn.prepare(&format!("SELECT {JOB_COLUMNS} FROM jobs WHERE job_id = ?1"))?;
            match stmt
                .query_row(params![id.as_str()], row_to_job)
                .optional()?
            {
                Some(job) => Ok(Some(job?)),
                None => Ok(None),
            }
        })
        .await
    }

    /// Transition a job's status, optionally storing a result payload and
    /// stamping `finished_at`.
    pub async fn set_job_status(
        &self,
        job_id: &JobId,
        status: JobStatus,
        result: Option<serde_json::Value>,
        finished: bool,
    ) -> Result<(), StorageError> {
        let id = job_id.clone();
        self.with_retry("set_job_status", move |conn| {
            let now = now_rfc3339();
            let finished_at = finished.then(|| now.clone());
            let rows = conn.execute(
                "UPDATE jobs SET status = ?1, result_json = COALESCE(?2, result_json),
                     finished_at = COALESCE(?3, finished_at), updated_at = ?4
                 WHERE job_id = ?5",
                params![
                    status.as_str(),
                    result.as_ref().map(|v| v.to_string()),
                    finished_at,
                    now,
                    id.as_str()
                ],
            )?;
            if rows == 0 {
                return Err(StorageError::database(format!("job {id} not found")));
            }
            Ok(())
        })
        .await
    }

    /// Update structured progress.
    pub async fn set_job_progress(
        &self,
        job_id: &JobId,
        percent: f64,
        message: &str,
    ) -> Result<(), StorageError> {
        let id = job_id.clone();
        let message = message.to_string();
        self.with_retry("set_job_progress", move |conn| {
            conn.execute(
                "UPDATE jobs SET progress_percent = ?1, progress_message = ?2, updated_at = ?3
                 WHERE job_id = ?4",
                params![percent, message, now_rfc3339(), id.as_str()],
            )?;
            Ok(())
        })
        .await
    }

    /// Set the canceled flag and, for non-terminal jobs, the `canceled`
    /// status. Returns `false` when the job does not exist.
    pub async fn cancel_job(&self, job_id: &JobId) -> Result<bool, StorageError> {
        let id = job_id.clone();
        self.with_retry("cancel_job", move |conn| {
            let now = now_rfc3339();
            let rows = conn.execute(
                "UPDATE jobs SET canceled = 1,
                     status = CASE WHEN status IN ('queued','running') THEN 'canceled' ELSE status END,
                     finished_at = CASE WHEN status IN ('queued','running') THEN ?1 ELSE finished_at END,
                     updated_at = ?1
                 WHERE job_id = ?2",
                params![now, id.as_str()],
            )?;
            Ok(rows > 0)
        })
        .await
    }

    /// Atomically claim the next runnable job.
    ///
    /// Two single statements: (a) sweep `running` jobs whose heartbeat is
    /// older than the lease back to `queued`; (b) promote the oldest queued,
    /// non-canceled job to `running` and return it. This is the single
    /// serialization point for queue progress.
    pub async fn claim_next_job(
        &self,
        lease_timeout: Duration,
    ) -> Result<Option<JobRecord>, StorageError> {
        self.with_retry("claim_next_job", move |conn| {
            let now = Utc::now();
            let stale = (now
                - ChronoDuration::from_std(lease_timeout)
                    .unwrap_or_else(|_| ChronoDuration::seconds(60)))
            .to_rfc3339();
            let now = now.to_rfc3339();

            conn.execute(
                "UPDATE jobs SET status = 'queued', updated_at = ?1
                 WHERE status = 'running' AND canceled = 0
                   AND (heartbeat_at IS NULL OR heartbeat_at < ?2)",
                params![now, stale],
            )?;

            let mut stmt = conn.prepare(&format!(
                "UPDATE jobs SET status = 'running', started_at = ?1, heartbeat_at = ?1,
                     updated_at = ?1
                 WHERE job_id = (
                     SELECT job_id FROM jobs
                     WHERE status = 'queued' AND canceled = 0
                     ORDER BY created_at, job_id LIMIT 1
                 )
                 RETURNING {JOB_COLUMNS}"
            ))?;
            match stmt.query_row(params![now], row_to_job).optional()? {
                Some(job) => Ok(Some(job?)),
                None => Ok(None),
            }
        })
        .await
    }

    /// Refresh the lease. Returns the job's canceled flag so workers observe
    /// cancellation within one heartbeat interval.
    pub async fn heartbeat_job(&self, job_id: &JobId) -> Result<bool, StorageError> {
        let id = job_id.clone();
        self.with_retry("heartbeat_job", move |conn| {
            conn.execute(
                "UPDATE jobs SET heartbeat_at = ?1 WHERE job_id = ?2",
                params![now_rfc3339(), id.as_str()],
            )?;
            let canceled: i64 = conn.query_row(
                "SELECT canceled FROM jobs WHERE job_id = ?1",
                params![id.as_str()],
                |row| row.get(0),
            )?;
            Ok(canceled != 0)
        })
        .await
    }

    /// Append an event to the job's log. Returns the monotonic event id.
    pub async fn append_job_event(
        &self,
        job_id: &JobId,
        event: &ResearchEvent,
    ) -> Result<i64, StorageError> {
        let id = job_id.clone();
        let event_type = event.type_name().to_string();
        let payload = serde_json::to_string(event)
            .map_err(|e| StorageError::database(format!("serialize event: {e}")))?;
        self.with_retry("append_job_event", move |conn| {
            conn.execute(
                "INSERT INTO job_events (job_id, created_at, event_type, payload_json)
                 VALUES (?1, ?2, ?3, ?4)",
                params![id.as_str(), now_rfc3339(), event_type, payload],
            )?;
            Ok(conn.last_insert_rowid())
        })
        .await
    }

    /// Page the event log from `since_id` (exclusive), oldest first.
    pub async fn get_job_events(
        &self,
        job_id: &JobId,
        since_id: i64,
        limit: usize,
    ) -> Result<Vec<JobEventRow>, StorageError> {
        let id = job_id.clone();
        self.with_retry("get_job_events", move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, job_id, created_at, event_type, payload_json
                 FROM job_events WHERE job_id = ?1 AND id > ?2
                 ORDER BY id LIMIT ?3",
            )?;
            let mut rows = stmt.query(params![id.as_str(), since_id, limit as i64])?;
            let mut out = Vec::new();
            while let Some(row) = rows.next()? {
                let payload_json: String = row.get(4)?;
                out.push(JobEventRow {
                    id: row.get(0)?,
                    job_id: JobId(row.get(1)?),
                    created_at: parse_rfc3339(&row.get::<_, String>(2)?)?,
                    event_type: row.get(3)?,
                    payload: serde_json::from_str(&payload_json)
                        .map_err(|e| StorageError::database(format!("bad event json: {e}")))?,
                });
            }
            Ok(out)
        })
        .await
    }

    /// Job counts grouped by status.
    pub async fn count_jobs_by_status(&self) -> Result<HashMap<String, u64>, StorageError> {
        self.with_retry("count_jobs_by_status", |conn| {
            let mut stmt = conn.prepare("SELECT status, COUNT(*) FROM jobs GROUP BY status")?;
            let mut rows = stmt.query([])?;
            let mut out = HashMap::new();
            while let Some(row) = rows.next()? {
                out.insert(row.get::<_, String>(0)?, row.get::<_, i64>(1)? as u64);
            }
            Ok(out)
        })
        .await
    }

    /// Number of queued jobs (backpressure check on submission).
    pub async fn queued_job_count(&self) -> Result<u64, StorageError> {
        self.with_retry("queued_job_count", |conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM jobs WHERE status = 'queued'",
                [],
                |row| row.get(0),
            )?;
            Ok(count as u64)
        })
        .await
    }
}

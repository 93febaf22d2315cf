//! Postgres-backed job store.
//!
//! Every mutation runs in a transaction that first takes the job's row lock
//! (`SELECT ... FOR UPDATE`), applies the domain transition to the locked
//! state and writes the full row back. Two writers racing on the same job
//! serialize on the lock; the loser sees the winner's state and its
//! transition is rejected as [`JobStoreError::StaleTransition`].
//!
//! ## Error Mapping
//!
//! | SQLx Error | JobStoreError |
//! |------------|---------------|
//! | RowNotFound on a locked read | `NotFound` |
//! | Database (check violation `23514`) | `Invalid` |
//! | anything else | `Storage` |

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::instrument;
use uuid::Uuid;

use swarmrouter_core::{DomainResult, Job, JobId, JobStatus, NewJob, ValidatorId};

use super::store::{JobStore, JobStoreConfig, JobStoreError};

const SELECT_JOB: &str = r#"
    SELECT
        id, requester, prompt, model, max_tokens, paid_amount, payment_proof,
        status, assigned_validator, validator_endpoint, result, error_message,
        retry_count, timeout_at, started_at, completed_at,
        refund_signature, refund_retry_count, refund_last_attempt_at,
        refund_alert_count, refund_last_alert_at, refund_unconfirmed_alert_at,
        refund_confirmed_at, created_at, updated_at
    FROM jobs
"#;

#[derive(Debug, Clone)]
pub struct PostgresJobStore {
    pool: Arc<PgPool>,
    config: JobStoreConfig,
}

impl PostgresJobStore {
    pub fn new(pool: PgPool, config: JobStoreConfig) -> Self {
        Self {
            pool: Arc::new(pool),
            config,
        }
    }

    /// Locked read-modify-write of one job.
    async fn mutate<F>(&self, operation: &'static str, id: JobId, f: F) -> Result<Job, JobStoreError>
    where
        F: FnOnce(&mut Job, DateTime<Utc>) -> DomainResult<()> + Send,
    {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error(operation, e))?;

        let sql = format!("{SELECT_JOB} WHERE id = $1 FOR UPDATE");
        let row = sqlx::query(&sql)
            .bind(id.as_uuid())
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error(operation, e))?
            .ok_or(JobStoreError::NotFound(id))?;

        let mut job = job_from_row(&row)?;
        // Dropping `tx` on error rolls back and releases the lock.
        f(&mut job, Utc::now())?;

        write_job(&mut tx, &job, operation).await?;
        tx.commit().await.map_err(|e| map_sqlx_error(operation, e))?;
        Ok(job)
    }

    /// `clause` follows the SELECT; `$1` is `now` and `$2` is `limit` when given.
    async fn fetch_jobs(
        &self,
        operation: &'static str,
        clause: &str,
        now: Option<DateTime<Utc>>,
        limit: Option<i64>,
    ) -> Result<Vec<Job>, JobStoreError> {
        let sql = format!("{SELECT_JOB} {clause}");
        let mut query = sqlx::query(&sql);
        if let Some(now) = now {
            query = query.bind(now);
        }
        if let Some(limit) = limit {
            query = query.bind(limit);
        }

        let rows = query
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error(operation, e))?;

        rows.iter().map(job_from_row).collect()
    }
}

#[async_trait]
impl JobStore for PostgresJobStore {
    #[instrument(skip(self, submission), err)]
    async fn create_job(&self, submission: NewJob) -> Result<Job, JobStoreError> {
        submission.validate()?;
        let job = Job::new(submission, Utc::now());

        sqlx::query(
            r#"
            INSERT INTO jobs (
                id, requester, prompt, model, max_tokens, paid_amount, payment_proof,
                status, retry_count, refund_retry_count, refund_alert_count,
                created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, 0, 0, 0, $9, $9)
            "#,
        )
        .bind(job.id.as_uuid())
        .bind(&job.requester)
        .bind(&job.prompt)
        .bind(&job.model)
        .bind(to_db_int::<i32, _>("max_tokens", job.max_tokens)?)
        .bind(to_db_int::<i64, _>("paid_amount", job.paid_amount)?)
        .bind(&job.payment_proof)
        .bind(job.status.as_str())
        .bind(job.created_at)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("create_job", e))?;

        Ok(job)
    }

    #[instrument(skip(self), fields(job_id = %id), err)]
    async fn get_job(&self, id: JobId) -> Result<Option<Job>, JobStoreError> {
        let sql = format!("{SELECT_JOB} WHERE id = $1");
        let row = sqlx::query(&sql)
            .bind(id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get_job", e))?;

        row.as_ref().map(job_from_row).transpose()
    }

    #[instrument(skip(self), fields(job_id = %id, validator = %validator), err)]
    async fn assign_validator(
        &self,
        id: JobId,
        validator: &ValidatorId,
        endpoint: &str,
    ) -> Result<Job, JobStoreError> {
        let window = self.config.processing_timeout;
        let validator = validator.clone();
        let endpoint = endpoint.to_string();
        self.mutate("assign_validator", id, move |job, now| {
            job.assign(validator, endpoint, now, window)
        })
        .await
    }

    #[instrument(skip(self, result, error), fields(job_id = %id, reporter = %reporter), err)]
    async fn update_job_status(
        &self,
        id: JobId,
        reporter: &ValidatorId,
        status: JobStatus,
        result: Option<String>,
        error: Option<String>,
    ) -> Result<Job, JobStoreError> {
        let reporter = reporter.clone();
        self.mutate("update_job_status", id, move |job, now| {
            job.finish(&reporter, status, result, error, now)
        })
        .await
    }

    #[instrument(skip(self, error), fields(job_id = %id, reporter = %reporter), err)]
    async fn record_failure(
        &self,
        id: JobId,
        reporter: &ValidatorId,
        error: String,
        max_retries: u32,
    ) -> Result<Job, JobStoreError> {
        let reporter = reporter.clone();
        let requeue = self.config.requeue.clone();
        self.mutate("record_failure", id, move |job, now| {
            job.fail(&reporter, error, max_retries, &requeue, now)
        })
        .await
    }

    #[instrument(skip(self), err)]
    async fn get_timed_out_jobs(&self) -> Result<Vec<Job>, JobStoreError> {
        self.fetch_jobs(
            "get_timed_out_jobs",
            "WHERE status = 'processing' AND timeout_at < $1 ORDER BY created_at ASC",
            Some(Utc::now()),
            None,
        )
        .await
    }

    #[instrument(skip(self), err)]
    async fn get_dispatchable_jobs(&self, limit: usize) -> Result<Vec<Job>, JobStoreError> {
        self.fetch_jobs(
            "get_dispatchable_jobs",
            "WHERE status = 'queued' AND (timeout_at IS NULL OR timeout_at <= $1) ORDER BY created_at ASC LIMIT $2",
            Some(Utc::now()),
            Some(i64::try_from(limit).unwrap_or(i64::MAX)),
        )
        .await
    }

    #[instrument(skip(self), fields(job_id = %id), err)]
    async fn handle_failure(&self, id: JobId, max_retries: u32) -> Result<Job, JobStoreError> {
        let requeue = self.config.requeue.clone();
        self.mutate("handle_failure", id, move |job, now| {
            job.apply_failure(max_retries, &requeue, now)
        })
        .await
    }

    #[instrument(skip(self), fields(job_id = %id), err)]
    async fn set_refund_signature(&self, id: JobId, signature: &str) -> Result<Job, JobStoreError> {
        let signature = signature.to_string();
        self.mutate("set_refund_signature", id, move |job, now| {
            job.attach_refund_signature(signature, now)
        })
        .await
    }

    #[instrument(skip(self), err)]
    async fn get_unsigned_refund_jobs(&self) -> Result<Vec<Job>, JobStoreError> {
        self.fetch_jobs(
            "get_unsigned_refund_jobs",
            "WHERE status = 'refunded' AND (refund_signature IS NULL OR refund_signature = '') ORDER BY created_at ASC",
            None,
            None,
        )
        .await
    }

    #[instrument(skip(self), err)]
    async fn get_jobs_by_status(&self, status: JobStatus) -> Result<Vec<Job>, JobStoreError> {
        // `as_str` is a closed set of literals.
        let clause = format!("WHERE status = '{}' ORDER BY created_at ASC", status.as_str());
        self.fetch_jobs("get_jobs_by_status", &clause, None, None).await
    }

    #[instrument(skip(self), fields(job_id = %id), err)]
    async fn increment_refund_retry(&self, id: JobId) -> Result<Job, JobStoreError> {
        self.mutate("increment_refund_retry", id, |job, now| job.record_refund_retry(now))
            .await
    }

    #[instrument(skip(self, ids), fields(count = ids.len()), err)]
    async fn mark_jobs_alerted(&self, ids: &[JobId]) -> Result<(), JobStoreError> {
        if ids.is_empty() {
            return Ok(());
        }
        let uuids: Vec<Uuid> = ids.iter().map(|id| *id.as_uuid()).collect();

        sqlx::query(
            r#"
            UPDATE jobs
            SET refund_alert_count = refund_alert_count + 1,
                refund_last_alert_at = $2,
                updated_at = $2
            WHERE id = ANY($1) AND status = 'refunded'
            "#,
        )
        .bind(&uuids)
        .bind(Utc::now())
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("mark_jobs_alerted", e))?;

        Ok(())
    }

    #[instrument(skip(self), fields(job_id = %id), err)]
    async fn mark_unconfirmed_alerted(&self, id: JobId) -> Result<Job, JobStoreError> {
        self.mutate("mark_unconfirmed_alerted", id, |job, now| {
            job.mark_unconfirmed_alerted(now)
        })
        .await
    }

    #[instrument(skip(self), fields(job_id = %id), err)]
    async fn confirm_refund(&self, id: JobId) -> Result<Job, JobStoreError> {
        self.mutate("confirm_refund", id, |job, now| job.confirm_refund(now))
            .await
    }

    #[instrument(skip(self), err)]
    async fn get_most_recent_refund_alert_timestamp(&self) -> Result<Option<DateTime<Utc>>, JobStoreError> {
        let row = sqlx::query("SELECT MAX(refund_last_alert_at) AS last_alert FROM jobs")
            .fetch_one(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get_most_recent_refund_alert_timestamp", e))?;

        row.try_get::<Option<DateTime<Utc>>, _>("last_alert")
            .map_err(|e| map_sqlx_error("get_most_recent_refund_alert_timestamp", e))
    }
}

async fn write_job(
    tx: &mut Transaction<'_, Postgres>,
    job: &Job,
    operation: &'static str,
) -> Result<(), JobStoreError> {
    sqlx::query(
        r#"
        UPDATE jobs SET
            status = $2,
            assigned_validator = $3,
            validator_endpoint = $4,
            result = $5,
            error_message = $6,
            retry_count = $7,
            timeout_at = $8,
            started_at = $9,
            completed_at = $10,
            refund_signature = $11,
            refund_retry_count = $12,
            refund_last_attempt_at = $13,
            refund_alert_count = $14,
            refund_last_alert_at = $15,
            refund_unconfirmed_alert_at = $16,
            refund_confirmed_at = $17,
            updated_at = $18
        WHERE id = $1
        "#,
    )
    .bind(job.id.as_uuid())
    .bind(job.status.as_str())
    .bind(job.assigned_validator.as_ref().map(ValidatorId::as_str))
    .bind(job.validator_endpoint.as_deref())
    .bind(job.result.as_deref())
    .bind(job.error_message.as_deref())
    .bind(to_db_int::<i32, _>("retry_count", job.retry_count)?)
    .bind(job.timeout_at)
    .bind(job.started_at)
    .bind(job.completed_at)
    .bind(job.refund_signature.as_deref())
    .bind(to_db_int::<i32, _>("refund_retry_count", job.refund_retry_count)?)
    .bind(job.refund_last_attempt_at)
    .bind(to_db_int::<i32, _>("refund_alert_count", job.refund_alert_count)?)
    .bind(job.refund_last_alert_at)
    .bind(job.refund_unconfirmed_alert_at)
    .bind(job.refund_confirmed_at)
    .bind(job.updated_at)
    .execute(&mut **tx)
    .await
    .map_err(|e| map_sqlx_error(operation, e))?;

    Ok(())
}

/// Narrow an unsigned field to its column type, rejecting values that do not fit.
fn to_db_int<T, U>(column: &str, value: U) -> Result<T, JobStoreError>
where
    T: TryFrom<U>,
    U: Copy + std::fmt::Display,
{
    T::try_from(value).map_err(|_| JobStoreError::Invalid(format!("{column} out of range: {value}")))
}

fn job_from_row(row: &PgRow) -> Result<Job, JobStoreError> {
    let decode = |e: sqlx::Error| JobStoreError::Storage(format!("failed to decode job row: {e}"));

    let status: String = row.try_get("status").map_err(decode)?;
    let status: JobStatus = status
        .parse()
        .map_err(|e| JobStoreError::Storage(format!("bad status in job row: {e}")))?;

    let assigned_validator = row
        .try_get::<Option<String>, _>("assigned_validator")
        .map_err(decode)?
        .map(ValidatorId::new)
        .transpose()
        .map_err(|e| JobStoreError::Storage(format!("bad validator id in job row: {e}")))?;

    let count = |col: &str| -> Result<u32, JobStoreError> {
        let raw: i32 = row.try_get(col).map_err(decode)?;
        Ok(u32::try_from(raw).unwrap_or(0))
    };

    Ok(Job {
        id: JobId::from_uuid(row.try_get("id").map_err(decode)?),
        requester: row.try_get("requester").map_err(decode)?,
        prompt: row.try_get("prompt").map_err(decode)?,
        model: row.try_get("model").map_err(decode)?,
        max_tokens: count("max_tokens")?,
        paid_amount: u64::try_from(row.try_get::<i64, _>("paid_amount").map_err(decode)?).unwrap_or(0),
        payment_proof: row.try_get("payment_proof").map_err(decode)?,
        status,
        assigned_validator,
        validator_endpoint: row.try_get("validator_endpoint").map_err(decode)?,
        result: row.try_get("result").map_err(decode)?,
        error_message: row.try_get("error_message").map_err(decode)?,
        retry_count: count("retry_count")?,
        timeout_at: row.try_get("timeout_at").map_err(decode)?,
        started_at: row.try_get("started_at").map_err(decode)?,
        completed_at: row.try_get("completed_at").map_err(decode)?,
        refund_signature: row.try_get("refund_signature").map_err(decode)?,
        refund_retry_count: count("refund_retry_count")?,
        refund_last_attempt_at: row.try_get("refund_last_attempt_at").map_err(decode)?,
        refund_alert_count: count("refund_alert_count")?,
        refund_last_alert_at: row.try_get("refund_last_alert_at").map_err(decode)?,
        refund_unconfirmed_alert_at: row.try_get("refund_unconfirmed_alert_at").map_err(decode)?,
        refund_confirmed_at: row.try_get("refund_confirmed_at").map_err(decode)?,
        created_at: row.try_get("created_at").map_err(decode)?,
        updated_at: row.try_get("updated_at").map_err(decode)?,
    })
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> JobStoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code().as_deref() {
                // Check constraint violation
                Some("23514") => JobStoreError::Invalid(msg),
                _ => JobStoreError::Storage(msg),
            }
        }
        sqlx::Error::PoolClosed => JobStoreError::Storage(format!("connection pool closed in {}", operation)),
        _ => JobStoreError::Storage(format!("sqlx error in {}: {}", operation, err)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn oversized_values_are_rejected_not_truncated() {
        assert_eq!(to_db_int::<i64, u64>("paid_amount", 10).unwrap(), 10);
        assert_eq!(to_db_int::<i32, u32>("retry_count", 3).unwrap(), 3);

        assert!(matches!(
            to_db_int::<i64, u64>("paid_amount", u64::MAX),
            Err(JobStoreError::Invalid(msg)) if msg.contains("paid_amount")
        ));
        assert!(matches!(
            to_db_int::<i32, u32>("max_tokens", u32::MAX),
            Err(JobStoreError::Invalid(_))
        ));
    }
}

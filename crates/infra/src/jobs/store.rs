//! Job storage abstraction and the in-memory implementation.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use swarmrouter_core::{DomainError, DomainResult, Job, JobId, JobStatus, NewJob, RetryPolicy, ValidatorId};

/// Timing knobs shared by every store implementation.
#[derive(Debug, Clone)]
pub struct JobStoreConfig {
    /// How long a validator has to report back after assignment
    pub processing_timeout: Duration,
    /// Backoff before a failed job becomes dispatchable again
    pub requeue: RetryPolicy,
}

impl Default for JobStoreConfig {
    fn default() -> Self {
        Self {
            processing_timeout: Duration::from_secs(60),
            requeue: RetryPolicy::exponential(3, Duration::from_secs(60), Duration::from_secs(3_600)),
        }
    }
}

/// Durable job records. The single source of truth for job state.
///
/// Every mutating call is an exclusive read-modify-write of one job: the row
/// is locked, the domain transition is applied to the current state, and the
/// result is written back. A transition the current state does not allow
/// fails with [`JobStoreError::StaleTransition`].
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Validate and persist a submission as `queued`.
    async fn create_job(&self, submission: NewJob) -> Result<Job, JobStoreError>;

    async fn get_job(&self, id: JobId) -> Result<Option<Job>, JobStoreError>;

    /// `queued -> processing`, stamping the processing deadline.
    async fn assign_validator(
        &self,
        id: JobId,
        validator: &ValidatorId,
        endpoint: &str,
    ) -> Result<Job, JobStoreError>;

    /// Terminal write from the completion callback. Rejected as stale unless
    /// `reporter` still holds the job.
    async fn update_job_status(
        &self,
        id: JobId,
        reporter: &ValidatorId,
        status: JobStatus,
        result: Option<String>,
        error: Option<String>,
    ) -> Result<Job, JobStoreError>;

    /// A validator-reported failure: mark failed, then retry or refund, in
    /// one locked write. See [`Job::fail`].
    async fn record_failure(
        &self,
        id: JobId,
        reporter: &ValidatorId,
        error: String,
        max_retries: u32,
    ) -> Result<Job, JobStoreError>;

    /// Processing jobs whose deadline has passed.
    async fn get_timed_out_jobs(&self) -> Result<Vec<Job>, JobStoreError>;

    /// Queued jobs past their backoff window, oldest first.
    async fn get_dispatchable_jobs(&self, limit: usize) -> Result<Vec<Job>, JobStoreError>;

    /// Retry or refund. See [`Job::apply_failure`].
    async fn handle_failure(&self, id: JobId, max_retries: u32) -> Result<Job, JobStoreError>;

    async fn set_refund_signature(&self, id: JobId, signature: &str) -> Result<Job, JobStoreError>;

    /// Refunded jobs with no transfer signature.
    async fn get_unsigned_refund_jobs(&self) -> Result<Vec<Job>, JobStoreError>;

    async fn get_jobs_by_status(&self, status: JobStatus) -> Result<Vec<Job>, JobStoreError>;

    async fn increment_refund_retry(&self, id: JobId) -> Result<Job, JobStoreError>;

    /// Stamp the aggregate unsigned-refund alert on every listed job.
    async fn mark_jobs_alerted(&self, ids: &[JobId]) -> Result<(), JobStoreError>;

    /// Stamp the per-job unconfirmed-refund alert.
    async fn mark_unconfirmed_alerted(&self, id: JobId) -> Result<Job, JobStoreError>;

    async fn confirm_refund(&self, id: JobId) -> Result<Job, JobStoreError>;

    /// Latest aggregate unsigned-refund alert across all jobs.
    async fn get_most_recent_refund_alert_timestamp(&self) -> Result<Option<DateTime<Utc>>, JobStoreError>;
}

#[async_trait]
impl<S: JobStore + ?Sized> JobStore for Arc<S> {
    async fn create_job(&self, submission: NewJob) -> Result<Job, JobStoreError> {
        (**self).create_job(submission).await
    }

    async fn get_job(&self, id: JobId) -> Result<Option<Job>, JobStoreError> {
        (**self).get_job(id).await
    }

    async fn assign_validator(
        &self,
        id: JobId,
        validator: &ValidatorId,
        endpoint: &str,
    ) -> Result<Job, JobStoreError> {
        (**self).assign_validator(id, validator, endpoint).await
    }

    async fn update_job_status(
        &self,
        id: JobId,
        reporter: &ValidatorId,
        status: JobStatus,
        result: Option<String>,
        error: Option<String>,
    ) -> Result<Job, JobStoreError> {
        (**self).update_job_status(id, reporter, status, result, error).await
    }

    async fn record_failure(
        &self,
        id: JobId,
        reporter: &ValidatorId,
        error: String,
        max_retries: u32,
    ) -> Result<Job, JobStoreError> {
        (**self).record_failure(id, reporter, error, max_retries).await
    }

    async fn get_timed_out_jobs(&self) -> Result<Vec<Job>, JobStoreError> {
        (**self).get_timed_out_jobs().await
    }

    async fn get_dispatchable_jobs(&self, limit: usize) -> Result<Vec<Job>, JobStoreError> {
        (**self).get_dispatchable_jobs(limit).await
    }

    async fn handle_failure(&self, id: JobId, max_retries: u32) -> Result<Job, JobStoreError> {
        (**self).handle_failure(id, max_retries).await
    }

    async fn set_refund_signature(&self, id: JobId, signature: &str) -> Result<Job, JobStoreError> {
        (**self).set_refund_signature(id, signature).await
    }

    async fn get_unsigned_refund_jobs(&self) -> Result<Vec<Job>, JobStoreError> {
        (**self).get_unsigned_refund_jobs().await
    }

    async fn get_jobs_by_status(&self, status: JobStatus) -> Result<Vec<Job>, JobStoreError> {
        (**self).get_jobs_by_status(status).await
    }

    async fn increment_refund_retry(&self, id: JobId) -> Result<Job, JobStoreError> {
        (**self).increment_refund_retry(id).await
    }

    async fn mark_jobs_alerted(&self, ids: &[JobId]) -> Result<(), JobStoreError> {
        (**self).mark_jobs_alerted(ids).await
    }

    async fn mark_unconfirmed_alerted(&self, id: JobId) -> Result<Job, JobStoreError> {
        (**self).mark_unconfirmed_alerted(id).await
    }

    async fn confirm_refund(&self, id: JobId) -> Result<Job, JobStoreError> {
        (**self).confirm_refund(id).await
    }

    async fn get_most_recent_refund_alert_timestamp(&self) -> Result<Option<DateTime<Utc>>, JobStoreError> {
        (**self).get_most_recent_refund_alert_timestamp().await
    }
}

/// Job store error.
///
/// `Storage` is an infrastructure failure and is retryable on the next tick;
/// the other variants describe the job itself.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum JobStoreError {
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error("invalid job: {0}")]
    Invalid(String),
    /// The row changed under the caller; the write was rejected.
    #[error("stale transition: {0}")]
    StaleTransition(String),
    #[error("storage error: {0}")]
    Storage(String),
}

impl From<DomainError> for JobStoreError {
    fn from(err: DomainError) -> Self {
        match err {
            DomainError::Validation(msg) => JobStoreError::Invalid(msg),
            DomainError::InvalidId(msg) => JobStoreError::Invalid(msg),
            other => JobStoreError::StaleTransition(other.to_string()),
        }
    }
}

/// In-memory job store for tests/dev.
///
/// One mutex guards the whole map, so every mutation is trivially exclusive.
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    jobs: Mutex<HashMap<JobId, Job>>,
    config: JobStoreConfig,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: JobStoreConfig) -> Self {
        Self {
            jobs: Mutex::new(HashMap::new()),
            config,
        }
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<JobId, Job>>, JobStoreError> {
        self.jobs
            .lock()
            .map_err(|_| JobStoreError::Storage("job store lock poisoned".to_string()))
    }

    fn mutate<F>(&self, id: JobId, f: F) -> Result<Job, JobStoreError>
    where
        F: FnOnce(&mut Job, DateTime<Utc>) -> DomainResult<()>,
    {
        let mut jobs = self.lock()?;
        let current = jobs.get(&id).ok_or(JobStoreError::NotFound(id))?;
        let mut next = current.clone();
        f(&mut next, Utc::now())?;
        jobs.insert(id, next.clone());
        Ok(next)
    }

    fn select<F>(&self, pred: F) -> Result<Vec<Job>, JobStoreError>
    where
        F: Fn(&Job) -> bool,
    {
        let jobs = self.lock()?;
        let mut out: Vec<Job> = jobs.values().filter(|j| pred(j)).cloned().collect();
        out.sort_by_key(|j| j.created_at);
        Ok(out)
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn create_job(&self, submission: NewJob) -> Result<Job, JobStoreError> {
        submission.validate()?;
        let job = Job::new(submission, Utc::now());
        self.lock()?.insert(job.id, job.clone());
        Ok(job)
    }

    async fn get_job(&self, id: JobId) -> Result<Option<Job>, JobStoreError> {
        Ok(self.lock()?.get(&id).cloned())
    }

    async fn assign_validator(
        &self,
        id: JobId,
        validator: &ValidatorId,
        endpoint: &str,
    ) -> Result<Job, JobStoreError> {
        let window = self.config.processing_timeout;
        self.mutate(id, |job, now| job.assign(validator.clone(), endpoint, now, window))
    }

    async fn update_job_status(
        &self,
        id: JobId,
        reporter: &ValidatorId,
        status: JobStatus,
        result: Option<String>,
        error: Option<String>,
    ) -> Result<Job, JobStoreError> {
        self.mutate(id, |job, now| job.finish(reporter, status, result, error, now))
    }

    async fn record_failure(
        &self,
        id: JobId,
        reporter: &ValidatorId,
        error: String,
        max_retries: u32,
    ) -> Result<Job, JobStoreError> {
        let requeue = &self.config.requeue;
        self.mutate(id, |job, now| job.fail(reporter, error, max_retries, requeue, now))
    }

    async fn get_timed_out_jobs(&self) -> Result<Vec<Job>, JobStoreError> {
        let now = Utc::now();
        self.select(|j| j.is_timed_out(now))
    }

    async fn get_dispatchable_jobs(&self, limit: usize) -> Result<Vec<Job>, JobStoreError> {
        let now = Utc::now();
        let mut jobs = self.select(|j| j.is_dispatchable(now))?;
        jobs.truncate(limit);
        Ok(jobs)
    }

    async fn handle_failure(&self, id: JobId, max_retries: u32) -> Result<Job, JobStoreError> {
        let requeue = &self.config.requeue;
        self.mutate(id, |job, now| job.apply_failure(max_retries, requeue, now))
    }

    async fn set_refund_signature(&self, id: JobId, signature: &str) -> Result<Job, JobStoreError> {
        self.mutate(id, |job, now| job.attach_refund_signature(signature, now))
    }

    async fn get_unsigned_refund_jobs(&self) -> Result<Vec<Job>, JobStoreError> {
        self.select(Job::has_unsigned_refund)
    }

    async fn get_jobs_by_status(&self, status: JobStatus) -> Result<Vec<Job>, JobStoreError> {
        self.select(|j| j.status == status)
    }

    async fn increment_refund_retry(&self, id: JobId) -> Result<Job, JobStoreError> {
        self.mutate(id, |job, now| job.record_refund_retry(now))
    }

    async fn mark_jobs_alerted(&self, ids: &[JobId]) -> Result<(), JobStoreError> {
        let mut jobs = self.lock()?;
        let now = Utc::now();
        for id in ids {
            if let Some(job) = jobs.get_mut(id) {
                // Skips jobs that left `refunded` meanwhile.
                let _ = job.mark_refund_alerted(now);
            }
        }
        Ok(())
    }

    async fn mark_unconfirmed_alerted(&self, id: JobId) -> Result<Job, JobStoreError> {
        self.mutate(id, |job, now| job.mark_unconfirmed_alerted(now))
    }

    async fn confirm_refund(&self, id: JobId) -> Result<Job, JobStoreError> {
        self.mutate(id, |job, now| job.confirm_refund(now))
    }

    async fn get_most_recent_refund_alert_timestamp(&self) -> Result<Option<DateTime<Utc>>, JobStoreError> {
        Ok(self.lock()?.values().filter_map(|j| j.refund_last_alert_at).max())
    }
}

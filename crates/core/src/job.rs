//! Inference job record and its lifecycle.
//!
//! ```text
//! queued ──assign──▶ processing ──callback──▶ completed
//!   ▲                    │  │
//!   │                    │  └──callback──▶ failed
//!   └──── retry ─────────┴──────────────────┘  │
//!                                              ▼
//!                       (retries exhausted) refunded
//! ```
//!
//! Every mutation goes through a method on [`Job`] that checks
//! [`JobStatus::can_transition_to`], so in-memory and SQL stores enforce the
//! same rules. Once `refunded`, only refund bookkeeping (signature, retry
//! counters, alert stamps, confirmation) may change.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};
use crate::id::{JobId, ValidatorId};
use crate::retry::RetryPolicy;

/// Job execution status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting for a validator
    Queued,
    /// Assigned, waiting for the completion callback
    Processing,
    /// Validator reported a result
    Completed,
    /// Validator reported a failure; awaiting the retry/refund decision
    Failed,
    /// Retries exhausted; requester is owed a refund
    Refunded,
}

impl JobStatus {
    pub const ALL: [JobStatus; 5] = [
        JobStatus::Queued,
        JobStatus::Processing,
        JobStatus::Completed,
        JobStatus::Failed,
        JobStatus::Refunded,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Refunded => "refunded",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Refunded)
    }

    /// Whether the lifecycle allows moving from `self` to `next`.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Queued, Processing)
                | (Processing, Completed)
                | (Processing, Failed)
                | (Processing, Queued)
                | (Failed, Queued)
                | (Processing, Refunded)
                | (Failed, Refunded)
        )
    }
}

impl core::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl core::str::FromStr for JobStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobStatus::ALL
            .into_iter()
            .find(|st| st.as_str() == s)
            .ok_or_else(|| DomainError::validation(format!("unknown job status: {s}")))
    }
}

/// A job submission, before it is persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewJob {
    /// Wallet of the paying requester
    pub requester: String,
    pub prompt: String,
    pub model: String,
    pub max_tokens: u32,
    /// Amount burned by the requester, in base units
    pub paid_amount: u64,
    /// Signature of the burn transaction
    pub payment_proof: String,
}

impl NewJob {
    /// Reject submissions with missing required fields.
    pub fn validate(&self) -> DomainResult<()> {
        let missing: Vec<&str> = [
            ("requester", self.requester.trim().is_empty()),
            ("prompt", self.prompt.trim().is_empty()),
            ("model", self.model.trim().is_empty()),
            ("max_tokens", self.max_tokens == 0),
            ("paid_amount", self.paid_amount == 0),
            ("payment_proof", self.payment_proof.trim().is_empty()),
        ]
        .into_iter()
        .filter_map(|(name, is_missing)| is_missing.then_some(name))
        .collect();

        if missing.is_empty() {
            Ok(())
        } else {
            Err(DomainError::validation(format!(
                "missing required fields: {}",
                missing.join(", ")
            )))
        }
    }
}

/// One inference request's lifecycle record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub requester: String,
    pub prompt: String,
    pub model: String,
    pub max_tokens: u32,
    pub paid_amount: u64,
    pub payment_proof: String,
    pub status: JobStatus,
    pub assigned_validator: Option<ValidatorId>,
    pub validator_endpoint: Option<String>,
    pub result: Option<String>,
    pub error_message: Option<String>,
    pub retry_count: u32,
    /// Processing deadline while `processing`; earliest re-dispatch time while `queued`.
    pub timeout_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub refund_signature: Option<String>,
    pub refund_retry_count: u32,
    pub refund_last_attempt_at: Option<DateTime<Utc>>,
    pub refund_alert_count: u32,
    /// Last aggregate "unsigned refunds" alert that included this job.
    pub refund_last_alert_at: Option<DateTime<Utc>>,
    /// Last per-job "refund not confirmed" alert.
    pub refund_unconfirmed_alert_at: Option<DateTime<Utc>>,
    pub refund_confirmed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// Create a queued job from a validated submission.
    pub fn new(submission: NewJob, now: DateTime<Utc>) -> Self {
        Self {
            id: JobId::new(),
            requester: submission.requester,
            prompt: submission.prompt,
            model: submission.model,
            max_tokens: submission.max_tokens,
            paid_amount: submission.paid_amount,
            payment_proof: submission.payment_proof,
            status: JobStatus::Queued,
            assigned_validator: None,
            validator_endpoint: None,
            result: None,
            error_message: None,
            retry_count: 0,
            timeout_at: None,
            started_at: None,
            completed_at: None,
            refund_signature: None,
            refund_retry_count: 0,
            refund_last_attempt_at: None,
            refund_alert_count: 0,
            refund_last_alert_at: None,
            refund_unconfirmed_alert_at: None,
            refund_confirmed_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    fn transition(&mut self, next: JobStatus, now: DateTime<Utc>) -> DomainResult<()> {
        if !self.status.can_transition_to(next) {
            return Err(DomainError::IllegalTransition {
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        self.updated_at = now;
        Ok(())
    }

    fn require_refunded(&self) -> DomainResult<()> {
        if self.status != JobStatus::Refunded {
            return Err(DomainError::conflict(format!(
                "job {} is {}, not refunded",
                self.id, self.status
            )));
        }
        Ok(())
    }

    /// Hand the job to a validator and start its processing window.
    pub fn assign(
        &mut self,
        validator: ValidatorId,
        endpoint: impl Into<String>,
        now: DateTime<Utc>,
        window: Duration,
    ) -> DomainResult<()> {
        self.transition(JobStatus::Processing, now)?;
        self.assigned_validator = Some(validator);
        self.validator_endpoint = Some(endpoint.into());
        self.started_at = Some(now);
        self.timeout_at = Some(now + chrono::Duration::from_std(window).unwrap_or_default());
        Ok(())
    }

    /// Terminal write from the completion callback (`completed` or `failed`).
    ///
    /// Only the validator currently holding the job may report on it.
    pub fn finish(
        &mut self,
        reporter: &ValidatorId,
        status: JobStatus,
        result: Option<String>,
        error: Option<String>,
        now: DateTime<Utc>,
    ) -> DomainResult<()> {
        if !matches!(status, JobStatus::Completed | JobStatus::Failed) {
            return Err(DomainError::validation(format!(
                "completion status must be completed or failed, got {status}"
            )));
        }
        if self.assigned_validator.as_ref() != Some(reporter) {
            return Err(DomainError::conflict(format!(
                "job {} is not assigned to validator {reporter}",
                self.id
            )));
        }
        self.transition(status, now)?;
        if result.is_some() {
            self.result = result;
        }
        if error.is_some() {
            self.error_message = error;
        }
        self.completed_at = Some(now);
        Ok(())
    }

    /// The single retry/refund decision.
    ///
    /// Below `max_retries`: bump `retry_count`, clear the assignment and push
    /// the job back to `queued` with a backoff window taken from `requeue`.
    /// Otherwise: mark it `refunded`. Calling this on an already refunded job
    /// is a no-op.
    /// A reported failure followed by the retry/refund decision, as one step.
    pub fn fail(
        &mut self,
        reporter: &ValidatorId,
        error: String,
        max_retries: u32,
        requeue: &RetryPolicy,
        now: DateTime<Utc>,
    ) -> DomainResult<()> {
        self.finish(reporter, JobStatus::Failed, None, Some(error), now)?;
        self.apply_failure(max_retries, requeue, now)
    }

    pub fn apply_failure(
        &mut self,
        max_retries: u32,
        requeue: &RetryPolicy,
        now: DateTime<Utc>,
    ) -> DomainResult<()> {
        if self.status == JobStatus::Refunded {
            return Ok(());
        }

        if self.retry_count < max_retries {
            self.transition(JobStatus::Queued, now)?;
            self.retry_count += 1;
            let delay = requeue.delay_for_attempt(self.retry_count);
            self.assigned_validator = None;
            self.validator_endpoint = None;
            self.started_at = None;
            self.timeout_at = Some(now + chrono::Duration::from_std(delay).unwrap_or_default());
        } else {
            self.transition(JobStatus::Refunded, now)?;
            self.completed_at = Some(now);
        }
        Ok(())
    }

    pub fn attach_refund_signature(
        &mut self,
        signature: impl Into<String>,
        now: DateTime<Utc>,
    ) -> DomainResult<()> {
        self.require_refunded()?;
        self.refund_signature = Some(signature.into());
        self.updated_at = now;
        Ok(())
    }

    pub fn record_refund_retry(&mut self, now: DateTime<Utc>) -> DomainResult<()> {
        self.require_refunded()?;
        self.refund_retry_count += 1;
        self.refund_last_attempt_at = Some(now);
        self.updated_at = now;
        Ok(())
    }

    pub fn mark_refund_alerted(&mut self, now: DateTime<Utc>) -> DomainResult<()> {
        self.require_refunded()?;
        self.refund_alert_count += 1;
        self.refund_last_alert_at = Some(now);
        self.updated_at = now;
        Ok(())
    }

    pub fn mark_unconfirmed_alerted(&mut self, now: DateTime<Utc>) -> DomainResult<()> {
        self.require_refunded()?;
        self.refund_unconfirmed_alert_at = Some(now);
        self.updated_at = now;
        Ok(())
    }

    pub fn confirm_refund(&mut self, now: DateTime<Utc>) -> DomainResult<()> {
        self.require_refunded()?;
        if self.refund_signature.is_none() {
            return Err(DomainError::conflict(format!(
                "job {} has no refund signature to confirm",
                self.id
            )));
        }
        self.refund_confirmed_at = Some(now);
        self.updated_at = now;
        Ok(())
    }

    pub fn is_timed_out(&self, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Processing && self.timeout_at.is_some_and(|t| t < now)
    }

    /// Queued and past any retry backoff window.
    pub fn is_dispatchable(&self, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Queued && self.timeout_at.is_none_or(|t| t <= now)
    }

    pub fn has_unsigned_refund(&self) -> bool {
        self.status == JobStatus::Refunded
            && self.refund_signature.as_deref().is_none_or(str::is_empty)
    }

    pub fn awaiting_refund_confirmation(&self) -> bool {
        self.status == JobStatus::Refunded
            && self.refund_confirmed_at.is_none()
            && self.refund_signature.as_deref().is_some_and(|s| !s.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn submission() -> NewJob {
        NewJob {
            requester: "Hn7cwallet".to_string(),
            prompt: "hello".to_string(),
            model: "llama-3".to_string(),
            max_tokens: 128,
            paid_amount: 10,
            payment_proof: "burn-sig".to_string(),
        }
    }

    fn requeue() -> RetryPolicy {
        RetryPolicy::exponential(u32::MAX, Duration::from_secs(60), Duration::from_secs(3600))
    }

    fn v1() -> ValidatorId {
        ValidatorId::new("validator_001").unwrap()
    }

    fn processing_job(now: DateTime<Utc>) -> Job {
        let mut job = Job::new(submission(), now);
        job.assign(
            v1(),
            "https://v1",
            now,
            Duration::from_secs(60),
        )
        .unwrap();
        job
    }

    #[test]
    fn validate_lists_missing_fields() {
        let mut bad = submission();
        bad.prompt = " ".to_string();
        bad.paid_amount = 0;

        let err = bad.validate().unwrap_err();
        assert_eq!(
            err,
            DomainError::validation("missing required fields: prompt, paid_amount")
        );
        assert!(submission().validate().is_ok());
    }

    #[test]
    fn assign_sets_processing_window() {
        let now = Utc::now();
        let job = processing_job(now);

        assert_eq!(job.status, JobStatus::Processing);
        assert_eq!(job.timeout_at, Some(now + chrono::Duration::seconds(60)));
        assert!(!job.is_timed_out(now));
        assert!(job.is_timed_out(now + chrono::Duration::seconds(61)));
    }

    #[test]
    fn cannot_assign_twice() {
        let now = Utc::now();
        let mut job = processing_job(now);
        let err = job
            .assign(ValidatorId::new("validator_002").unwrap(), "https://v2", now, Duration::from_secs(60))
            .unwrap_err();
        assert!(matches!(
            err,
            DomainError::IllegalTransition {
                from: JobStatus::Processing,
                to: JobStatus::Processing
            }
        ));
    }

    #[test]
    fn failure_requeues_with_exponential_window_then_refunds() {
        let now = Utc::now();
        let mut job = processing_job(now);

        job.apply_failure(2, &requeue(), now).unwrap();
        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.retry_count, 1);
        assert!(job.assigned_validator.is_none());
        assert_eq!(job.timeout_at, Some(now + chrono::Duration::seconds(60)));
        assert!(!job.is_dispatchable(now));

        job.assign(ValidatorId::new("validator_002").unwrap(), "https://v2", now, Duration::from_secs(60))
            .unwrap();
        job.apply_failure(2, &requeue(), now).unwrap();
        assert_eq!(job.retry_count, 2);
        assert_eq!(job.timeout_at, Some(now + chrono::Duration::seconds(120)));

        job.assign(ValidatorId::new("validator_003").unwrap(), "https://v3", now, Duration::from_secs(60))
            .unwrap();
        job.apply_failure(2, &requeue(), now).unwrap();
        assert_eq!(job.status, JobStatus::Refunded);
        assert_eq!(job.retry_count, 2);
        assert!(job.has_unsigned_refund());

        // Stays refunded.
        job.apply_failure(2, &requeue(), now).unwrap();
        assert_eq!(job.status, JobStatus::Refunded);
        assert_eq!(job.retry_count, 2);
    }

    #[test]
    fn failure_after_completion_is_rejected() {
        let now = Utc::now();
        let mut job = processing_job(now);
        job.finish(&v1(), JobStatus::Completed, Some("ok".to_string()), None, now).unwrap();

        assert!(matches!(
            job.apply_failure(3, &requeue(), now),
            Err(DomainError::IllegalTransition { from: JobStatus::Completed, .. })
        ));
    }

    #[test]
    fn only_the_assigned_validator_can_finish() {
        let now = Utc::now();
        let mut job = processing_job(now);
        let other = ValidatorId::new("validator_002").unwrap();

        assert!(matches!(
            job.finish(&other, JobStatus::Completed, None, None, now),
            Err(DomainError::Conflict(_))
        ));
        assert_eq!(job.status, JobStatus::Processing);

        // Re-queued and handed to someone else: the first holder's report is stale.
        job.apply_failure(3, &requeue(), now).unwrap();
        job.assign(other.clone(), "https://v2", now, Duration::from_secs(60)).unwrap();
        assert!(job.finish(&v1(), JobStatus::Completed, None, None, now).is_err());
        job.finish(&other, JobStatus::Completed, Some("ok".to_string()), None, now)
            .unwrap();
        assert_eq!(job.status, JobStatus::Completed);
    }

    #[test]
    fn reported_failure_requeues_or_refunds_in_one_step() {
        let now = Utc::now();
        let mut job = processing_job(now);
        job.fail(&v1(), "oom".to_string(), 1, &requeue(), now).unwrap();
        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.retry_count, 1);
        assert_eq!(job.error_message.as_deref(), Some("oom"));

        job.assign(v1(), "https://v1", now, Duration::from_secs(60)).unwrap();
        job.fail(&v1(), "oom".to_string(), 1, &requeue(), now).unwrap();
        assert_eq!(job.status, JobStatus::Refunded);
        assert!(job.has_unsigned_refund());
    }

    #[test]
    fn refund_bookkeeping_requires_refunded_status() {
        let now = Utc::now();
        let mut job = processing_job(now);
        assert!(job.attach_refund_signature("sig", now).is_err());

        job.apply_failure(0, &requeue(), now).unwrap();
        assert!(job.confirm_refund(now).is_err());

        job.attach_refund_signature("sig", now).unwrap();
        assert!(job.awaiting_refund_confirmation());
        job.record_refund_retry(now).unwrap();
        assert_eq!(job.refund_retry_count, 1);
        job.confirm_refund(now).unwrap();
        assert!(!job.awaiting_refund_confirmation());
    }

    #[test]
    fn status_parses_from_str() {
        for status in JobStatus::ALL {
            assert_eq!(status.as_str().parse::<JobStatus>().unwrap(), status);
        }
        assert!("bogus".parse::<JobStatus>().is_err());
    }
}

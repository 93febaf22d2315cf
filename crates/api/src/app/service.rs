//! The router's exposed operations, independent of HTTP.
//!
//! Handlers in `routes/` only map JSON to these calls and errors back to
//! status codes.

use std::sync::Arc;

use chrono::Utc;
use serde_json::Value as JsonValue;
use tracing::{error, info, instrument, warn};

use swarmrouter_core::{
    Alert, AuditEvent, DomainError, Job, JobId, JobStatus, LedgerEntryId, MAX_REPUTATION, NewJob, ValidatorId,
    ValidatorUpdate,
};
use swarmrouter_infra::workers::QueueDispatcher;
use swarmrouter_infra::{
    Alerter, AnchorError, AnchorResult, AuditAnchor, JobStore, JobStoreError, Ledger, LedgerEntry, LedgerError,
    LedgerEventError, LedgerEventKind, LedgerEventLog, RefundExecutor, TxRef, ValidatorRegistry,
};

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("{0}")]
    Validation(String),
    #[error("payment verification failed")]
    PaymentRejected,
    #[error("job not found: {0}")]
    JobNotFound(JobId),
    #[error("validator not found: {0}")]
    ValidatorNotFound(ValidatorId),
    #[error("ledger entry not found: {0}")]
    LedgerEntryNotFound(LedgerEntryId),
    #[error("{0}")]
    Conflict(String),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error(transparent)]
    Anchor(#[from] AnchorError),
    #[error("storage error: {0}")]
    Storage(String),
}

impl From<JobStoreError> for ServiceError {
    fn from(err: JobStoreError) -> Self {
        match err {
            JobStoreError::NotFound(id) => ServiceError::JobNotFound(id),
            JobStoreError::Invalid(msg) => ServiceError::Validation(msg),
            JobStoreError::StaleTransition(msg) => ServiceError::Conflict(msg),
            JobStoreError::Storage(msg) => ServiceError::Storage(msg),
        }
    }
}

impl From<LedgerEventError> for ServiceError {
    fn from(err: LedgerEventError) -> Self {
        match err {
            LedgerEventError::NotFound(id) => ServiceError::LedgerEntryNotFound(id),
            LedgerEventError::Storage(msg) => ServiceError::Storage(msg),
        }
    }
}

impl From<DomainError> for ServiceError {
    fn from(err: DomainError) -> Self {
        match err {
            DomainError::Validation(msg) | DomainError::InvalidId(msg) => ServiceError::Validation(msg),
            other => ServiceError::Conflict(other.to_string()),
        }
    }
}

#[derive(Debug, Clone)]
pub enum SubmitOutcome {
    Assigned { job: Job, validator_id: ValidatorId, endpoint: String },
    /// No eligible validator right now; the dispatcher retries.
    Queued { job: Job },
}

impl SubmitOutcome {
    pub fn job(&self) -> &Job {
        match self {
            SubmitOutcome::Assigned { job, .. } | SubmitOutcome::Queued { job } => job,
        }
    }
}

/// A validator's report on a job it was assigned.
#[derive(Debug, Clone)]
pub struct CompletionReport {
    pub job_id: JobId,
    pub validator_id: ValidatorId,
    pub success: bool,
    pub result: Option<String>,
    pub error: Option<String>,
    /// Defaults to the job's paid amount.
    pub fee_amount: Option<u64>,
    /// Payer of the fee. Defaults to the job's requester.
    pub user_wallet: Option<String>,
}

#[derive(Debug, Clone)]
pub enum CompletionOutcome {
    Completed { job: Job, fee_signature: String, reputation: u32 },
    /// The reported failure re-queued or refunded the job.
    Failed { job: Job, refund_signature: Option<String> },
}

/// Request-path operations over the shared stores and capabilities.
pub struct RouterService {
    pub(crate) store: Arc<dyn JobStore>,
    pub(crate) ledger: Arc<dyn Ledger>,
    pub(crate) dispatcher: Arc<QueueDispatcher>,
    pub(crate) anchor: AuditAnchor,
    pub(crate) refunds: RefundExecutor,
    pub(crate) ledger_events: Arc<dyn LedgerEventLog>,
    pub(crate) alerter: Alerter,
    pub(crate) max_retries: u32,
}

impl RouterService {
    pub fn registry(&self) -> &Arc<ValidatorRegistry> {
        self.dispatcher.registry()
    }

    pub async fn get_job(&self, id: JobId) -> Result<Job, ServiceError> {
        self.store.get_job(id).await?.ok_or(ServiceError::JobNotFound(id))
    }

    /// Verify payment, persist the job and try to assign it immediately.
    #[instrument(skip(self, submission), fields(requester = %submission.requester))]
    pub async fn submit_job(&self, submission: NewJob) -> Result<SubmitOutcome, ServiceError> {
        submission.validate()?;

        let paid = self
            .ledger
            .verify_burn(&submission.payment_proof, submission.paid_amount)
            .await?;
        if !paid {
            warn!(proof = %submission.payment_proof, "burn verification rejected");
            return Err(ServiceError::PaymentRejected);
        }

        let job = self.store.create_job(submission).await?;
        info!(job_id = %job.id, "job created");

        match self.dispatcher.try_assign(&job).await {
            Ok(Some(assigned)) => {
                let validator_id = assigned
                    .assigned_validator
                    .clone()
                    .ok_or_else(|| ServiceError::Storage("assigned job has no validator".to_string()))?;
                let endpoint = assigned.validator_endpoint.clone().unwrap_or_default();
                Ok(SubmitOutcome::Assigned {
                    job: assigned,
                    validator_id,
                    endpoint,
                })
            }
            Ok(None) => {
                info!(job_id = %job.id, "no validator available, job queued");
                Ok(SubmitOutcome::Queued { job })
            }
            // The job is stored as queued; the dispatcher picks it up later.
            Err(err) => {
                warn!(job_id = %job.id, error = %err, "immediate assignment failed, job queued");
                Ok(SubmitOutcome::Queued { job })
            }
        }
    }

    /// Handle a validator's completion callback.
    ///
    /// The checks below give early, readable errors. The store re-checks
    /// status and ownership under the job's lock, so a report that went stale
    /// in between is rejected before any fee moves.
    #[instrument(skip(self, report), fields(job_id = %report.job_id, validator_id = %report.validator_id))]
    pub async fn complete_job(&self, report: CompletionReport) -> Result<CompletionOutcome, ServiceError> {
        let job = self.get_job(report.job_id).await?;
        if job.status != JobStatus::Processing {
            return Err(ServiceError::Conflict(format!(
                "job {} is {}, not processing",
                job.id, job.status
            )));
        }
        if job.assigned_validator.as_ref() != Some(&report.validator_id) {
            return Err(ServiceError::Conflict(format!(
                "job {} is not assigned to validator {}",
                job.id, report.validator_id
            )));
        }

        if report.success {
            self.finish_successful(job, report).await
        } else {
            self.finish_failed(job, report).await
        }
    }

    async fn finish_successful(&self, job: Job, report: CompletionReport) -> Result<CompletionOutcome, ServiceError> {
        let validator = self
            .registry()
            .get_by_id(&report.validator_id)
            .ok_or_else(|| ServiceError::ValidatorNotFound(report.validator_id.clone()))?;

        let completed = self
            .store
            .update_job_status(job.id, &report.validator_id, JobStatus::Completed, report.result, None)
            .await?;

        let payer = report.user_wallet.unwrap_or_else(|| job.requester.clone());
        let fee = report.fee_amount.unwrap_or(job.paid_amount);
        let fee_signature = match self
            .ledger
            .distribute_fee(&payer, &validator.wallet_address, fee)
            .await
        {
            Ok(sig) => sig,
            Err(err) => {
                error!(job_id = %job.id, error = %err, "fee distribution failed");
                self.alerter
                    .dispatch(
                        Alert::critical(
                            format!("Fee distribution failed for job {}", job.id),
                            format!(
                                "validator {} ({}) was not paid {fee}: {err}",
                                validator.id, validator.wallet_address
                            ),
                        )
                        .with_tags(["fee", "payment"]),
                    )
                    .await;
                return Err(err.into());
            }
        };
        info!(job_id = %job.id, signature = %fee_signature, fee, "fee distributed");

        let reputation = validator.reputation.saturating_add(1).min(MAX_REPUTATION);
        if let Err(err) = self
            .ledger
            .update_reputation(&validator.wallet_address, reputation)
            .await
        {
            warn!(validator_id = %validator.id, error = %err, "on-chain reputation update failed");
        }
        self.registry().upsert(
            ValidatorUpdate {
                reputation: Some(reputation),
                ..ValidatorUpdate::for_id(validator.id.clone())
            },
            Utc::now(),
        );

        Ok(CompletionOutcome::Completed {
            job: completed,
            fee_signature,
            reputation,
        })
    }

    async fn finish_failed(&self, job: Job, report: CompletionReport) -> Result<CompletionOutcome, ServiceError> {
        let error = report.error.unwrap_or_else(|| "validator reported failure".to_string());
        let updated = self
            .store
            .record_failure(job.id, &report.validator_id, error, self.max_retries)
            .await?;

        let mut refund_signature = None;
        if updated.status == JobStatus::Refunded {
            match self.refunds.execute(&updated).await {
                Ok(sig) => refund_signature = Some(sig),
                Err(err) => warn!(job_id = %job.id, error = %err, "refund left unsigned for reconciliation"),
            }
        }

        Ok(CompletionOutcome::Failed {
            job: updated,
            refund_signature,
        })
    }

    pub async fn anchor_event(&self, event: AuditEvent) -> Result<AnchorResult, ServiceError> {
        if event.event_type.trim().is_empty() {
            return Err(ServiceError::Validation("missing required fields: event_type".to_string()));
        }
        Ok(self.anchor.anchor(&event).await?)
    }

    /// Persist a ledger write and anchor it in the background.
    #[instrument(skip(self, payload))]
    pub async fn record_ledger_event(
        &self,
        kind: LedgerEventKind,
        payload: JsonValue,
    ) -> Result<LedgerEntry, ServiceError> {
        let entry = LedgerEntry::new(kind, payload, Utc::now());
        self.ledger_events.append(&entry).await?;
        info!(entry_id = %entry.id, %kind, payload_hash = %entry.payload_hash, "ledger event recorded");

        let anchor = self.anchor.clone();
        let log = self.ledger_events.clone();
        let pending = entry.clone();
        tokio::spawn(async move {
            anchor_entry(&anchor, log.as_ref(), &pending).await;
        });

        Ok(entry)
    }

    pub async fn get_ledger_event(&self, id: LedgerEntryId) -> Result<LedgerEntry, ServiceError> {
        self.ledger_events
            .get(id)
            .await?
            .ok_or(ServiceError::LedgerEntryNotFound(id))
    }

    /// Anchor every entry that is still unanchored, oldest first.
    /// Returns how many were anchored.
    pub async fn anchor_pending_ledger_events(&self) -> Result<usize, ServiceError> {
        let pending = self.ledger_events.unanchored().await?;
        let mut anchored = 0;
        for entry in &pending {
            if anchor_entry(&self.anchor, self.ledger_events.as_ref(), entry).await {
                anchored += 1;
            }
        }
        Ok(anchored)
    }
}

/// Only a confirmed on-chain reference marks the entry anchored; a fallback
/// leaves it pending for the next catch-up pass.
async fn anchor_entry(anchor: &AuditAnchor, log: &dyn LedgerEventLog, entry: &LedgerEntry) -> bool {
    let result = match anchor.anchor(&entry.to_audit_event()).await {
        Ok(result) => result,
        Err(err) => {
            error!(entry_id = %entry.id, error = %err, "ledger event anchoring failed");
            return false;
        }
    };

    if !matches!(result.tx_ref, TxRef::Confirmed(_)) {
        warn!(entry_id = %entry.id, tx_ref = %result.tx_ref, "ledger event left unanchored");
        return false;
    }

    match log
        .mark_anchored(entry.id, result.storage_ref.as_str(), result.tx_ref.as_str())
        .await
    {
        Ok(_) => {
            info!(entry_id = %entry.id, tx_ref = %result.tx_ref, "ledger event anchored");
            true
        }
        Err(err) => {
            error!(entry_id = %entry.id, error = %err, "failed to record ledger event anchor");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;

    use swarmrouter_infra::{
        InMemoryAlertSink, InMemoryContentStore, InMemoryGovernanceSink, InMemoryJobStore, InMemoryLedger,
        InMemoryLedgerEventLog, InMemoryRefundAuditLog, RouterConfig, StaticHealthProbe,
    };

    use crate::app::services::{AppServices, ServiceParts};

    struct Harness {
        store: Arc<InMemoryJobStore>,
        ledger: Arc<InMemoryLedger>,
        alerts: Arc<InMemoryAlertSink>,
        events: Arc<InMemoryLedgerEventLog>,
        services: AppServices,
    }

    impl Harness {
        fn router(&self) -> &RouterService {
            &self.services.router
        }
    }

    fn config(extra: &[(&str, &str)]) -> RouterConfig {
        let mut vars = vec![
            ("LEDGER_GATEWAY_URL".to_string(), "http://gw".to_string()),
            ("SOLANA_ANCHOR_ATTEMPTS".to_string(), "1".to_string()),
            ("SOLANA_ANCHOR_BACKOFF_MS".to_string(), "1".to_string()),
            ("SOLANA_ANCHOR_CONFIRM_POLL_MS".to_string(), "1".to_string()),
            ("SOLANA_ANCHOR_CONFIRM_TIMEOUT_MS".to_string(), "20".to_string()),
            ("REFUND_EXEC_ATTEMPTS".to_string(), "1".to_string()),
        ];
        vars.extend(extra.iter().map(|(k, v)| (k.to_string(), v.to_string())));
        RouterConfig::from_vars(vars).unwrap()
    }

    fn harness(extra: &[(&str, &str)]) -> Harness {
        let store = InMemoryJobStore::arc();
        harness_over(store.clone(), store, extra)
    }

    /// `backend` is what the service talks to; `store` is the state under it.
    fn harness_over(store: Arc<InMemoryJobStore>, backend: Arc<dyn JobStore>, extra: &[(&str, &str)]) -> Harness {
        let ledger = InMemoryLedger::arc();
        let alerts = Arc::new(InMemoryAlertSink::new());
        let events = Arc::new(InMemoryLedgerEventLog::new());
        let parts = ServiceParts {
            store: backend,
            ledger: ledger.clone(),
            content: Some(Arc::new(InMemoryContentStore::new())),
            governance: Arc::new(InMemoryGovernanceSink::new()),
            alert_sink: Some(alerts.clone()),
            probe: Arc::new(StaticHealthProbe::new()),
            refund_audit: Arc::new(InMemoryRefundAuditLog::new()),
            ledger_events: events.clone(),
        };
        Harness {
            store,
            ledger,
            alerts,
            events,
            services: AppServices::assemble(config(extra), parts),
        }
    }

    /// Job store that lets the test act between the service's read and its write.
    struct InterleavingStore {
        inner: Arc<InMemoryJobStore>,
        /// Re-queue and hand the job to this validator right after it is read.
        steal_for: Mutex<Option<ValidatorId>>,
        fail_record_failure: AtomicBool,
    }

    impl InterleavingStore {
        fn new(inner: Arc<InMemoryJobStore>) -> Self {
            Self {
                inner,
                steal_for: Mutex::new(None),
                fail_record_failure: AtomicBool::new(false),
            }
        }
    }

    #[async_trait]
    impl JobStore for InterleavingStore {
        async fn create_job(&self, submission: NewJob) -> Result<Job, JobStoreError> {
            self.inner.create_job(submission).await
        }

        async fn get_job(&self, id: JobId) -> Result<Option<Job>, JobStoreError> {
            let job = self.inner.get_job(id).await?;
            let thief = self.steal_for.lock().unwrap().take();
            if let Some(thief) = thief {
                self.inner.handle_failure(id, 3).await?;
                self.inner.assign_validator(id, &thief, "http://v2").await?;
            }
            Ok(job)
        }

        async fn assign_validator(
            &self,
            id: JobId,
            validator: &ValidatorId,
            endpoint: &str,
        ) -> Result<Job, JobStoreError> {
            self.inner.assign_validator(id, validator, endpoint).await
        }

        async fn update_job_status(
            &self,
            id: JobId,
            reporter: &ValidatorId,
            status: JobStatus,
            result: Option<String>,
            error: Option<String>,
        ) -> Result<Job, JobStoreError> {
            self.inner.update_job_status(id, reporter, status, result, error).await
        }

        async fn record_failure(
            &self,
            id: JobId,
            reporter: &ValidatorId,
            error: String,
            max_retries: u32,
        ) -> Result<Job, JobStoreError> {
            if self.fail_record_failure.load(Ordering::SeqCst) {
                return Err(JobStoreError::Storage("connection reset".to_string()));
            }
            self.inner.record_failure(id, reporter, error, max_retries).await
        }

        async fn get_timed_out_jobs(&self) -> Result<Vec<Job>, JobStoreError> {
            self.inner.get_timed_out_jobs().await
        }

        async fn get_dispatchable_jobs(&self, limit: usize) -> Result<Vec<Job>, JobStoreError> {
            self.inner.get_dispatchable_jobs(limit).await
        }

        async fn handle_failure(&self, id: JobId, max_retries: u32) -> Result<Job, JobStoreError> {
            self.inner.handle_failure(id, max_retries).await
        }

        async fn set_refund_signature(&self, id: JobId, signature: &str) -> Result<Job, JobStoreError> {
            self.inner.set_refund_signature(id, signature).await
        }

        async fn get_unsigned_refund_jobs(&self) -> Result<Vec<Job>, JobStoreError> {
            self.inner.get_unsigned_refund_jobs().await
        }

        async fn get_jobs_by_status(&self, status: JobStatus) -> Result<Vec<Job>, JobStoreError> {
            self.inner.get_jobs_by_status(status).await
        }

        async fn increment_refund_retry(&self, id: JobId) -> Result<Job, JobStoreError> {
            self.inner.increment_refund_retry(id).await
        }

        async fn mark_jobs_alerted(&self, ids: &[JobId]) -> Result<(), JobStoreError> {
            self.inner.mark_jobs_alerted(ids).await
        }

        async fn mark_unconfirmed_alerted(&self, id: JobId) -> Result<Job, JobStoreError> {
            self.inner.mark_unconfirmed_alerted(id).await
        }

        async fn confirm_refund(&self, id: JobId) -> Result<Job, JobStoreError> {
            self.inner.confirm_refund(id).await
        }

        async fn get_most_recent_refund_alert_timestamp(
            &self,
        ) -> Result<Option<chrono::DateTime<Utc>>, JobStoreError> {
            self.inner.get_most_recent_refund_alert_timestamp().await
        }
    }

    fn interleaving_harness(extra: &[(&str, &str)]) -> (Harness, Arc<InterleavingStore>) {
        let store = Arc::new(InMemoryJobStore::with_config(config(extra).job_store_config()));
        let backend = Arc::new(InterleavingStore::new(store.clone()));
        (harness_over(store, backend.clone(), extra), backend)
    }

    const ONE_VALIDATOR: &str =
        r#"[{"id":"v1","endpoint":"http://v1","wallet_address":"v1_wallet","stake":5000,"reputation":99,"max_capacity":4}]"#;

    fn submission() -> NewJob {
        NewJob {
            requester: "user_wallet".into(),
            prompt: "hi".into(),
            model: "llama".into(),
            max_tokens: 32,
            paid_amount: 25,
            payment_proof: "burn_sig".into(),
        }
    }

    fn report(job_id: JobId, success: bool) -> CompletionReport {
        CompletionReport {
            job_id,
            validator_id: ValidatorId::new("v1").unwrap(),
            success,
            result: success.then(|| "answer".to_string()),
            error: (!success).then(|| "oom".to_string()),
            fee_amount: None,
            user_wallet: None,
        }
    }

    async fn assigned_job(h: &Harness) -> Job {
        match h.router().submit_job(submission()).await.unwrap() {
            SubmitOutcome::Assigned { job, .. } => job,
            other => panic!("expected assignment, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn submit_assigns_to_the_eligible_validator() {
        let h = harness(&[("ROUTER_INITIAL_VALIDATORS", ONE_VALIDATOR)]);

        let outcome = h.router().submit_job(submission()).await.unwrap();

        let SubmitOutcome::Assigned { job, validator_id, endpoint } = outcome else {
            panic!("expected assignment");
        };
        assert_eq!(job.status, JobStatus::Processing);
        assert_eq!(validator_id.as_str(), "v1");
        assert_eq!(endpoint, "http://v1");
    }

    #[tokio::test]
    async fn submit_without_validators_queues() {
        let h = harness(&[]);

        let outcome = h.router().submit_job(submission()).await.unwrap();

        assert!(matches!(outcome, SubmitOutcome::Queued { .. }));
        assert_eq!(outcome.job().status, JobStatus::Queued);
    }

    #[tokio::test]
    async fn invalid_payment_is_rejected_before_persisting() {
        let h = harness(&[]);
        h.ledger.set_burns_valid(false);

        let err = h.router().submit_job(submission()).await.unwrap_err();

        assert!(matches!(err, ServiceError::PaymentRejected));
        assert!(h.store.get_jobs_by_status(JobStatus::Queued).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn missing_fields_are_a_validation_error() {
        let h = harness(&[]);
        let err = h
            .router()
            .submit_job(NewJob {
                model: String::new(),
                ..submission()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::Validation(msg) if msg.contains("model")));
    }

    #[tokio::test]
    async fn successful_completion_pays_fee_and_bumps_reputation() {
        let h = harness(&[("ROUTER_INITIAL_VALIDATORS", ONE_VALIDATOR)]);
        let job = assigned_job(&h).await;

        let outcome = h.router().complete_job(report(job.id, true)).await.unwrap();

        let CompletionOutcome::Completed { job, reputation, .. } = outcome else {
            panic!("expected completion");
        };
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.result.as_deref(), Some("answer"));
        assert_eq!(reputation, 100);
        assert_eq!(h.ledger.fees()[0].wallet, "v1_wallet");
        assert_eq!(h.ledger.fees()[0].amount, 25);
        assert_eq!(h.ledger.reputation_updates(), vec![("v1_wallet".to_string(), 100)]);
        let v1 = h.router().registry().get_by_id(&ValidatorId::new("v1").unwrap()).unwrap();
        assert_eq!(v1.reputation, 100);
    }

    #[tokio::test]
    async fn completion_from_the_wrong_validator_is_a_conflict() {
        let h = harness(&[("ROUTER_INITIAL_VALIDATORS", ONE_VALIDATOR)]);
        let job = assigned_job(&h).await;

        let err = h
            .router()
            .complete_job(CompletionReport {
                validator_id: ValidatorId::new("v2").unwrap(),
                ..report(job.id, true)
            })
            .await
            .unwrap_err();

        assert!(matches!(err, ServiceError::Conflict(_)));
        assert_eq!(h.store.get_job(job.id).await.unwrap().unwrap().status, JobStatus::Processing);
    }

    #[tokio::test]
    async fn stale_completion_after_reassignment_pays_nobody() {
        let (h, backend) = interleaving_harness(&[("ROUTER_INITIAL_VALIDATORS", ONE_VALIDATOR)]);
        let job = assigned_job(&h).await;
        let v2 = ValidatorId::new("v2").unwrap();
        *backend.steal_for.lock().unwrap() = Some(v2.clone());

        let err = h.router().complete_job(report(job.id, true)).await.unwrap_err();

        assert!(matches!(err, ServiceError::Conflict(_)));
        assert!(h.ledger.fees().is_empty());
        let current = h.store.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(current.status, JobStatus::Processing);
        assert_eq!(current.assigned_validator, Some(v2));
    }

    #[tokio::test]
    async fn stale_failure_report_after_reassignment_is_rejected() {
        let (h, backend) = interleaving_harness(&[("ROUTER_INITIAL_VALIDATORS", ONE_VALIDATOR)]);
        let job = assigned_job(&h).await;
        *backend.steal_for.lock().unwrap() = Some(ValidatorId::new("v2").unwrap());

        let err = h.router().complete_job(report(job.id, false)).await.unwrap_err();

        assert!(matches!(err, ServiceError::Conflict(_)));
        let current = h.store.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(current.status, JobStatus::Processing);
        assert_eq!(current.retry_count, 1);
    }

    #[tokio::test]
    async fn failure_report_lost_to_storage_leaves_job_for_the_supervisor() {
        let (h, backend) = interleaving_harness(&[
            ("ROUTER_INITIAL_VALIDATORS", ONE_VALIDATOR),
            ("JOB_PROCESSING_TIMEOUT_SECONDS", "0"),
        ]);
        let job = assigned_job(&h).await;
        backend.fail_record_failure.store(true, Ordering::SeqCst);

        let err = h.router().complete_job(report(job.id, false)).await.unwrap_err();

        assert!(matches!(err, ServiceError::Storage(_)));
        let current = h.store.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(current.status, JobStatus::Processing);
        tokio::time::sleep(Duration::from_millis(5)).await;
        let timed_out = h.store.get_timed_out_jobs().await.unwrap();
        assert_eq!(timed_out.iter().map(|j| j.id).collect::<Vec<_>>(), vec![job.id]);
    }

    #[tokio::test]
    async fn reported_failure_with_no_budget_refunds() {
        let h = harness(&[("ROUTER_INITIAL_VALIDATORS", ONE_VALIDATOR), ("ROUTER_MAX_RETRIES", "0")]);
        let job = assigned_job(&h).await;

        let outcome = h.router().complete_job(report(job.id, false)).await.unwrap();

        let CompletionOutcome::Failed { job, refund_signature } = outcome else {
            panic!("expected failure handling");
        };
        assert_eq!(job.status, JobStatus::Refunded);
        assert!(refund_signature.is_some());
        assert_eq!(h.ledger.transfers()[0].wallet, "user_wallet");
    }

    #[tokio::test]
    async fn reported_failure_with_budget_requeues() {
        let h = harness(&[("ROUTER_INITIAL_VALIDATORS", ONE_VALIDATOR)]);
        let job = assigned_job(&h).await;

        let outcome = h.router().complete_job(report(job.id, false)).await.unwrap();

        let CompletionOutcome::Failed { job, refund_signature } = outcome else {
            panic!("expected failure handling");
        };
        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.retry_count, 1);
        assert!(refund_signature.is_none());
        assert!(h.ledger.transfers().is_empty());
    }

    #[tokio::test]
    async fn fee_failure_alerts_and_surfaces() {
        let h = harness(&[("ROUTER_INITIAL_VALIDATORS", ONE_VALIDATOR)]);
        let job = assigned_job(&h).await;
        h.ledger.set_fees_fail(true);

        let err = h.router().complete_job(report(job.id, true)).await.unwrap_err();

        assert!(matches!(err, ServiceError::Ledger(_)));
        assert_eq!(h.alerts.alerts().len(), 1);
        assert!(h.alerts.alerts()[0].title.starts_with("Fee distribution failed"));
    }

    #[tokio::test]
    async fn ledger_event_is_anchored_in_the_background() {
        let h = harness(&[]);

        let entry = h
            .router()
            .record_ledger_event(LedgerEventKind::Transaction, serde_json::json!({"amount": 5}))
            .await
            .unwrap();
        assert!(!entry.anchored);

        let mut anchored = None;
        for _ in 0..100 {
            let current = h.router().get_ledger_event(entry.id).await.unwrap();
            if current.anchored {
                anchored = Some(current);
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let anchored = anchored.expect("entry anchored");
        assert!(anchored.tx_ref.is_some());
        assert_eq!(h.ledger.memos().len(), 1);
    }

    #[tokio::test]
    async fn pending_ledger_events_are_anchored_on_catch_up() {
        let h = harness(&[]);
        let entry = LedgerEntry::new(LedgerEventKind::Audit, serde_json::json!({"k": 1}), Utc::now());
        h.events.append(&entry).await.unwrap();

        let anchored = h.router().anchor_pending_ledger_events().await.unwrap();

        assert_eq!(anchored, 1);
        assert!(h.events.unanchored().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn fallback_anchor_leaves_ledger_event_pending() {
        let h = harness(&[]);
        h.ledger.set_memos_fail(true);
        let entry = LedgerEntry::new(LedgerEventKind::Audit, serde_json::json!({"k": 2}), Utc::now());
        h.events.append(&entry).await.unwrap();

        assert_eq!(h.router().anchor_pending_ledger_events().await.unwrap(), 0);
        assert_eq!(h.events.unanchored().await.unwrap().len(), 1);
    }
}

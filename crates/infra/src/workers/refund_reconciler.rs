use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, error, info, instrument, warn};

use swarmrouter_core::{Alert, AuditEvent, Job, JobStatus};

use super::PeriodicTask;
use crate::alerting::Alerter;
use crate::audit::AuditAnchor;
use crate::jobs::{JobStore, JobStoreError};
use crate::ledger::{ConfirmationStatus, Ledger};
use crate::refunds::RefundExecutor;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RefundReconcilerConfig {
    pub interval: Duration,
    /// Minimum gap between repeated alerts for the same condition.
    pub alert_throttle: Duration,
    /// Re-issues per job before escalating instead.
    pub retry_max: u32,
    /// Minimum gap between re-issues of the same refund.
    pub retry_interval: Duration,
}

impl Default for RefundReconcilerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(120),
            alert_throttle: Duration::from_secs(3_600),
            retry_max: 3,
            retry_interval: Duration::from_secs(300),
        }
    }
}

/// What one reconciliation pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileSummary {
    pub unsigned: usize,
    pub unsigned_alerted: bool,
    pub confirmed: usize,
    pub reissued: usize,
    pub escalated: usize,
    /// Passes that stopped early on a storage error.
    pub failed_passes: Vec<&'static str>,
}

/// Finds refunds that are unsigned or unconfirmed and drives them to a
/// confirmed signature or an operator alert.
///
/// Throttle timestamps and retry counters live on the job rows, so a restart
/// neither repeats alerts nor resets retries.
#[derive(Clone)]
pub struct RefundReconciler {
    store: Arc<dyn JobStore>,
    ledger: Arc<dyn Ledger>,
    refunds: RefundExecutor,
    anchor: AuditAnchor,
    alerter: Alerter,
    config: RefundReconcilerConfig,
}

impl RefundReconciler {
    pub fn new(
        store: Arc<dyn JobStore>,
        ledger: Arc<dyn Ledger>,
        refunds: RefundExecutor,
        anchor: AuditAnchor,
        alerter: Alerter,
        config: RefundReconcilerConfig,
    ) -> Self {
        Self {
            store,
            ledger,
            refunds,
            anchor,
            alerter,
            config,
        }
    }

    /// Run the unsigned and the unconfirmed pass. Each runs regardless of
    /// how the other went.
    pub async fn reconcile(&self) -> ReconcileSummary {
        let mut summary = ReconcileSummary::default();
        if let Err(err) = self.reconcile_unsigned(&mut summary).await {
            error!(error = %err, "unsigned refund pass failed");
            summary.failed_passes.push("unsigned");
        }
        if let Err(err) = self.reconcile_unconfirmed(&mut summary).await {
            error!(error = %err, "unconfirmed refund pass failed");
            summary.failed_passes.push("unconfirmed");
        }
        summary
    }

    fn throttle_elapsed(&self, last: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
        let window = chrono::Duration::from_std(self.config.alert_throttle).unwrap_or(chrono::Duration::MAX);
        last.is_none_or(|at| now - at >= window)
    }

    #[instrument(skip(self, summary))]
    async fn reconcile_unsigned(&self, summary: &mut ReconcileSummary) -> Result<(), JobStoreError> {
        let unsigned = self.store.get_unsigned_refund_jobs().await?;
        summary.unsigned = unsigned.len();
        if unsigned.is_empty() {
            return Ok(());
        }

        let now = Utc::now();
        let last_alert = self.store.get_most_recent_refund_alert_timestamp().await?;
        if !self.throttle_elapsed(last_alert, now) {
            debug!(count = unsigned.len(), ?last_alert, "unsigned refund alert throttled");
            return Ok(());
        }

        let ids: Vec<_> = unsigned.iter().map(|j| j.id).collect();
        let id_list = ids.iter().map(ToString::to_string).collect::<Vec<_>>().join(", ");

        let event = AuditEvent::new("unsigned_refunds", now)
            .with_jobs(ids.iter().copied())
            .with_details(format!("{} refunded job(s) without a refund signature", ids.len()));
        let anchored = match self.anchor.anchor(&event).await {
            Ok(result) => Some(result.audit_hash),
            Err(err) => {
                warn!(error = %err, "anchoring unsigned refund anomaly failed");
                None
            }
        };

        let mut details = format!("Jobs marked 'refunded' but missing a refund signature: {id_list}");
        if let Some(hash) = &anchored {
            details.push_str(&format!("\naudit_hash: {hash}"));
        }
        self.alerter
            .dispatch(
                Alert::critical(format!("Unsigned refunded jobs ({})", ids.len()), details)
                    .with_tags(["refund", "reconciliation"]),
            )
            .await;
        summary.unsigned_alerted = true;

        if let Err(err) = self.store.mark_jobs_alerted(&ids).await {
            error!(error = %err, "failed to persist unsigned refund alert time");
        }
        Ok(())
    }

    #[instrument(skip(self, summary))]
    async fn reconcile_unconfirmed(&self, summary: &mut ReconcileSummary) -> Result<(), JobStoreError> {
        let pending: Vec<Job> = self
            .store
            .get_jobs_by_status(JobStatus::Refunded)
            .await?
            .into_iter()
            .filter(Job::awaiting_refund_confirmation)
            .collect();

        for job in pending {
            let Some(signature) = job.refund_signature.clone() else {
                continue;
            };

            match self.ledger.confirmation_status(&signature).await {
                Ok(ConfirmationStatus::Confirmed) => match self.store.confirm_refund(job.id).await {
                    Ok(_) => {
                        info!(job_id = %job.id, %signature, "refund confirmed");
                        summary.confirmed += 1;
                    }
                    Err(err) => error!(job_id = %job.id, error = %err, "failed to record refund confirmation"),
                },
                Ok(status) => {
                    debug!(job_id = %job.id, %signature, ?status, "refund not confirmed");
                    self.handle_unconfirmed(&job, summary).await;
                }
                Err(err) => warn!(job_id = %job.id, %signature, error = %err, "refund status check failed"),
            }
        }
        Ok(())
    }

    async fn handle_unconfirmed(&self, job: &Job, summary: &mut ReconcileSummary) {
        let now = Utc::now();

        if job.refund_retry_count >= self.config.retry_max {
            if !self.throttle_elapsed(job.refund_unconfirmed_alert_at, now) {
                debug!(job_id = %job.id, "per-job refund alert throttled");
                return;
            }
            self.alerter
                .dispatch(
                    Alert::critical(
                        format!("Refund not confirmed for job {}", job.id),
                        format!(
                            "Refund tx {} still unconfirmed after {} retries",
                            job.refund_signature.as_deref().unwrap_or("-"),
                            job.refund_retry_count
                        ),
                    )
                    .with_tags(["refund", "reconciliation"]),
                )
                .await;
            summary.escalated += 1;
            if let Err(err) = self.store.mark_unconfirmed_alerted(job.id).await {
                error!(job_id = %job.id, error = %err, "failed to persist per-job alert time");
            }
            return;
        }

        // Measured from the last re-issue, or from when the job was refunded.
        let last_attempt = job.refund_last_attempt_at.or(job.completed_at).unwrap_or(job.created_at);
        let interval = chrono::Duration::from_std(self.config.retry_interval).unwrap_or(chrono::Duration::MAX);
        if now - last_attempt < interval {
            return;
        }

        // Count the attempt before issuing it so a crash cannot double-spend the budget.
        let job = match self.store.increment_refund_retry(job.id).await {
            Ok(job) => job,
            Err(err) => {
                error!(job_id = %job.id, error = %err, "failed to record refund retry");
                return;
            }
        };
        info!(job_id = %job.id, attempt = job.refund_retry_count, "re-issuing refund");
        match self.refunds.reissue(&job).await {
            Ok(_) => summary.reissued += 1,
            Err(err) => warn!(job_id = %job.id, error = %err, "refund re-issue failed"),
        }
    }
}

#[async_trait]
impl PeriodicTask for RefundReconciler {
    fn name(&self) -> &'static str {
        "refund_reconciler"
    }

    async fn tick(&self) {
        let summary = self.reconcile().await;
        if summary.failed_passes.is_empty() {
            debug!(?summary, "refund reconciliation pass done");
        } else {
            warn!(?summary, "refund reconciliation pass incomplete");
        }
    }
}

//! Refund execution and its durable audit trail.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tracing::{error, info, instrument, warn};

use swarmrouter_core::{Job, JobId, JobStatus, RetryPolicy};

use crate::jobs::{JobStore, JobStoreError};
use crate::ledger::{Ledger, LedgerError};
use crate::retry::with_retry;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefundOutcome {
    Sent,
    Reissued,
    Failed,
}

/// One line of the refund audit log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefundAuditEntry {
    pub job_id: JobId,
    pub wallet: String,
    pub amount: u64,
    pub tx: Option<String>,
    pub outcome: RefundOutcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub at: DateTime<Utc>,
}

#[async_trait]
pub trait RefundAuditLog: Send + Sync {
    async fn append(&self, entry: &RefundAuditEntry) -> std::io::Result<()>;
}

/// Appends one JSON object per line.
#[derive(Debug, Clone)]
pub struct JsonlRefundAuditLog {
    path: PathBuf,
}

impl JsonlRefundAuditLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl RefundAuditLog for JsonlRefundAuditLog {
    async fn append(&self, entry: &RefundAuditEntry) -> std::io::Result<()> {
        if let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(dir).await?;
        }
        let mut line = serde_json::to_vec(entry)?;
        line.push(b'\n');

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(&line).await?;
        file.flush().await
    }
}

/// In-memory refund audit log for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryRefundAuditLog {
    entries: Mutex<Vec<RefundAuditEntry>>,
}

impl InMemoryRefundAuditLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<RefundAuditEntry> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

#[async_trait]
impl RefundAuditLog for InMemoryRefundAuditLog {
    async fn append(&self, entry: &RefundAuditEntry) -> std::io::Result<()> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(entry.clone());
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RefundError {
    #[error("job {0} is not refunded")]
    NotRefunded(JobId),
    #[error("refund transfer failed: {0}")]
    Transfer(#[from] LedgerError),
    #[error("refund signature not persisted: {0}")]
    Store(#[from] JobStoreError),
}

/// The one place refund transfers are issued.
///
/// A failed transfer never produces a signature; the job stays unsigned for
/// the reconciler to escalate.
#[derive(Clone)]
pub struct RefundExecutor {
    ledger: Arc<dyn Ledger>,
    store: Arc<dyn JobStore>,
    audit_log: Arc<dyn RefundAuditLog>,
    policy: RetryPolicy,
}

impl RefundExecutor {
    pub fn new(
        ledger: Arc<dyn Ledger>,
        store: Arc<dyn JobStore>,
        audit_log: Arc<dyn RefundAuditLog>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            ledger,
            store,
            audit_log,
            policy,
        }
    }

    /// First refund of a job that just became `refunded`.
    pub async fn execute(&self, job: &Job) -> Result<String, RefundError> {
        self.refund(job, &self.policy, RefundOutcome::Sent).await
    }

    /// Single re-issue attempt; the caller owns the retry schedule.
    pub async fn reissue(&self, job: &Job) -> Result<String, RefundError> {
        self.refund(job, &RetryPolicy::no_retry(), RefundOutcome::Reissued).await
    }

    #[instrument(skip(self, job, policy), fields(job_id = %job.id, amount = job.paid_amount))]
    async fn refund(
        &self,
        job: &Job,
        policy: &RetryPolicy,
        outcome: RefundOutcome,
    ) -> Result<String, RefundError> {
        if job.status != JobStatus::Refunded {
            return Err(RefundError::NotRefunded(job.id));
        }

        let transfer = with_retry(policy, "refund_transfer", |_| {
            self.ledger.transfer(&job.requester, job.paid_amount)
        })
        .await;

        let signature = match transfer {
            Ok(signature) => signature,
            Err(err) => {
                error!(error = %err, "refund transfer failed, job left unsigned");
                self.audit(job, None, RefundOutcome::Failed, Some(err.to_string())).await;
                return Err(err.into());
            }
        };

        self.audit(job, Some(signature.clone()), outcome, None).await;

        self.store.set_refund_signature(job.id, &signature).await?;
        info!(%signature, "refund signature persisted");
        Ok(signature)
    }

    async fn audit(
        &self,
        job: &Job,
        tx: Option<String>,
        outcome: RefundOutcome,
        error: Option<String>,
    ) {
        let entry = RefundAuditEntry {
            job_id: job.id,
            wallet: job.requester.clone(),
            amount: job.paid_amount,
            tx,
            outcome,
            error,
            at: Utc::now(),
        };
        if let Err(err) = self.audit_log.append(&entry).await {
            warn!(job_id = %job.id, error = %err, "refund audit append failed");
        }
    }
}

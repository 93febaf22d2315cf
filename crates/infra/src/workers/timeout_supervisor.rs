use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{error, info, warn};

use swarmrouter_core::JobStatus;

use super::PeriodicTask;
use crate::jobs::{JobStore, JobStoreError};
use crate::refunds::RefundExecutor;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeoutSupervisorConfig {
    pub interval: Duration,
    pub max_retries: u32,
}

impl Default for TimeoutSupervisorConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            max_retries: 3,
        }
    }
}

/// Outcome counts of one supervisor pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TimeoutSummary {
    pub requeued: usize,
    pub refunded: usize,
    /// Refunded, but the transfer did not go through.
    pub refund_failures: usize,
    pub errors: usize,
}

/// Finds stalled processing jobs and applies the retry/refund policy.
#[derive(Clone)]
pub struct TimeoutSupervisor {
    store: Arc<dyn JobStore>,
    refunds: RefundExecutor,
    config: TimeoutSupervisorConfig,
}

impl TimeoutSupervisor {
    pub fn new(store: Arc<dyn JobStore>, refunds: RefundExecutor, config: TimeoutSupervisorConfig) -> Self {
        Self {
            store,
            refunds,
            config,
        }
    }

    pub async fn check_timeouts(&self) -> Result<TimeoutSummary, JobStoreError> {
        let timed_out = self.store.get_timed_out_jobs().await?;
        let mut summary = TimeoutSummary::default();
        if timed_out.is_empty() {
            return Ok(summary);
        }
        warn!(count = timed_out.len(), "found timed-out jobs");

        for job in timed_out {
            let updated = match self.store.handle_failure(job.id, self.config.max_retries).await {
                Ok(updated) => updated,
                // Completed or re-handled concurrently; the row already moved on.
                Err(JobStoreError::StaleTransition(reason)) => {
                    info!(job_id = %job.id, %reason, "timed-out job changed concurrently, skipping");
                    continue;
                }
                Err(err) => {
                    error!(job_id = %job.id, error = %err, "failed to handle timed-out job");
                    summary.errors += 1;
                    continue;
                }
            };

            match updated.status {
                JobStatus::Refunded => {
                    summary.refunded += 1;
                    if let Err(err) = self.refunds.execute(&updated).await {
                        error!(job_id = %updated.id, error = %err, "refund execution failed");
                        summary.refund_failures += 1;
                    }
                }
                JobStatus::Queued => {
                    info!(job_id = %updated.id, retry_count = updated.retry_count, "job re-queued");
                    summary.requeued += 1;
                }
                other => warn!(job_id = %updated.id, status = %other, "unexpected status after failure handling"),
            }
        }

        Ok(summary)
    }
}

#[async_trait]
impl PeriodicTask for TimeoutSupervisor {
    fn name(&self) -> &'static str {
        "timeout_supervisor"
    }

    async fn tick(&self) {
        if let Err(err) = self.check_timeouts().await {
            error!(error = %err, "timeout check failed");
        }
    }
}

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use swarmrouter_core::{AuditEvent, JobId, NewJob, ValidatorId};
use swarmrouter_infra::{AnchorResult, LedgerEntry, LedgerEventKind};

use crate::app::service::{CompletionOutcome, CompletionReport, SubmitOutcome};

// -------------------------
// Request DTOs
// -------------------------

/// Missing fields deserialize to empty values so that validation can name them.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct SubmitJobRequest {
    #[serde(alias = "user_wallet", alias = "userWallet")]
    pub requester: String,
    pub prompt: String,
    pub model: String,
    #[serde(alias = "maxTokens")]
    pub max_tokens: u32,
    #[serde(alias = "nsd_burned", alias = "nsdBurned")]
    pub paid_amount: u64,
    #[serde(alias = "burn_tx_signature", alias = "burnTxSignature")]
    pub payment_proof: String,
}

impl From<SubmitJobRequest> for NewJob {
    fn from(req: SubmitJobRequest) -> Self {
        NewJob {
            requester: req.requester,
            prompt: req.prompt,
            model: req.model,
            max_tokens: req.max_tokens,
            paid_amount: req.paid_amount,
            payment_proof: req.payment_proof,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct CompleteJobRequest {
    #[serde(alias = "jobId")]
    pub job_id: JobId,
    #[serde(alias = "validatorId")]
    pub validator_id: ValidatorId,
    #[serde(default = "default_success")]
    pub success: bool,
    #[serde(default, alias = "inferenceResult")]
    pub result: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default, alias = "feeAmount")]
    pub fee_amount: Option<u64>,
    #[serde(default, alias = "userWallet")]
    pub user_wallet: Option<String>,
}

fn default_success() -> bool {
    true
}

impl From<CompleteJobRequest> for CompletionReport {
    fn from(req: CompleteJobRequest) -> Self {
        CompletionReport {
            job_id: req.job_id,
            validator_id: req.validator_id,
            success: req.success,
            result: req.result,
            error: req.error,
            fee_amount: req.fee_amount,
            user_wallet: req.user_wallet,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct AnchorEventRequest {
    #[serde(default, alias = "eventType")]
    pub event_type: String,
    /// Defaults to the time the request is received.
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default, alias = "triggeringJobIds")]
    pub triggering_job_ids: Vec<JobId>,
    #[serde(default)]
    pub details: Option<String>,
    #[serde(default)]
    pub metadata: JsonValue,
}

impl AnchorEventRequest {
    pub fn into_event(self, now: DateTime<Utc>) -> AuditEvent {
        let mut event = AuditEvent::new(self.event_type, self.timestamp.unwrap_or(now))
            .with_jobs(self.triggering_job_ids)
            .with_metadata(self.metadata);
        event.details = self.details;
        event
    }
}

#[derive(Debug, Deserialize)]
pub struct RecordLedgerEventRequest {
    #[serde(alias = "type", alias = "event_type")]
    pub kind: LedgerEventKind,
    pub payload: JsonValue,
}

// -------------------------
// Response DTOs
// -------------------------

#[derive(Debug, Serialize)]
pub struct ValidatorRef {
    pub id: String,
    pub endpoint: String,
}

#[derive(Debug, Serialize)]
pub struct SubmitJobResponse {
    pub status: &'static str,
    pub job_id: JobId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub validator: Option<ValidatorRef>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<&'static str>,
}

impl From<SubmitOutcome> for SubmitJobResponse {
    fn from(outcome: SubmitOutcome) -> Self {
        match outcome {
            SubmitOutcome::Assigned {
                job,
                validator_id,
                endpoint,
            } => SubmitJobResponse {
                status: "assigned",
                job_id: job.id,
                validator: Some(ValidatorRef {
                    id: validator_id.as_str().to_string(),
                    endpoint,
                }),
                message: None,
            },
            SubmitOutcome::Queued { job } => SubmitJobResponse {
                status: "queued",
                job_id: job.id,
                validator: None,
                message: Some("Request queued. No validators currently available."),
            },
        }
    }
}

#[derive(Debug, Serialize)]
pub struct CompleteJobResponse {
    /// Job status after the report.
    pub status: String,
    pub job_id: JobId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tx_signature: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reputation: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refund_signature: Option<String>,
    pub retry_count: u32,
}

impl From<CompletionOutcome> for CompleteJobResponse {
    fn from(outcome: CompletionOutcome) -> Self {
        match outcome {
            CompletionOutcome::Completed {
                job,
                fee_signature,
                reputation,
            } => CompleteJobResponse {
                status: job.status.to_string(),
                job_id: job.id,
                tx_signature: Some(fee_signature),
                reputation: Some(reputation),
                refund_signature: None,
                retry_count: job.retry_count,
            },
            CompletionOutcome::Failed { job, refund_signature } => CompleteJobResponse {
                status: job.status.to_string(),
                job_id: job.id,
                tx_signature: None,
                reputation: None,
                refund_signature,
                retry_count: job.retry_count,
            },
        }
    }
}

#[derive(Debug, Serialize)]
pub struct AnchorEventResponse {
    #[serde(flatten)]
    pub result: AnchorResult,
    pub complete: bool,
}

impl From<AnchorResult> for AnchorEventResponse {
    fn from(result: AnchorResult) -> Self {
        let complete = result.is_complete();
        Self { result, complete }
    }
}

#[derive(Debug, Serialize)]
pub struct LedgerEventAccepted {
    pub id: String,
    pub kind: LedgerEventKind,
    pub payload_hash: String,
    pub anchored: bool,
}

impl From<LedgerEntry> for LedgerEventAccepted {
    fn from(entry: LedgerEntry) -> Self {
        Self {
            id: entry.id.to_string(),
            kind: entry.kind,
            payload_hash: entry.payload_hash,
            anchored: entry.anchored,
        }
    }
}

use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde_json::json;
use tracing::error;

use swarmrouter_infra::{AnchorError, LedgerError};

use crate::app::service::ServiceError;

pub fn service_error_to_response(err: ServiceError) -> axum::response::Response {
    match err {
        ServiceError::Validation(msg) => json_error(StatusCode::BAD_REQUEST, "validation_error", msg),
        ServiceError::PaymentRejected => json_error(
            StatusCode::PAYMENT_REQUIRED,
            "payment_rejected",
            "Invalid payment signature",
        ),
        ServiceError::JobNotFound(id) => json_error(StatusCode::NOT_FOUND, "job_not_found", format!("job {id} not found")),
        ServiceError::ValidatorNotFound(id) => json_error(
            StatusCode::NOT_FOUND,
            "validator_not_found",
            format!("validator {id} not found"),
        ),
        ServiceError::LedgerEntryNotFound(id) => json_error(
            StatusCode::NOT_FOUND,
            "ledger_entry_not_found",
            format!("ledger entry {id} not found"),
        ),
        ServiceError::Conflict(msg) => json_error(StatusCode::CONFLICT, "conflict", msg),
        ServiceError::Ledger(LedgerError::Timeout) => {
            json_error(StatusCode::GATEWAY_TIMEOUT, "ledger_timeout", "ledger call timed out")
        }
        ServiceError::Ledger(e) => json_error(StatusCode::BAD_GATEWAY, "ledger_error", e.to_string()),
        ServiceError::Anchor(e @ AnchorError::PinningFailed { .. }) => {
            json_error(StatusCode::BAD_GATEWAY, "pinning_failed", e.to_string())
        }
        ServiceError::Storage(msg) => {
            error!(error = %msg, "storage failure while serving request");
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "store_error", msg)
        }
    }
}

pub fn json_error(
    status: StatusCode,
    code: &'static str,
    message: impl Into<String>,
) -> axum::response::Response {
    (
        status,
        axum::Json(json!({
            "error": code,
            "message": message.into(),
        })),
    )
        .into_response()
}

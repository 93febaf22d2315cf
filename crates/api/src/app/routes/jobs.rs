use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Extension, Path},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
};

use swarmrouter_core::JobId;

use crate::app::service::{RouterService, SubmitOutcome};
use crate::app::{dto, errors};

pub fn router() -> Router {
    Router::new()
        .route("/submit", post(submit_job))
        .route("/complete", post(complete_job))
        .route("/:id", get(get_job))
}

pub async fn submit_job(
    Extension(router): Extension<Arc<RouterService>>,
    Json(body): Json<dto::SubmitJobRequest>,
) -> axum::response::Response {
    match router.submit_job(body.into()).await {
        Ok(outcome) => {
            let status = match outcome {
                SubmitOutcome::Assigned { .. } => StatusCode::OK,
                SubmitOutcome::Queued { .. } => StatusCode::ACCEPTED,
            };
            (status, Json(dto::SubmitJobResponse::from(outcome))).into_response()
        }
        Err(e) => errors::service_error_to_response(e),
    }
}

pub async fn complete_job(
    Extension(router): Extension<Arc<RouterService>>,
    Json(body): Json<dto::CompleteJobRequest>,
) -> axum::response::Response {
    match router.complete_job(body.into()).await {
        Ok(outcome) => Json(dto::CompleteJobResponse::from(outcome)).into_response(),
        Err(e) => errors::service_error_to_response(e),
    }
}

pub async fn get_job(
    Extension(router): Extension<Arc<RouterService>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let id: JobId = match id.parse() {
        Ok(id) => id,
        Err(_) => return errors::json_error(StatusCode::BAD_REQUEST, "invalid_id", "invalid job id"),
    };

    match router.get_job(id).await {
        Ok(job) => Json(job).into_response(),
        Err(e) => errors::service_error_to_response(e),
    }
}

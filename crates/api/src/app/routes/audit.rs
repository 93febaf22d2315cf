use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Extension, Path},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
};
use chrono::Utc;

use swarmrouter_core::LedgerEntryId;

use crate::app::service::RouterService;
use crate::app::{dto, errors};

pub fn router() -> Router {
    Router::new()
        .route("/audit/anchor", post(anchor_event))
        .route("/ledger/events", post(record_ledger_event))
        .route("/ledger/events/:id", get(get_ledger_event))
}

pub async fn anchor_event(
    Extension(router): Extension<Arc<RouterService>>,
    Json(body): Json<dto::AnchorEventRequest>,
) -> axum::response::Response {
    match router.anchor_event(body.into_event(Utc::now())).await {
        Ok(result) => Json(dto::AnchorEventResponse::from(result)).into_response(),
        Err(e) => errors::service_error_to_response(e),
    }
}

pub async fn record_ledger_event(
    Extension(router): Extension<Arc<RouterService>>,
    Json(body): Json<dto::RecordLedgerEventRequest>,
) -> axum::response::Response {
    match router.record_ledger_event(body.kind, body.payload).await {
        Ok(entry) => (StatusCode::ACCEPTED, Json(dto::LedgerEventAccepted::from(entry))).into_response(),
        Err(e) => errors::service_error_to_response(e),
    }
}

pub async fn get_ledger_event(
    Extension(router): Extension<Arc<RouterService>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let id: LedgerEntryId = match id.parse() {
        Ok(id) => id,
        Err(_) => return errors::json_error(StatusCode::BAD_REQUEST, "invalid_id", "invalid ledger entry id"),
    };

    match router.get_ledger_event(id).await {
        Ok(entry) => Json(entry).into_response(),
        Err(e) => errors::service_error_to_response(e),
    }
}

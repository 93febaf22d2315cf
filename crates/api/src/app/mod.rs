//! HTTP API application wiring (Axum router + service wiring).
//!
//! - `service.rs`: the router's operations (submit, complete, anchor, ledger events)
//! - `services.rs`: capability clients, stores and background workers
//! - `routes/`: HTTP routes + handlers (one file per area)
//! - `dto.rs`: request/response DTOs
//! - `errors.rs`: consistent error responses

use std::sync::Arc;

use axum::{Extension, Router, routing::get};
use tower::ServiceBuilder;

pub mod dto;
pub mod errors;
pub mod routes;
pub mod service;
pub mod services;

use service::RouterService;

/// Build the full HTTP router (public entrypoint used by `main.rs`).
pub fn build_app(router: Arc<RouterService>) -> Router {
    let api = routes::router().layer(Extension(router));

    Router::new()
        .route("/health", get(routes::system::health))
        .nest("/api/v1", api)
        .layer(ServiceBuilder::new())
}

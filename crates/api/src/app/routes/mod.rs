use axum::Router;

pub mod audit;
pub mod jobs;
pub mod system;

/// Router for everything under `/api/v1`.
pub fn router() -> Router {
    Router::new()
        .nest("/request", jobs::router())
        .merge(audit::router())
}

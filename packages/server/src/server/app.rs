//! Application setup and server configuration.

use axum::{
    extract::Extension,
    routing::{get, post},
    Router,
};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::kernel::jobs::JobManager;
use crate::server::routes::{
    cancel_job_handler, create_job_handler, delete_job_handler, download_report_handler,
    get_job_handler, health_handler, list_jobs_handler,
};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub jobs: JobManager,
}

impl AppState {
    pub fn new(jobs: JobManager) -> Self {
        Self { jobs }
    }
}

/// Build the Axum application router
pub fn build_app(state: AppState) -> Router {
    Router::new()
        .route(
            "/api/v1/jobs",
            post(create_job_handler).get(list_jobs_handler),
        )
        .route(
            "/api/v1/jobs/:job_id",
            get(get_job_handler).delete(delete_job_handler),
        )
        .route("/api/v1/jobs/:job_id/cancel", post(cancel_job_handler))
        .route("/api/v1/jobs/:job_id/download", get(download_report_handler))
        .route("/health", get(health_handler))
        .layer(Extension(state))
        // Any origin, any method: the API is consumed by a separately served UI
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

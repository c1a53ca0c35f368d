use axum::{
    body::Body,
    extract::{Extension, Path, Query},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::kernel::jobs::{JobError, JobRequest, JobStatus, JobSummary, Report};
use crate::server::app::AppState;

const DEFAULT_LIST_LIMIT: usize = 20;

// ============================================================================
// Errors
// ============================================================================

/// Error response body: `{"detail": "..."}`.
#[derive(Debug)]
pub enum ApiError {
    NotFound(&'static str),
    Unprocessable(String),
    Internal(JobError),
}

impl From<JobError> for ApiError {
    fn from(err: JobError) -> Self {
        match err {
            JobError::NotFound(_) => ApiError::NotFound("Job not found"),
            JobError::ReportNotFound(_) => ApiError::NotFound("Report not found"),
            other => ApiError::Internal(other),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, detail) = match self {
            ApiError::NotFound(detail) => (StatusCode::NOT_FOUND, detail.to_string()),
            ApiError::Unprocessable(detail) => (StatusCode::UNPROCESSABLE_ENTITY, detail),
            ApiError::Internal(err) => {
                tracing::error!(error = %err, "request failed");
                (StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
            }
        };
        (status, Json(serde_json::json!({ "detail": detail }))).into_response()
    }
}

/// Unknown and malformed ids are both just "not found".
fn parse_job_id(raw: &str) -> Result<Uuid, ApiError> {
    Uuid::parse_str(raw).map_err(|_| ApiError::NotFound("Job not found"))
}

// ============================================================================
// Responses
// ============================================================================

#[derive(Debug, Serialize, Deserialize)]
pub struct CreateJobResponse {
    pub job_id: Uuid,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StatusResponse {
    pub status: String,
}

/// Full job snapshot with the request payload parsed back into JSON.
#[derive(Debug, Serialize, Deserialize)]
pub struct JobStatusResponse {
    pub id: Uuid,
    pub status: JobStatus,
    pub logs: String,
    pub report_html: Option<String>,
    pub report_markdown: Option<String>,
    pub report_path: Option<String>,
    pub error: Option<String>,
    pub request_payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
pub struct ListParams {
    pub limit: Option<usize>,
}

// ============================================================================
// Handlers
// ============================================================================

/// POST /api/v1/jobs
pub async fn create_job_handler(
    Extension(state): Extension<AppState>,
    Json(request): Json<JobRequest>,
) -> Result<Json<CreateJobResponse>, ApiError> {
    if request.query.as_deref().map_or(true, |q| q.trim().is_empty()) {
        return Err(ApiError::Unprocessable("query is required".to_string()));
    }

    let job_id = state.jobs.submit(request).await?;
    Ok(Json(CreateJobResponse { job_id }))
}

/// GET /api/v1/jobs?limit=N
pub async fn list_jobs_handler(
    Extension(state): Extension<AppState>,
    Query(params): Query<ListParams>,
) -> Result<Json<Vec<JobSummary>>, ApiError> {
    let limit = params.limit.unwrap_or(DEFAULT_LIST_LIMIT);
    Ok(Json(state.jobs.list_jobs(limit).await?))
}

/// GET /api/v1/jobs/:job_id
pub async fn get_job_handler(
    Extension(state): Extension<AppState>,
    Path(job_id): Path<String>,
) -> Result<Json<JobStatusResponse>, ApiError> {
    let id = parse_job_id(&job_id)?;
    let job = state
        .jobs
        .get_status(id)
        .await?
        .ok_or(ApiError::NotFound("Job not found"))?;

    let request_payload = job.request_json();
    Ok(Json(JobStatusResponse {
        id: job.id,
        status: job.status,
        logs: job.logs,
        report_html: job.report_html,
        report_markdown: job.report_markdown,
        report_path: job.report_path,
        error: job.error,
        request_payload,
        created_at: job.created_at,
        updated_at: job.updated_at,
    }))
}

/// POST /api/v1/jobs/:job_id/cancel
pub async fn cancel_job_handler(
    Extension(state): Extension<AppState>,
    Path(job_id): Path<String>,
) -> Result<Json<StatusResponse>, ApiError> {
    let id = parse_job_id(&job_id)?;
    let outcome = state.jobs.cancel(id).await?;
    Ok(Json(StatusResponse {
        status: outcome.status().to_string(),
    }))
}

/// DELETE /api/v1/jobs/:job_id
pub async fn delete_job_handler(
    Extension(state): Extension<AppState>,
    Path(job_id): Path<String>,
) -> Result<Json<StatusResponse>, ApiError> {
    let id = parse_job_id(&job_id)?;
    state.jobs.delete(id).await?;
    Ok(Json(StatusResponse {
        status: "deleted".to_string(),
    }))
}

/// GET /api/v1/jobs/:job_id/download
pub async fn download_report_handler(
    Extension(state): Extension<AppState>,
    Path(job_id): Path<String>,
) -> Result<Response, ApiError> {
    let id = parse_job_id(&job_id)?;
    let report = state.jobs.fetch_report(id).await?;
    let media_type = report.media_type();

    let response = match report {
        Report::Html(content) => attachment(media_type, download_name(id, "html"), content),
        Report::Markdown(content) => attachment(media_type, download_name(id, "md"), content),
        Report::File(path) => {
            let bytes = tokio::fs::read(&path).await.map_err(|e| {
                tracing::warn!(path = %path.display(), error = %e, "report file unreadable");
                ApiError::NotFound("Report not found")
            })?;
            ([(header::CONTENT_TYPE, media_type)], Body::from(bytes)).into_response()
        }
    };
    Ok(response)
}

fn download_name(id: Uuid, extension: &str) -> String {
    let short: String = id.to_string().chars().take(8).collect();
    format!("mediamonitor-{}.{}", short, extension)
}

fn attachment(media_type: &'static str, filename: String, content: String) -> Response {
    (
        [
            (header::CONTENT_TYPE, media_type.to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{}\"", filename),
            ),
        ],
        content,
    )
        .into_response()
}

//! Export job endpoints: submit, inspect, download, delete, and trigger cleanup.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::{json, Value};
use tracing::{error, info, warn};
use uuid::Uuid;

use stupid_export::service::ArtifactLookup;
use stupid_export::{ExportError, JobId};

use crate::state::AppState;

type ApiError = (StatusCode, Json<Value>);

const DEFAULT_LIST_LIMIT: usize = 50;

fn api_error(status: StatusCode, message: impl Into<String>) -> ApiError {
    (status, Json(json!({ "error": message.into() })))
}

fn not_found(job_id: &str) -> ApiError {
    api_error(StatusCode::NOT_FOUND, format!("export job not found: {}", job_id))
}

fn export_error(e: ExportError) -> ApiError {
    if e.is_client_error() {
        api_error(StatusCode::BAD_REQUEST, e.user_message())
    } else {
        error!(error = %e, "Export request failed");
        api_error(StatusCode::INTERNAL_SERVER_ERROR, e.user_message())
    }
}

/// Unparsable ids cannot name a job, so they read as unknown.
fn parse_job_id(raw: &str) -> Result<JobId, ApiError> {
    Uuid::parse_str(raw).map_err(|_| not_found(raw))
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<Json<Value>, ApiError> {
    serde_json::to_value(value)
        .map(Json)
        .map_err(|e| api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))
}

// ── Submission ────────────────────────────────────────────────

/// Submit an export job. Returns the pending job immediately.
#[utoipa::path(
    post,
    path = "/export",
    tag = "Export",
    request_body(content = Object, description = "Export configuration: data_types, start_date, end_date, format, compress, batch_size, filters, process_filter"),
    responses(
        (status = 202, description = "Job accepted", body = Object),
        (status = 400, description = "Invalid configuration", body = Object)
    )
)]
pub async fn submit_export(
    State(state): State<Arc<AppState>>,
    Json(body): Json<Value>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let job = state.export.submit_json(body).await.map_err(export_error)?;
    Ok((StatusCode::ACCEPTED, to_json(&job)?))
}

// ── Queries ───────────────────────────────────────────────────

#[derive(serde::Deserialize, utoipa::IntoParams)]
pub struct ListParams {
    /// Maximum jobs to return (default 50).
    pub limit: Option<usize>,
    /// Jobs to skip, newest first.
    pub offset: Option<usize>,
}

/// List export jobs, newest first.
#[utoipa::path(
    get,
    path = "/export/jobs",
    tag = "Export",
    params(ListParams),
    responses(
        (status = 200, description = "Page of export jobs", body = Object)
    )
)]
pub async fn list_exports(
    State(state): State<Arc<AppState>>,
    Query(params): Query<ListParams>,
) -> Result<Json<Value>, ApiError> {
    let limit = params.limit.unwrap_or(DEFAULT_LIST_LIMIT);
    let offset = params.offset.unwrap_or(0);
    let jobs = state
        .export
        .list_jobs(limit, offset)
        .await
        .map_err(export_error)?;
    Ok(Json(json!({
        "jobs": jobs,
        "limit": limit,
        "offset": offset,
    })))
}

#[utoipa::path(
    get,
    path = "/export/{job_id}/status",
    tag = "Export",
    params(("job_id" = String, Path, description = "Export job ID")),
    responses(
        (status = 200, description = "Export job record", body = Object),
        (status = 404, description = "Unknown job", body = Object)
    )
)]
pub async fn export_status(
    State(state): State<Arc<AppState>>,
    Path(job_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let id = parse_job_id(&job_id)?;
    match state.export.get_status(id).await.map_err(export_error)? {
        Some(job) => to_json(&job),
        None => Err(not_found(&job_id)),
    }
}

#[utoipa::path(
    get,
    path = "/export/{job_id}/progress",
    tag = "Export",
    params(("job_id" = String, Path, description = "Export job ID")),
    responses(
        (status = 200, description = "Job status and progress", body = Object),
        (status = 404, description = "Unknown job", body = Object)
    )
)]
pub async fn export_progress(
    State(state): State<Arc<AppState>>,
    Path(job_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let id = parse_job_id(&job_id)?;
    match state.export.get_progress(id).await.map_err(export_error)? {
        Some(report) => to_json(&report),
        None => Err(not_found(&job_id)),
    }
}

// ── Delivery ──────────────────────────────────────────────────

/// Download a completed job's artifact.
///
/// The whole file is read into memory before it is sent.
#[utoipa::path(
    get,
    path = "/export/{job_id}/download",
    tag = "Export",
    params(("job_id" = String, Path, description = "Export job ID")),
    responses(
        (status = 200, description = "Artifact bytes", content_type = "application/octet-stream"),
        (status = 404, description = "Unknown job or artifact gone", body = Object),
        (status = 409, description = "Job has not completed", body = Object)
    )
)]
pub async fn download_export(
    State(state): State<Arc<AppState>>,
    Path(job_id): Path<String>,
) -> Result<Response, ApiError> {
    let id = parse_job_id(&job_id)?;
    let (path, format, compress) = match state.export.artifact(id).await.map_err(export_error)? {
        ArtifactLookup::Ready {
            path,
            format,
            compress,
        } => (path, format, compress),
        ArtifactLookup::UnknownJob => return Err(not_found(&job_id)),
        ArtifactLookup::NotReady(status) => {
            return Err(api_error(
                StatusCode::CONFLICT,
                format!("export job is {}, not completed", status.as_str()),
            ))
        }
        ArtifactLookup::NoArtifact => {
            return Err(api_error(
                StatusCode::NOT_FOUND,
                "export job matched no records and has no file",
            ))
        }
        ArtifactLookup::Missing(path) => {
            warn!(job_id = %id, path = %path.display(), "Export artifact missing on download");
            return Err(api_error(StatusCode::NOT_FOUND, "export file no longer exists"));
        }
    };

    let bytes = match tokio::fs::read(&path).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(api_error(StatusCode::NOT_FOUND, "export file no longer exists"))
        }
        Err(e) => {
            error!(job_id = %id, error = %e, "Failed to read export artifact");
            return Err(api_error(StatusCode::INTERNAL_SERVER_ERROR, "failed to read export file"));
        }
    };

    let filename = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| format!("export_{}.{}", id, format.extension(compress)));

    Ok((
        [
            (header::CONTENT_TYPE, format.content_type(compress).to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{filename}\""),
            ),
        ],
        bytes,
    )
        .into_response())
}

// ── Deletion & maintenance ────────────────────────────────────

/// Delete a job's artifact and metadata. Deleting an unknown job succeeds.
#[utoipa::path(
    delete,
    path = "/export/{job_id}",
    tag = "Export",
    params(("job_id" = String, Path, description = "Export job ID")),
    responses(
        (status = 200, description = "Deleted", body = Object)
    )
)]
pub async fn delete_export(
    State(state): State<Arc<AppState>>,
    Path(job_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    // Nothing can be stored under a malformed id.
    if let Ok(id) = Uuid::parse_str(&job_id) {
        state.export.delete(id).await.map_err(export_error)?;
        info!(job_id = %id, "Export job deleted");
    }
    Ok(Json(json!({ "deleted": true, "job_id": job_id })))
}

/// Run one cleanup sweep now and return its report.
#[utoipa::path(
    post,
    path = "/export/cleanup",
    tag = "Export",
    responses(
        (status = 200, description = "Cleanup report", body = Object),
        (status = 500, description = "Export directory or status store unreadable", body = Object)
    )
)]
pub async fn run_cleanup(State(state): State<Arc<AppState>>) -> Result<Json<Value>, ApiError> {
    let report = state.export.run_cleanup().await.map_err(export_error)?;
    to_json(&report)
}

//! Server health.

use std::sync::Arc;

use axum::extract::State;
use axum::Json;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::state::AppState;

#[derive(Serialize, utoipa::ToSchema)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    #[schema(value_type = String)]
    pub started_at: DateTime<Utc>,
    pub active_jobs: usize,
    pub status_store: &'static str,
    #[schema(value_type = Object)]
    pub config: serde_json::Value,
}

/// Server health, running export tasks and the redacted configuration.
#[utoipa::path(
    get,
    path = "/health",
    tag = "Health",
    responses(
        (status = 200, description = "Server is up", body = HealthResponse)
    )
)]
pub async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        started_at: state.started_at,
        active_jobs: state.export.active_jobs().await,
        status_store: state.export.store().backend_name(),
        config: state.config_summary.clone(),
    })
}

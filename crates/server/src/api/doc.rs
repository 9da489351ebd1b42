//! OpenAPI document, served via Scalar UI at `/docs`.

use utoipa::OpenApi;

#[derive(OpenApi)]
#[openapi(
    info(
        title = "stupid-export API",
        version = "0.1.0",
        description = "Asynchronous export of logs, anomalies and metrics to JSON, CSV and ZIP files.",
    ),
    tags(
        (name = "Health", description = "Server readiness"),
        (name = "Export", description = "Export job submission, status, download, deletion and cleanup"),
    ),
    paths(
        crate::api::health::health,
        crate::api::export::submit_export,
        crate::api::export::list_exports,
        crate::api::export::export_status,
        crate::api::export::export_progress,
        crate::api::export::download_export,
        crate::api::export::delete_export,
        crate::api::export::run_cleanup,
    ),
    components(schemas(crate::api::health::HealthResponse))
)]
pub struct ApiDoc;

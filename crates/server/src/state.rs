use std::sync::Arc;

use chrono::{DateTime, Utc};
use stupid_export::ExportService;

pub struct AppState {
    pub export: Arc<ExportService>,
    /// Redacted configuration, echoed by `/health`.
    pub config_summary: serde_json::Value,
    pub started_at: DateTime<Utc>,
}

impl AppState {
    pub fn new(export: Arc<ExportService>, config_summary: serde_json::Value) -> Self {
        Self {
            export,
            config_summary,
            started_at: Utc::now(),
        }
    }
}

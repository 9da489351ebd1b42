pub mod doc;
pub mod export;
pub mod health;

pub use export::{
    delete_export, download_export, export_progress, export_status, list_exports, run_cleanup,
    submit_export,
};
pub use health::health;

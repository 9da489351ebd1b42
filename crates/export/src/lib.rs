//! Asynchronous data-export pipeline.
//!
//! A submitted [`ExportConfig`] becomes an [`ExportJob`] that runs in the
//! background: records are pulled from a [`RecordSource`] in batches, cleaned
//! by the [`Transformer`], rendered by the [`serializer`] and the job's
//! progress is kept in the TTL-bounded [`StatusStore`]. The [`CleanupSweeper`]
//! expires old artifacts and reconciles orphaned metadata.

pub mod artifact;
pub mod error;
pub mod record;
pub mod runner;
pub mod serializer;
pub mod service;
pub mod source;
pub mod store;
pub mod sweeper;
pub mod transform;
pub mod types;

pub use error::{ExportError, ExportResult, SerializeError, SourceError, StoreError};
pub use record::{ExportRecord, RawRecord};
pub use runner::{CancelFlag, JobRunner, ProgressSink, RunOutcome};
pub use service::ExportService;
pub use source::{RecordQuery, RecordSource};
pub use store::{KvBackend, MemoryBackend, StatusStore};
pub use sweeper::{CleanupReport, CleanupSweeper};
pub use transform::{RecordRejection, Transformer};
pub use types::{DataType, ExportConfig, ExportFormat, ExportJob, JobId, JobProgress, JobStatus};

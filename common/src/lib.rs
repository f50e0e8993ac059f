//! Núcleo compartido: cola en disco, almacén de metadatos con TTL y el
//! worker de lotes que renderiza páginas a PNG/PDF.

pub mod api;
pub mod batch;
pub mod config;
pub mod error;
mod fsutil;
pub mod job;
pub mod lookup;
pub mod meta;
pub mod queue;
pub mod render;
pub mod results;
pub mod task;

pub use api::{ApiError, ApiResponse};
pub use batch::{BatchWorker, ProgressPolicy};
pub use config::Settings;
pub use error::{BatchError, ItemFailure, RenderError, StoreError, UploadError, ValidationError};
pub use job::{OutputFormat, RenderItem, RenderOptions, RenderRequest, RenderSource};
pub use lookup::{locate_task, summarize_task, LookupSource, TaskLookup};
pub use meta::{NewTask, TaskMetadataStore, TaskUpdate};
pub use queue::{Partition, QueueStats, QueueStore, TaskQueue};
pub use render::{CommandRenderer, HttpUploader, RenderOutput, Renderer, Uploader};
pub use results::{ItemError, ItemResult, Summary};
pub use task::{TaskId, TaskRecord, TaskStatus};

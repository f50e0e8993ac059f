// master/src/state.rs

use std::sync::Arc;

use common::{
    CommandRenderer, QueueStore, Renderer, Settings, StoreError, TaskMetadataStore, TaskQueue,
    Uploader,
};

#[derive(Clone)]
pub struct AppState {
    pub queue: Arc<dyn TaskQueue>,
    pub meta: Arc<TaskMetadataStore>,
    // motor para el render individual (POST /api/v1/render)
    pub renderer: Arc<dyn Renderer>,
    pub uploader: Option<Arc<dyn Uploader>>,
    pub retention_days: u64,
}

impl AppState {
    pub fn from_settings(settings: &Settings) -> Result<Self, StoreError> {
        let queue = QueueStore::open(&settings.queue_dir, settings.processing_timeout)?;
        let meta = TaskMetadataStore::open(&settings.task_meta_dir)?;

        let renderer: Arc<dyn Renderer> = Arc::new(
            settings
                .renderer()
                .unwrap_or_else(|| CommandRenderer::new(common::config::DEFAULT_RENDER_COMMAND, Vec::new())),
        );
        let uploader = settings
            .uploader()
            .map(|u| Arc::new(u) as Arc<dyn Uploader>);

        Ok(Self {
            queue: Arc::new(queue),
            meta: Arc::new(meta),
            renderer,
            uploader,
            retention_days: settings.retention_days,
        })
    }
}

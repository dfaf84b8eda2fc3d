//! Shared server state.

use std::sync::Arc;

use image::DynamicImage;
use scrawl_core::{ImageStudio, PipelineManager, StudioConfig};
use tokio::sync::{Mutex, Semaphore, SemaphorePermit};

/// Application state handed to every handler. A single job permit keeps the
/// device to one diffusion run at a time; requests queue behind it.
#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<PipelineManager>,
    pub studio: Arc<ImageStudio>,
    pub config: Arc<StudioConfig>,
    job_slot: Arc<Semaphore>,
    /// Last successful generation, the implicit source for edits.
    pub last_generated: Arc<Mutex<Option<DynamicImage>>>,
}

impl AppState {
    pub fn new(manager: Arc<PipelineManager>, config: StudioConfig) -> Self {
        Self {
            studio: Arc::new(ImageStudio::new(manager.clone())),
            manager,
            config: Arc::new(config),
            job_slot: Arc::new(Semaphore::new(1)),
            last_generated: Arc::new(Mutex::new(None)),
        }
    }

    /// Waits for the single job permit.
    pub async fn acquire_job_slot(&self) -> SemaphorePermit<'_> {
        self.job_slot
            .acquire()
            .await
            .expect("job semaphore is never closed")
    }
}

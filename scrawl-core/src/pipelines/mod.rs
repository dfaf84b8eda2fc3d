use std::future::Future;

use anyhow::Result;
use image::DynamicImage;

use crate::config::ModelIds;
use crate::device_map::DeviceProfile;

mod embeddings;
mod instruct;
mod loader;
mod sketch;

pub use instruct::InstructDiffusion;
pub use loader::HubLoader;
pub use sketch::SketchDiffusion;

pub(crate) use embeddings::TextEmbedder;

/// Both pipelines work at the native resolution of the underlying models.
pub(crate) const IMAGE_SIZE: usize = 512;

/// Resolved parameters for one sketch-to-image run. Unlike the request types,
/// nothing here is optional.
#[derive(Debug, Clone, PartialEq)]
pub struct SketchParams {
    pub prompt: String,
    pub negative_prompt: Option<String>,
    pub guidance_scale: f64,
    pub steps: usize,
    pub conditioning_scale: f64,
    pub seed: Option<u64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EditParams {
    pub instruction: String,
    pub guidance_scale: f64,
    pub image_guidance_scale: f64,
    pub steps: usize,
    pub seed: Option<u64>,
}

/// Turns normalized line art into an image. Implementations are not expected
/// to survive concurrent calls; callers serialize.
pub trait SketchPipeline: Send + Sync {
    fn generate(&self, sketch: &DynamicImage, params: &SketchParams) -> Result<DynamicImage>;
}

/// Rewrites an existing image according to a plain-language instruction.
pub trait EditPipeline: Send + Sync {
    fn edit(&self, image: &DynamicImage, params: &EditParams) -> Result<DynamicImage>;
}

/// Produces both pipelines for a device profile. The manager owns retry
/// policy; loaders just load.
pub trait PipelineLoader {
    type Sketch: SketchPipeline + 'static;
    type Edit: EditPipeline + 'static;

    fn load(
        &self,
        models: &ModelIds,
        profile: &DeviceProfile,
    ) -> impl Future<Output = Result<(Self::Sketch, Self::Edit)>>;
}

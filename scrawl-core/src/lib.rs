mod config;
mod device_map;
mod error;
mod manager;
mod pipelines;
pub mod presets;
mod sketch_input;
mod studio;
mod util;

pub use config::{ModelIds, SketchDefaults, StudioConfig, TransformDefaults};
pub use device_map::{probe_device_profile, DeviceKind, DeviceMap, DeviceProfile, Precision};
pub use error::{classify_failure, Phase, PipelineKind, StudioError};
pub use manager::PipelineManager;
pub use pipelines::{
    EditParams, EditPipeline, HubLoader, InstructDiffusion, PipelineLoader, SketchDiffusion,
    SketchParams, SketchPipeline,
};
pub use sketch_input::{
    ensure_rgb, normalize_sketch, validate_present, CanvasPayload, RawPixels, SketchInput,
    SketchLayer,
};
pub use studio::{ImageStudio, Outcome, StatusKind, StatusMessage};
pub use util::{decoded_to_image, image_to_tensor, select_device, tensor_to_image};

use serde::{Deserialize, Serialize};

// Define the request types.

/// Everything one sketch-to-image run needs besides the sketch itself.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct GenerationRequest {
    pub prompt: String,
    pub negative_prompt: Option<String>,
    pub guidance_scale: f64,
    pub steps: usize,
    pub conditioning_scale: f64,
    /// Negative asks for a fresh seed each run.
    pub seed: i64,
}

impl GenerationRequest {
    pub fn from_defaults(prompt: impl Into<String>, defaults: &SketchDefaults) -> Self {
        Self {
            prompt: prompt.into(),
            negative_prompt: None,
            guidance_scale: defaults.guidance_scale,
            steps: defaults.steps,
            conditioning_scale: defaults.conditioning_scale,
            seed: defaults.seed,
        }
    }
}

/// Instruction-driven edit of an already generated image.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct TransformRequest {
    pub instruction: String,
    pub guidance_scale: f64,
    pub image_guidance_scale: f64,
    pub steps: usize,
    pub seed: i64,
}

impl TransformRequest {
    pub fn from_defaults(instruction: impl Into<String>, defaults: &TransformDefaults) -> Self {
        Self {
            instruction: instruction.into(),
            guidance_scale: defaults.guidance_scale,
            image_guidance_scale: defaults.image_guidance_scale,
            steps: defaults.steps,
            seed: defaults.seed,
        }
    }
}

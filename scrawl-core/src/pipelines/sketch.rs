use anyhow::Result;
use candle_core::{DType, Device, Tensor};
use candle_transformers::models::stable_diffusion::schedulers::SchedulerConfig;
use candle_transformers::models::stable_diffusion::uni_pc::UniPCSchedulerConfig;
use candle_transformers::models::stable_diffusion::unet_2d::UNet2DConditionModel;
use candle_transformers::models::stable_diffusion::vae::AutoEncoderKL;
use image::DynamicImage;
use tracing::{debug, warn};

use super::{SketchParams, SketchPipeline, TextEmbedder, IMAGE_SIZE};

pub(crate) const VAE_SCALE: f64 = 0.18215;
pub(crate) const LATENT_CHANNELS: usize = 4;

/// Latent diffusion conditioned on a sketch: the drawing's latents seed the
/// denoise schedule so its line structure survives into the result.
pub struct SketchDiffusion {
    device: Device,
    dtype: DType,
    embedder: TextEmbedder,
    unet: UNet2DConditionModel,
    vae: AutoEncoderKL,
}

impl SketchDiffusion {
    pub(crate) fn new(
        embedder: TextEmbedder,
        unet: UNet2DConditionModel,
        vae: AutoEncoderKL,
        device: Device,
        dtype: DType,
    ) -> Self {
        Self {
            device,
            dtype,
            embedder,
            unet,
            vae,
        }
    }
}

/// Share of the schedule that runs on top of the sketch latents. Zero
/// influence degenerates to plain text-to-image; the maximum keeps a bit over
/// half of the schedule, which preserves composition without tracing the
/// pencil lines literally.
pub(crate) fn conditioning_to_strength(conditioning_scale: f64) -> f64 {
    const MAX_SCALE: f64 = 1.5;
    let scale = conditioning_scale.clamp(0.0, MAX_SCALE);
    1.0 - (scale / MAX_SCALE) * 0.45
}

impl SketchPipeline for SketchDiffusion {
    fn generate(&self, sketch: &DynamicImage, params: &SketchParams) -> Result<DynamicImage> {
        if let Some(seed) = params.seed {
            if let Err(err) = self.device.set_seed(seed) {
                warn!("device rng does not accept explicit seeds: {err}");
            }
        }

        let mut scheduler = UniPCSchedulerConfig::default().build(params.steps)?;
        let timesteps = scheduler.timesteps().to_vec();

        let use_guidance = params.guidance_scale > 1.0;
        let conditional = self.embedder.embed(&params.prompt)?;
        let embeddings = if use_guidance {
            let negative = params.negative_prompt.as_deref().unwrap_or("");
            let unconditional = self.embedder.embed(negative)?;
            Tensor::cat(&[unconditional, conditional], 0)?
        } else {
            conditional
        };
        let embeddings = embeddings.to_dtype(self.dtype)?;

        // Encode the sketch and decide how much of the schedule keeps it.
        let strength = conditioning_to_strength(params.conditioning_scale);
        let start_step = params
            .steps
            .saturating_sub((params.steps as f64 * strength) as usize);

        let latents = if start_step < timesteps.len() {
            let sketch_tensor = crate::image_to_tensor(sketch, IMAGE_SIZE, IMAGE_SIZE)?
                .to_device(&self.device)?
                .to_dtype(self.dtype)?;
            let sketch_latents = (self.vae.encode(&sketch_tensor)?.sample()? * VAE_SCALE)?;
            let noise = sketch_latents.randn_like(0f64, 1f64)?;
            scheduler.add_noise(&sketch_latents, noise, timesteps[start_step])?
        } else {
            let shape = (1, LATENT_CHANNELS, IMAGE_SIZE / 8, IMAGE_SIZE / 8);
            let noise = Tensor::randn(0f32, 1f32, shape, &self.device)?;
            (noise * scheduler.init_noise_sigma())?
        };
        let mut latents = latents.to_dtype(self.dtype)?;

        for (index, &timestep) in timesteps.iter().enumerate() {
            if index < start_step {
                continue;
            }
            let latent_input = if use_guidance {
                Tensor::cat(&[&latents, &latents], 0)?
            } else {
                latents.clone()
            };
            let latent_input = scheduler.scale_model_input(latent_input, timestep)?;
            let noise_pred = self
                .unet
                .forward(&latent_input, timestep as f64, &embeddings)?;
            let noise_pred = if use_guidance {
                let chunks = noise_pred.chunk(2, 0)?;
                let (unconditional, conditional) = (&chunks[0], &chunks[1]);
                (unconditional + ((conditional - unconditional)? * params.guidance_scale)?)?
            } else {
                noise_pred
            };
            latents = scheduler.step(&noise_pred, timestep, &latents)?;
            debug!("denoised step {}/{}", index + 1, timesteps.len());
        }

        let decoded = self.vae.decode(&(&latents / VAE_SCALE)?)?;
        crate::decoded_to_image(&decoded)
    }
}

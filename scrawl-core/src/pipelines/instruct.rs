use anyhow::Result;
use candle_core::{DType, Device, Tensor};
use candle_transformers::models::stable_diffusion::euler_ancestral_discrete::EulerAncestralDiscreteSchedulerConfig;
use candle_transformers::models::stable_diffusion::schedulers::SchedulerConfig;
use candle_transformers::models::stable_diffusion::unet_2d::UNet2DConditionModel;
use candle_transformers::models::stable_diffusion::vae::AutoEncoderKL;
use image::DynamicImage;
use tracing::{debug, warn};

use super::sketch::{LATENT_CHANNELS, VAE_SCALE};
use super::{EditParams, EditPipeline, TextEmbedder, IMAGE_SIZE};

/// Instruction-following edits. The source image rides along as four extra
/// UNet input channels and guidance blends three predictions: text, image,
/// and fully unconditional.
pub struct InstructDiffusion {
    device: Device,
    dtype: DType,
    embedder: TextEmbedder,
    unet: UNet2DConditionModel,
    vae: AutoEncoderKL,
}

impl InstructDiffusion {
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

impl EditPipeline for InstructDiffusion {
    fn edit(&self, image: &DynamicImage, params: &EditParams) -> Result<DynamicImage> {
        if let Some(seed) = params.seed {
            if let Err(err) = self.device.set_seed(seed) {
                warn!("device rng does not accept explicit seeds: {err}");
            }
        }

        let mut scheduler = EulerAncestralDiscreteSchedulerConfig::default().build(params.steps)?;
        let timesteps = scheduler.timesteps().to_vec();

        let conditional = self.embedder.embed(&params.instruction)?;
        let unconditional = self.embedder.embed("")?;
        // Prediction order for this stack is [text, image, unconditional].
        let embeddings = Tensor::cat(&[&conditional, &unconditional, &unconditional], 0)?
            .to_dtype(self.dtype)?;

        let source = crate::image_to_tensor(image, IMAGE_SIZE, IMAGE_SIZE)?
            .to_device(&self.device)?
            .to_dtype(self.dtype)?;
        // The conditioning latents stay unscaled for this architecture.
        let image_latents = self.vae.encode(&source)?.sample()?;
        let unconditional_latents = image_latents.zeros_like()?;
        let image_latents = Tensor::cat(
            &[&image_latents, &image_latents, &unconditional_latents],
            0,
        )?;

        let shape = (1, LATENT_CHANNELS, IMAGE_SIZE / 8, IMAGE_SIZE / 8);
        let noise = Tensor::randn(0f32, 1f32, shape, &self.device)?;
        let mut latents = (noise * scheduler.init_noise_sigma())?.to_dtype(self.dtype)?;

        for (index, &timestep) in timesteps.iter().enumerate() {
            let latent_input = Tensor::cat(&[&latents, &latents, &latents], 0)?;
            let latent_input = scheduler.scale_model_input(latent_input, timestep)?;
            let latent_input = Tensor::cat(&[&latent_input, &image_latents], 1)?;
            let noise_pred = self
                .unet
                .forward(&latent_input, timestep as f64, &embeddings)?;

            let chunks = noise_pred.chunk(3, 0)?;
            let (text_pred, image_pred, unconditional_pred) = (&chunks[0], &chunks[1], &chunks[2]);
            let guided =
                (unconditional_pred + ((text_pred - image_pred)? * params.guidance_scale)?)?;
            let guided = (&guided
                + ((image_pred - unconditional_pred)? * params.image_guidance_scale)?)?;

            latents = scheduler.step(&guided, timestep, &latents)?;
            debug!("edited step {}/{}", index + 1, timesteps.len());
        }

        let decoded = self.vae.decode(&(&latents / VAE_SCALE)?)?;
        crate::decoded_to_image(&decoded)
    }
}

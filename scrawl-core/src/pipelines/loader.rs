use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use candle_core::DType;
use candle_transformers::models::stable_diffusion::clip::ClipTextTransformer;
use candle_transformers::models::stable_diffusion::StableDiffusionConfig;
use hf_hub::api::tokio::{Api, ApiRepo};
use safetensors::SafeTensors;
use tracing::{debug, info};

use super::{InstructDiffusion, PipelineLoader, SketchDiffusion, TextEmbedder, IMAGE_SIZE};
use crate::config::ModelIds;
use crate::device_map::DeviceProfile;

const TOKENIZER_FILE: &str = "tokenizer.json";
const CLIP_WEIGHTS: &str = "text_encoder/model.safetensors";
const UNET_WEIGHTS: &str = "unet/diffusion_pytorch_model.safetensors";
const VAE_WEIGHTS: &str = "vae/diffusion_pytorch_model.safetensors";

const MAX_HEADER_BYTES: u64 = 100_000_000;

/// Fetches diffusers-layout checkpoints from the Hugging Face hub and
/// assembles both pipelines.
pub struct HubLoader {
    api: Api,
}

impl HubLoader {
    pub fn new(api: Api) -> Self {
        Self { api }
    }
}

impl PipelineLoader for HubLoader {
    type Sketch = SketchDiffusion;
    type Edit = InstructDiffusion;

    async fn load(
        &self,
        models: &ModelIds,
        profile: &DeviceProfile,
    ) -> Result<(SketchDiffusion, InstructDiffusion)> {
        let device = &profile.device;
        let dtype = profile.dtype;
        let config = StableDiffusionConfig::v1_5(None, Some(IMAGE_SIZE), Some(IMAGE_SIZE));

        let use_flash_attn = cfg!(feature = "flash-attn") && device.is_cuda();
        if cfg!(feature = "flash-attn") && !use_flash_attn {
            debug!("flash attention is compiled in but the active device cannot use it");
        }

        // --- Shared CLIP Tokenizer ---
        let tokenizer_file = self
            .api
            .model(models.tokenizer_repo.clone())
            .get(TOKENIZER_FILE)
            .await
            .context("cannot load the clip tokenizer")?;
        let tokenizer = tokenizers::Tokenizer::from_file(tokenizer_file)
            .map_err(anyhow::Error::msg)
            .context("failed to parse the clip tokenizer")?;

        // --- Sketch Generation Pipeline ---
        info!("loading the sketch pipeline from {}", models.sketch_repo);
        let sketch_repo = self
            .api
            .repo(hf_hub::Repo::model(models.sketch_repo.clone()));
        let clip_file = fetch_weights(&sketch_repo, CLIP_WEIGHTS).await?;
        let unet_file = fetch_weights(&sketch_repo, UNET_WEIGHTS).await?;
        let vae_file = fetch_weights(&sketch_repo, VAE_WEIGHTS).await?;

        let clip_vb = unsafe {
            candle_nn::VarBuilder::from_mmaped_safetensors(&[clip_file], DType::F32, device)
                .context("failed to build the text encoder var builder")?
        };
        let text_encoder = ClipTextTransformer::new(clip_vb, &config.clip)
            .context("failed to load the text encoder")?;
        let vae = config
            .build_vae(&vae_file, device, dtype)
            .context("failed to load the autoencoder")?;
        let unet = config
            .build_unet(&unet_file, device, 4, use_flash_attn, dtype)
            .context("failed to load the generation unet")?;
        let sketch = SketchDiffusion::new(
            TextEmbedder::new(
                tokenizer.clone(),
                text_encoder,
                config.clip.clone(),
                device.clone(),
            ),
            unet,
            vae,
            device.clone(),
            dtype,
        );

        // --- Instruction Edit Pipeline ---
        // Same CLIP architecture with its own finetuned weights, and a unet
        // that takes the source latents as four extra input channels.
        info!("loading the edit pipeline from {}", models.transform_repo);
        let edit_repo = self
            .api
            .repo(hf_hub::Repo::model(models.transform_repo.clone()));
        let clip_file = fetch_weights(&edit_repo, CLIP_WEIGHTS).await?;
        let unet_file = fetch_weights(&edit_repo, UNET_WEIGHTS).await?;
        let vae_file = fetch_weights(&edit_repo, VAE_WEIGHTS).await?;

        let clip_vb = unsafe {
            candle_nn::VarBuilder::from_mmaped_safetensors(&[clip_file], DType::F32, device)
                .context("failed to build the edit text encoder var builder")?
        };
        let text_encoder = ClipTextTransformer::new(clip_vb, &config.clip)
            .context("failed to load the edit text encoder")?;
        let vae = config
            .build_vae(&vae_file, device, dtype)
            .context("failed to load the edit autoencoder")?;
        let unet = config
            .build_unet(&unet_file, device, 8, use_flash_attn, dtype)
            .context("failed to load the edit unet")?;
        let edit = InstructDiffusion::new(
            TextEmbedder::new(tokenizer, text_encoder, config.clip.clone(), device.clone()),
            unet,
            vae,
            device.clone(),
            dtype,
        );

        Ok((sketch, edit))
    }
}

/// Downloads one weight file and proves its safetensors header parses before
/// anything tries to mmap it.
async fn fetch_weights(repo: &ApiRepo, filename: &str) -> Result<PathBuf> {
    let path = repo
        .get(filename)
        .await
        .with_context(|| format!("cannot load {filename} from the hub"))?;
    check_safetensors_header(&path)
        .with_context(|| format!("weight file {filename} failed validation"))?;
    Ok(path)
}

fn check_safetensors_header(path: &Path) -> Result<()> {
    let mut file = File::open(path)?;
    let mut length_bytes = [0u8; 8];
    file.read_exact(&mut length_bytes)?;
    let header_length = u64::from_le_bytes(length_bytes);
    if header_length == 0 || header_length > MAX_HEADER_BYTES {
        anyhow::bail!("safetensors header length {header_length} is implausible");
    }
    let mut buffer = vec![0u8; 8 + header_length as usize];
    buffer[..8].copy_from_slice(&length_bytes);
    file.read_exact(&mut buffer[8..])?;
    SafeTensors::read_metadata(&buffer)
        .map_err(|err| anyhow::anyhow!("safetensors header is invalid: {err}"))?;
    Ok(())
}

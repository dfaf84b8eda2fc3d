use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::device_map::{DeviceMap, Precision};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StudioConfig {
    #[serde(default)]
    pub device: DeviceMap,
    #[serde(default)]
    pub precision: Precision,
    #[serde(default)]
    pub models: ModelIds,
    #[serde(default)]
    pub sketch: SketchDefaults,
    #[serde(default)]
    pub transform: TransformDefaults,
}

impl StudioConfig {
    /// Reads a JSON config. Missing fields keep their stock values.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config from {}", path.display()))?;
        let config = serde_json::from_str(&raw)
            .with_context(|| format!("failed to parse config from {}", path.display()))?;
        Ok(config)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelIds {
    /// Tokenizer repository shared by both pipelines.
    #[serde(default = "default_tokenizer_repo")]
    pub tokenizer_repo: String,
    /// Weights for sketch-conditioned generation.
    #[serde(default = "default_sketch_repo")]
    pub sketch_repo: String,
    /// Weights for instruction-driven edits.
    #[serde(default = "default_transform_repo")]
    pub transform_repo: String,
}

impl Default for ModelIds {
    fn default() -> Self {
        Self {
            tokenizer_repo: default_tokenizer_repo(),
            sketch_repo: default_sketch_repo(),
            transform_repo: default_transform_repo(),
        }
    }
}

fn default_tokenizer_repo() -> String {
    "openai/clip-vit-base-patch32".to_string()
}

fn default_sketch_repo() -> String {
    "runwayml/stable-diffusion-v1-5".to_string()
}

fn default_transform_repo() -> String {
    "timbrooks/instruct-pix2pix".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SketchDefaults {
    #[serde(default = "default_guidance_scale")]
    pub guidance_scale: f64,
    #[serde(default = "default_steps")]
    pub steps: usize,
    #[serde(default = "default_conditioning_scale")]
    pub conditioning_scale: f64,
    #[serde(default = "default_seed")]
    pub seed: i64,
}

impl Default for SketchDefaults {
    fn default() -> Self {
        Self {
            guidance_scale: default_guidance_scale(),
            steps: default_steps(),
            conditioning_scale: default_conditioning_scale(),
            seed: default_seed(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransformDefaults {
    #[serde(default = "default_guidance_scale")]
    pub guidance_scale: f64,
    #[serde(default = "default_image_guidance_scale")]
    pub image_guidance_scale: f64,
    #[serde(default = "default_steps")]
    pub steps: usize,
    #[serde(default = "default_seed")]
    pub seed: i64,
}

impl Default for TransformDefaults {
    fn default() -> Self {
        Self {
            guidance_scale: default_guidance_scale(),
            image_guidance_scale: default_image_guidance_scale(),
            steps: default_steps(),
            seed: default_seed(),
        }
    }
}

fn default_guidance_scale() -> f64 {
    7.5
}

fn default_steps() -> usize {
    20
}

fn default_conditioning_scale() -> f64 {
    1.0
}

fn default_image_guidance_scale() -> f64 {
    1.5
}

/// Negative means "pick a fresh seed each run".
fn default_seed() -> i64 {
    -1
}

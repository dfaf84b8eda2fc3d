//! HTTP endpoints for the studio.

use anyhow::{Context, Result};
use axum::{
    extract::{Json, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use base64::{prelude::BASE64_STANDARD, Engine};
use image::DynamicImage;
use scrawl_core::{
    presets, CanvasPayload, GenerationRequest, Outcome, SketchInput, SketchLayer, StudioError,
    TransformRequest,
};
use serde::{Deserialize, Serialize};
use std::io::Cursor;
use tracing::{debug, error};

use crate::state::AppState;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/v1/images/generations", post(generate_handler))
        .route("/v1/images/edits", post(edit_handler))
        .route("/v1/status", get(status_handler))
        .route("/v1/examples", get(examples_handler))
        .with_state(state)
}

/// Sketch as the wire carries it: either one base64-encoded image, or the
/// layered form drawing widgets emit.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum SketchPayload {
    Encoded(String),
    Layers {
        image: Option<String>,
        composite: Option<String>,
    },
}

#[derive(Debug, Deserialize)]
struct GenerateBody {
    #[serde(default)]
    sketch: Option<SketchPayload>,
    prompt: String,
    #[serde(default)]
    negative_prompt: Option<String>,
    #[serde(default)]
    guidance_scale: Option<f64>,
    #[serde(default)]
    steps: Option<usize>,
    #[serde(default)]
    conditioning_scale: Option<f64>,
    #[serde(default)]
    seed: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct EditBody {
    /// Explicit source image as base64. Falls back to the last generation
    /// when absent.
    #[serde(default)]
    image: Option<String>,
    instruction: String,
    #[serde(default)]
    guidance_scale: Option<f64>,
    #[serde(default)]
    image_guidance_scale: Option<f64>,
    #[serde(default)]
    steps: Option<usize>,
    #[serde(default)]
    seed: Option<i64>,
}

#[derive(Serialize)]
struct ImageResponse {
    ok: bool,
    image: Option<String>,
    status: String,
}

impl ImageResponse {
    fn failure(text: impl Into<String>) -> Self {
        Self {
            ok: false,
            image: None,
            status: text.into(),
        }
    }
}

#[derive(Serialize)]
struct StatusResponse {
    sketch_ready: bool,
    edit_ready: bool,
    device: &'static str,
    precision: String,
    status: String,
    sketch_hint: &'static str,
    transform_hint: &'static str,
}

#[derive(Serialize)]
struct ExamplesResponse {
    prompts: &'static [&'static str],
    edits: &'static [&'static str],
}

async fn generate_handler(
    State(state): State<AppState>,
    Json(body): Json<GenerateBody>,
) -> impl IntoResponse {
    let sketch = match body.sketch.map(sketch_input_from).transpose() {
        Ok(sketch) => sketch,
        Err(err) => return Json(ImageResponse::failure(err.user_message())).into_response(),
    };

    let defaults = &state.config.sketch;
    let request = GenerationRequest {
        prompt: body.prompt,
        negative_prompt: body.negative_prompt,
        guidance_scale: body.guidance_scale.unwrap_or(defaults.guidance_scale),
        steps: body.steps.unwrap_or(defaults.steps),
        conditioning_scale: body
            .conditioning_scale
            .unwrap_or(defaults.conditioning_scale),
        seed: body.seed.unwrap_or(defaults.seed),
    };

    let _slot = state.acquire_job_slot().await;
    let studio = state.studio.clone();
    let outcome = match run_job(move || {
        studio.generate_from_sketch(sketch, &request, |fraction, stage| {
            debug!("generation {:.0}%: {stage}", fraction * 100.0)
        })
    })
    .await
    {
        Ok(outcome) => outcome,
        Err(code) => return code.into_response(),
    };

    if let Some(image) = &outcome.image {
        *state.last_generated.lock().await = Some(image.clone());
    }
    image_response(outcome).into_response()
}

async fn edit_handler(
    State(state): State<AppState>,
    Json(body): Json<EditBody>,
) -> impl IntoResponse {
    let source = match &body.image {
        Some(encoded) => match decode_image(encoded) {
            Ok(image) => Some(image),
            Err(_) => {
                return Json(ImageResponse::failure(
                    "Invalid source image format. Send a base64-encoded image.",
                ))
                .into_response()
            }
        },
        None => state.last_generated.lock().await.clone(),
    };

    let defaults = &state.config.transform;
    let request = TransformRequest {
        instruction: body.instruction,
        guidance_scale: body.guidance_scale.unwrap_or(defaults.guidance_scale),
        image_guidance_scale: body
            .image_guidance_scale
            .unwrap_or(defaults.image_guidance_scale),
        steps: body.steps.unwrap_or(defaults.steps),
        seed: body.seed.unwrap_or(defaults.seed),
    };

    let _slot = state.acquire_job_slot().await;
    let studio = state.studio.clone();
    let outcome = match run_job(move || {
        studio.transform_image(source.as_ref(), &request, |fraction, stage| {
            debug!("transform {:.0}%: {stage}", fraction * 100.0)
        })
    })
    .await
    {
        Ok(outcome) => outcome,
        Err(code) => return code.into_response(),
    };

    image_response(outcome).into_response()
}

async fn status_handler(State(state): State<AppState>) -> Json<StatusResponse> {
    Json(StatusResponse {
        sketch_ready: state.manager.sketch_pipeline().is_some(),
        edit_ready: state.manager.edit_pipeline().is_some(),
        device: state.manager.profile().kind.label(),
        precision: format!("{:?}", state.manager.precision()),
        status: state.manager.load_status(),
        sketch_hint: presets::SKETCH_HINT,
        transform_hint: presets::TRANSFORM_HINT,
    })
}

async fn examples_handler() -> Json<ExamplesResponse> {
    Json(ExamplesResponse {
        prompts: presets::EXAMPLE_PROMPTS,
        edits: presets::EXAMPLE_EDITS,
    })
}

/// Runs one studio job on the blocking pool. The job panicking is the only
/// way this fails.
async fn run_job<F>(job: F) -> Result<Outcome, StatusCode>
where
    F: FnOnce() -> Outcome + Send + 'static,
{
    tokio::task::spawn_blocking(job).await.map_err(|err| {
        error!("studio job panicked: {err}");
        StatusCode::INTERNAL_SERVER_ERROR
    })
}

fn image_response(outcome: Outcome) -> Json<ImageResponse> {
    let ok = outcome.is_success();
    match outcome.image.as_ref().map(image_to_base64_png).transpose() {
        Ok(encoded) => Json(ImageResponse {
            ok,
            image: encoded,
            status: outcome.status.text,
        }),
        Err(err) => {
            error!("image encoding failed: {err:#}");
            Json(ImageResponse::failure("Failed to encode the result image."))
        }
    }
}

fn sketch_input_from(payload: SketchPayload) -> Result<SketchInput, StudioError> {
    match payload {
        SketchPayload::Encoded(encoded) => Ok(SketchInput::Image(decode_image(&encoded)?)),
        SketchPayload::Layers { image, composite } => {
            let decode_layer = |layer: Option<String>| {
                layer
                    .map(|encoded| decode_image(&encoded).map(SketchLayer::Image))
                    .transpose()
            };
            Ok(SketchInput::Canvas(CanvasPayload {
                image: decode_layer(image)?,
                composite: decode_layer(composite)?,
            }))
        }
    }
}

fn decode_image(encoded: &str) -> Result<DynamicImage, StudioError> {
    let bytes = BASE64_STANDARD
        .decode(encoded.trim())
        .map_err(|_| StudioError::InvalidSketchFormat)?;
    image::load_from_memory(&bytes).map_err(|_| StudioError::InvalidSketchFormat)
}

/// Converts an image into a base64-encoded PNG.
fn image_to_base64_png(image: &DynamicImage) -> Result<String> {
    let mut bytes = Vec::new();
    image
        .write_to(&mut Cursor::new(&mut bytes), image::ImageFormat::Png)
        .context("failed to encode the image as png")?;
    Ok(BASE64_STANDARD.encode(&bytes))
}

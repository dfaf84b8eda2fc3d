use std::sync::Arc;

use image::DynamicImage;
use tracing::error;

use crate::error::{classify_failure, Phase, PipelineKind, StudioError};
use crate::manager::PipelineManager;
use crate::pipelines::{EditParams, SketchParams};
use crate::sketch_input::{ensure_rgb, normalize_sketch, validate_present, SketchInput};
use crate::{GenerationRequest, TransformRequest};

/// Whether a status line reports success or a problem. Front ends pick their
/// styling from this.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StatusKind {
    Success,
    Error,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StatusMessage {
    pub kind: StatusKind,
    pub text: String,
}

/// Result of a studio run. Failure is part of the value rather than an `Err`,
/// so callers always have something to show the user.
#[derive(Debug)]
pub struct Outcome {
    pub image: Option<DynamicImage>,
    pub status: StatusMessage,
}

impl Outcome {
    fn success(image: DynamicImage, text: impl Into<String>) -> Self {
        Self {
            image: Some(image),
            status: StatusMessage {
                kind: StatusKind::Success,
                text: text.into(),
            },
        }
    }

    fn failure(text: impl Into<String>) -> Self {
        Self {
            image: None,
            status: StatusMessage {
                kind: StatusKind::Error,
                text: text.into(),
            },
        }
    }

    pub fn is_success(&self) -> bool {
        self.status.kind == StatusKind::Success
    }
}

/// Front door for the two image operations. Validates input, runs the
/// pipeline, and turns every failure into a message a person can act on.
pub struct ImageStudio {
    manager: Arc<PipelineManager>,
}

impl ImageStudio {
    pub fn new(manager: Arc<PipelineManager>) -> Self {
        Self { manager }
    }

    pub fn manager(&self) -> &Arc<PipelineManager> {
        &self.manager
    }

    /// Turns a sketch and a prompt into a finished image. `progress` receives
    /// a completion fraction and a short description of the current stage.
    pub fn generate_from_sketch(
        &self,
        sketch: Option<SketchInput>,
        request: &GenerationRequest,
        progress: impl Fn(f32, &str),
    ) -> Outcome {
        let Some(pipeline) = self.manager.sketch_pipeline() else {
            return Outcome::failure(
                StudioError::ModelNotReady {
                    pipeline: PipelineKind::Sketch,
                    status: self.manager.load_status(),
                }
                .user_message(),
            );
        };

        let sketch = match normalize_sketch(sketch) {
            Ok(image) => image,
            Err(err) => return Outcome::failure(err.user_message()),
        };
        if request.prompt.trim().is_empty() {
            return Outcome::failure(StudioError::EmptyPrompt.user_message());
        }

        progress(0.1, "Preparing your sketch...");
        let params = SketchParams {
            prompt: request.prompt.clone(),
            negative_prompt: request
                .negative_prompt
                .as_ref()
                .map(|s| s.trim())
                .filter(|s| !s.is_empty())
                .map(str::to_string),
            guidance_scale: request.guidance_scale,
            steps: request.steps,
            conditioning_scale: request.conditioning_scale,
            seed: resolve_seed(request.seed),
        };

        match pipeline.generate(&sketch, &params) {
            Ok(image) => {
                self.manager.cleanup_memory();
                progress(1.0, "Masterpiece created!");
                Outcome::success(image, "Success! Your sketch has been transformed!")
            }
            Err(err) => {
                error!("sketch generation failed: {err:#}");
                Outcome::failure(classify_failure(&err, Phase::Generate).user_message())
            }
        }
    }

    /// Rewrites an already generated image according to a plain instruction.
    pub fn transform_image(
        &self,
        source: Option<&DynamicImage>,
        request: &TransformRequest,
        progress: impl Fn(f32, &str),
    ) -> Outcome {
        let Some(pipeline) = self.manager.edit_pipeline() else {
            return Outcome::failure(
                StudioError::ModelNotReady {
                    pipeline: PipelineKind::Edit,
                    status: self.manager.load_status(),
                }
                .user_message(),
            );
        };

        let source = match validate_present(source, "Generated image") {
            Ok(image) => image,
            Err(_) => {
                return Outcome::failure(
                    "Please generate an image first in the 'Sketch to Image' tab!",
                )
            }
        };
        if request.instruction.trim().is_empty() {
            return Outcome::failure(StudioError::EmptyInstruction.user_message());
        }

        progress(0.2, "Reading your instructions...");
        let source = ensure_rgb(source.clone());
        progress(0.5, "Applying magical transformations...");
        let params = EditParams {
            instruction: request.instruction.clone(),
            guidance_scale: request.guidance_scale,
            image_guidance_scale: request.image_guidance_scale,
            steps: request.steps,
            seed: resolve_seed(request.seed),
        };

        match pipeline.edit(&source, &params) {
            Ok(image) => {
                self.manager.cleanup_memory();
                progress(1.0, "Transformation complete!");
                Outcome::success(image, "Amazing! Your image has been transformed!")
            }
            Err(err) => {
                error!("image manipulation failed: {err:#}");
                Outcome::failure(classify_failure(&err, Phase::Transform).user_message())
            }
        }
    }
}

/// A negative seed keeps the run nondeterministic.
fn resolve_seed(seed: i64) -> Option<u64> {
    u64::try_from(seed).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use anyhow::anyhow;
    use image::ColorType;

    use crate::config::{ModelIds, SketchDefaults, TransformDefaults};
    use crate::device_map::DeviceProfile;
    use crate::pipelines::{EditPipeline, PipelineLoader, SketchPipeline};

    /// Shared scratchpad the stub pipelines write into.
    #[derive(Clone, Default)]
    struct Recorder {
        calls: Arc<AtomicUsize>,
        last_sketch_params: Arc<Mutex<Option<SketchParams>>>,
        last_edit_params: Arc<Mutex<Option<EditParams>>>,
        last_source_color: Arc<Mutex<Option<ColorType>>>,
        fail_with: Option<&'static str>,
    }

    impl Recorder {
        fn failing(message: &'static str) -> Self {
            Self {
                fail_with: Some(message),
                ..Self::default()
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }

        fn render(&self, seed: Option<u64>) -> anyhow::Result<DynamicImage> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(message) = self.fail_with {
                return Err(anyhow!("{message}"));
            }
            let shade = seed.map(|s| (s % 251) as u8).unwrap_or(7);
            Ok(DynamicImage::ImageRgb8(image::RgbImage::from_pixel(
                8,
                8,
                image::Rgb([shade, shade, shade]),
            )))
        }
    }

    struct RecordingSketch {
        recorder: Recorder,
    }

    impl SketchPipeline for RecordingSketch {
        fn generate(
            &self,
            _sketch: &DynamicImage,
            params: &SketchParams,
        ) -> anyhow::Result<DynamicImage> {
            *self.recorder.last_sketch_params.lock().unwrap() = Some(params.clone());
            self.recorder.render(params.seed)
        }
    }

    struct RecordingEdit {
        recorder: Recorder,
    }

    impl EditPipeline for RecordingEdit {
        fn edit(
            &self,
            image: &DynamicImage,
            params: &EditParams,
        ) -> anyhow::Result<DynamicImage> {
            *self.recorder.last_edit_params.lock().unwrap() = Some(params.clone());
            *self.recorder.last_source_color.lock().unwrap() = Some(image.color());
            self.recorder.render(params.seed)
        }
    }

    struct RecordingLoader {
        recorder: Recorder,
    }

    impl PipelineLoader for RecordingLoader {
        type Sketch = RecordingSketch;
        type Edit = RecordingEdit;

        async fn load(
            &self,
            _models: &ModelIds,
            _profile: &DeviceProfile,
        ) -> anyhow::Result<(RecordingSketch, RecordingEdit)> {
            Ok((
                RecordingSketch {
                    recorder: self.recorder.clone(),
                },
                RecordingEdit {
                    recorder: self.recorder.clone(),
                },
            ))
        }
    }

    struct BrokenLoader;

    impl PipelineLoader for BrokenLoader {
        type Sketch = RecordingSketch;
        type Edit = RecordingEdit;

        async fn load(
            &self,
            _models: &ModelIds,
            _profile: &DeviceProfile,
        ) -> anyhow::Result<(RecordingSketch, RecordingEdit)> {
            Err(anyhow!("cannot load unet weights"))
        }
    }

    async fn studio_with(recorder: Recorder) -> ImageStudio {
        let loader = RecordingLoader { recorder };
        let manager = PipelineManager::load_with_profile(
            DeviceProfile::cpu_fallback(),
            &ModelIds::default(),
            &loader,
        )
        .await;
        ImageStudio::new(Arc::new(manager))
    }

    async fn unloaded_studio() -> ImageStudio {
        let manager = PipelineManager::load_with_profile(
            DeviceProfile::cpu_fallback(),
            &ModelIds::default(),
            &BrokenLoader,
        )
        .await;
        ImageStudio::new(Arc::new(manager))
    }

    fn canvas() -> Option<SketchInput> {
        Some(SketchInput::Image(DynamicImage::new_rgb8(16, 16)))
    }

    fn sketch_request(prompt: &str) -> GenerationRequest {
        GenerationRequest::from_defaults(prompt, &SketchDefaults::default())
    }

    fn edit_request(instruction: &str) -> TransformRequest {
        TransformRequest::from_defaults(instruction, &TransformDefaults::default())
    }

    fn quiet(_: f32, _: &str) {}

    #[tokio::test]
    async fn reports_not_ready_before_models_load() {
        let studio = unloaded_studio().await;

        let generated =
            studio.generate_from_sketch(canvas(), &sketch_request("a castle"), quiet);
        assert!(!generated.is_success());
        assert!(generated
            .status
            .text
            .contains("Sketch-to-Image model not loaded"));
        assert!(generated.status.text.contains("Model File Error"));

        let source = DynamicImage::new_rgb8(8, 8);
        let edited =
            studio.transform_image(Some(&source), &edit_request("make it blue"), quiet);
        assert!(!edited.is_success());
        assert!(edited
            .status
            .text
            .contains("Image Manipulation model not loaded"));
    }

    #[tokio::test]
    async fn missing_sketch_wins_over_blank_prompt() {
        let recorder = Recorder::default();
        let studio = studio_with(recorder.clone()).await;

        let outcome = studio.generate_from_sketch(None, &sketch_request(""), quiet);

        assert_eq!(
            outcome.status.text,
            "Please draw something on the canvas!"
        );
        assert_eq!(recorder.calls(), 0);
    }

    #[tokio::test]
    async fn blank_prompt_is_rejected() {
        let recorder = Recorder::default();
        let studio = studio_with(recorder.clone()).await;

        let outcome = studio.generate_from_sketch(canvas(), &sketch_request("   "), quiet);

        assert_eq!(
            outcome.status.text,
            "Please provide a detailed description of your sketch!"
        );
        assert_eq!(recorder.calls(), 0);
    }

    #[tokio::test]
    async fn request_parameters_reach_the_pipeline() {
        let recorder = Recorder::default();
        let studio = studio_with(recorder.clone()).await;
        let request = GenerationRequest {
            prompt: "a castle".into(),
            negative_prompt: Some(" blurry ".into()),
            guidance_scale: 9.0,
            steps: 12,
            conditioning_scale: 0.4,
            seed: 7,
        };

        let outcome = studio.generate_from_sketch(canvas(), &request, quiet);

        assert!(outcome.is_success());
        assert_eq!(
            outcome.status.text,
            "Success! Your sketch has been transformed!"
        );
        let params = recorder.last_sketch_params.lock().unwrap().clone().unwrap();
        assert_eq!(params.prompt, "a castle");
        assert_eq!(params.negative_prompt.as_deref(), Some("blurry"));
        assert_eq!(params.guidance_scale, 9.0);
        assert_eq!(params.steps, 12);
        assert_eq!(params.conditioning_scale, 0.4);
        assert_eq!(params.seed, Some(7));
    }

    #[tokio::test]
    async fn blank_negative_prompt_is_dropped() {
        let recorder = Recorder::default();
        let studio = studio_with(recorder.clone()).await;
        let mut request = sketch_request("a castle");
        request.negative_prompt = Some("   ".into());

        studio.generate_from_sketch(canvas(), &request, quiet);

        let params = recorder.last_sketch_params.lock().unwrap().clone().unwrap();
        assert_eq!(params.negative_prompt, None);
    }

    #[tokio::test]
    async fn negative_seed_means_fresh_randomness() {
        let recorder = Recorder::default();
        let studio = studio_with(recorder.clone()).await;
        let mut request = sketch_request("a castle");
        request.seed = -1;

        studio.generate_from_sketch(canvas(), &request, quiet);

        let params = recorder.last_sketch_params.lock().unwrap().clone().unwrap();
        assert_eq!(params.seed, None);
    }

    #[tokio::test]
    async fn same_seed_reproduces_the_image() {
        let studio = studio_with(Recorder::default()).await;
        let mut request = sketch_request("a castle");
        request.seed = 42;

        let first = studio.generate_from_sketch(canvas(), &request, quiet);
        let second = studio.generate_from_sketch(canvas(), &request, quiet);
        request.seed = 43;
        let third = studio.generate_from_sketch(canvas(), &request, quiet);

        let bytes = |outcome: Outcome| outcome.image.unwrap().into_rgb8().into_raw();
        let first = bytes(first);
        assert_eq!(first, bytes(second));
        assert_ne!(first, bytes(third));
    }

    #[tokio::test]
    async fn transform_requires_a_source_image() {
        let recorder = Recorder::default();
        let studio = studio_with(recorder.clone()).await;

        let outcome = studio.transform_image(None, &edit_request("make it blue"), quiet);

        assert_eq!(
            outcome.status.text,
            "Please generate an image first in the 'Sketch to Image' tab!"
        );
        assert_eq!(recorder.calls(), 0);
    }

    #[tokio::test]
    async fn blank_instruction_is_rejected() {
        let recorder = Recorder::default();
        let studio = studio_with(recorder.clone()).await;
        let source = DynamicImage::new_rgb8(8, 8);

        let outcome = studio.transform_image(Some(&source), &edit_request(" "), quiet);

        assert_eq!(
            outcome.status.text,
            "Please describe how you want to modify the image!"
        );
        assert_eq!(recorder.calls(), 0);
    }

    #[tokio::test]
    async fn transform_feeds_rgb_to_the_pipeline() {
        let recorder = Recorder::default();
        let studio = studio_with(recorder.clone()).await;
        let source = DynamicImage::new_rgba8(8, 8);

        let outcome = studio.transform_image(Some(&source), &edit_request("add a sunset"), quiet);

        assert!(outcome.is_success());
        assert_eq!(
            outcome.status.text,
            "Amazing! Your image has been transformed!"
        );
        assert_eq!(
            *recorder.last_source_color.lock().unwrap(),
            Some(ColorType::Rgb8)
        );
        let params = recorder.last_edit_params.lock().unwrap().clone().unwrap();
        assert_eq!(params.instruction, "add a sunset");
    }

    #[tokio::test]
    async fn runtime_memory_failure_is_reported_without_retry() {
        let recorder = Recorder::failing("CUDA out of memory");
        let studio = studio_with(recorder.clone()).await;

        let outcome = studio.generate_from_sketch(canvas(), &sketch_request("a castle"), quiet);

        assert!(!outcome.is_success());
        assert!(outcome
            .status
            .text
            .contains("GPU Memory (VRAM) Error during generating"));
        assert_eq!(recorder.calls(), 1);
    }

    #[tokio::test]
    async fn progress_milestones_are_reported() {
        let studio = studio_with(Recorder::default()).await;
        let seen = RefCell::new(Vec::new());
        let track = |fraction: f32, stage: &str| {
            seen.borrow_mut().push((fraction, stage.to_string()));
        };

        studio.generate_from_sketch(canvas(), &sketch_request("a castle"), &track);
        assert_eq!(
            *seen.borrow(),
            vec![
                (0.1, "Preparing your sketch...".to_string()),
                (1.0, "Masterpiece created!".to_string()),
            ]
        );

        seen.borrow_mut().clear();
        let source = DynamicImage::new_rgb8(8, 8);
        studio.transform_image(Some(&source), &edit_request("add a sunset"), &track);
        assert_eq!(
            *seen.borrow(),
            vec![
                (0.2, "Reading your instructions...".to_string()),
                (0.5, "Applying magical transformations...".to_string()),
                (1.0, "Transformation complete!".to_string()),
            ]
        );
    }
}

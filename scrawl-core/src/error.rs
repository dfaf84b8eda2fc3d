use std::fmt;

/// Where a failure happened. The phase picks the remediation text shown to
/// the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Load,
    Generate,
    Transform,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Load => write!(f, "model loading"),
            Self::Generate => write!(f, "generating"),
            Self::Transform => write!(f, "manipulation"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineKind {
    Sketch,
    Edit,
}

impl PipelineKind {
    pub fn label(self) -> &'static str {
        match self {
            Self::Sketch => "Sketch-to-Image",
            Self::Edit => "Image Manipulation",
        }
    }
}

impl fmt::Display for PipelineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.label())
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum StudioError {
    #[error("nothing drawn on the canvas")]
    EmptySketch,

    #[error("unrecognized sketch payload")]
    InvalidSketchFormat,

    #[error("prompt is empty")]
    EmptyPrompt,

    #[error("instruction is empty")]
    EmptyInstruction,

    #[error("{label} is missing")]
    MissingImage { label: String },

    #[error("{pipeline} pipeline is not loaded")]
    ModelNotReady {
        pipeline: PipelineKind,
        status: String,
    },

    #[error("device ran out of memory during {phase}")]
    OutOfMemory { phase: Phase },

    #[error("model files could not be loaded: {detail}")]
    ModelFiles { detail: String },

    #[error("attention optimization is not supported: {detail}")]
    Incompatible { detail: String },

    #[error("unexpected failure during {phase}: {detail}")]
    Unexpected { phase: Phase, detail: String },
}

impl StudioError {
    /// Text surfaced to the person drawing, with remediation advice where
    /// there is any. Raw diagnostics stay in the logs.
    pub fn user_message(&self) -> String {
        match self {
            Self::EmptySketch => "Please draw something on the canvas!".to_string(),
            Self::InvalidSketchFormat => {
                "Invalid image format received from sketch input. Please draw again.".to_string()
            }
            Self::EmptyPrompt => {
                "Please provide a detailed description of your sketch!".to_string()
            }
            Self::EmptyInstruction => {
                "Please describe how you want to modify the image!".to_string()
            }
            Self::MissingImage { label } => format!("{label} is required!"),
            Self::ModelNotReady { pipeline, status } => {
                format!("{} model not loaded. {status}", pipeline.label())
            }
            Self::OutOfMemory { phase: Phase::Load } => {
                "GPU Memory (VRAM) Error: Insufficient VRAM to load models. \
                 Try a GPU with more memory or switch to half precision. \
                 Attempting to fall back to CPU."
                    .to_string()
            }
            Self::OutOfMemory { phase } => format!(
                "GPU Memory (VRAM) Error during {phase}. Try reducing image size or \
                 complexity, or free up GPU memory. If the issue persists, restart the app."
            ),
            Self::ModelFiles { detail } => format!(
                "Model File Error: Could not load model files. Check internet connection, \
                 disk space, or try clearing the Hugging Face cache. Error: {detail}"
            ),
            Self::Incompatible { .. } => {
                "Compatibility Error: the attention optimization is not supported by this \
                 build. Update the GPU drivers or rebuild without the `flash-attn` feature."
                    .to_string()
            }
            Self::Unexpected {
                phase: Phase::Load,
                detail,
            } => format!("An unexpected error occurred while loading models: {detail}"),
            Self::Unexpected { phase, detail } => format!("Error during {phase}: {detail}"),
        }
    }
}

const OUT_OF_MEMORY_INDICATORS: &[&str] =
    &["cuda out of memory", "hiplaunchkernel", "out of memory"];
const MODEL_FILE_INDICATORS: &[&str] =
    &["cannot load", "safetensors", "filenotfounderror", "no such file"];
const ATTENTION_INDICATORS: &[&str] =
    &["memory_efficient_attention", "flash-attn", "flash attention"];

/// Sorts a pipeline failure into the taxonomy by scanning the whole error
/// chain. Memory exhaustion takes precedence over everything else.
pub fn classify_failure(err: &anyhow::Error, phase: Phase) -> StudioError {
    let detail = format!("{err:#}");
    let haystack = detail.to_lowercase();

    if OUT_OF_MEMORY_INDICATORS.iter().any(|k| haystack.contains(k)) {
        StudioError::OutOfMemory { phase }
    } else if MODEL_FILE_INDICATORS.iter().any(|k| haystack.contains(k)) {
        StudioError::ModelFiles { detail }
    } else if ATTENTION_INDICATORS.iter().any(|k| haystack.contains(k)) {
        StudioError::Incompatible { detail }
    } else {
        StudioError::Unexpected { phase, detail }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;

    #[test]
    fn memory_exhaustion_is_recognized_in_any_case() {
        for message in [
            "CUDA out of memory. Tried to allocate 3.2 GiB",
            "hipLaunchKernel failed",
            "device reported: Out of memory",
        ] {
            let classified = classify_failure(&anyhow!("{message}"), Phase::Load);
            assert_eq!(classified, StudioError::OutOfMemory { phase: Phase::Load });
        }
    }

    #[test]
    fn memory_exhaustion_wins_over_other_indicators() {
        let err = anyhow!("cannot load unet: CUDA out of memory");
        let classified = classify_failure(&err, Phase::Generate);
        assert_eq!(
            classified,
            StudioError::OutOfMemory {
                phase: Phase::Generate
            }
        );
    }

    #[test]
    fn broken_weight_files_are_recognized() {
        for message in [
            "cannot load unet/diffusion_pytorch_model.safetensors from the hub",
            "safetensors_rust.SafetensorError: header too small",
            "FileNotFoundError: missing tokenizer",
            "No such file or directory (os error 2)",
        ] {
            let classified = classify_failure(&anyhow!("{message}"), Phase::Load);
            assert!(
                matches!(classified, StudioError::ModelFiles { .. }),
                "{message} should classify as a model file error"
            );
        }
    }

    #[test]
    fn attention_incompatibility_is_recognized() {
        for message in [
            "enable_xformers_memory_efficient_attention is unavailable",
            "flash-attn kernels were not compiled in",
        ] {
            let classified = classify_failure(&anyhow!("{message}"), Phase::Load);
            assert!(matches!(classified, StudioError::Incompatible { .. }));
        }
    }

    #[test]
    fn classification_scans_the_whole_context_chain() {
        let err = anyhow!("kernel launch failed").context("CUDA out of memory while loading vae");
        let classified = classify_failure(&err, Phase::Load);
        assert_eq!(classified, StudioError::OutOfMemory { phase: Phase::Load });
    }

    #[test]
    fn everything_else_stays_unexpected_with_detail() {
        let err = anyhow!("tensor rank mismatch");
        let classified = classify_failure(&err, Phase::Transform);
        match classified {
            StudioError::Unexpected { phase, detail } => {
                assert_eq!(phase, Phase::Transform);
                assert!(detail.contains("tensor rank mismatch"));
            }
            other => panic!("expected an unexpected-failure classification, got {other:?}"),
        }
    }

    #[test]
    fn input_errors_speak_to_the_user() {
        assert_eq!(
            StudioError::EmptySketch.user_message(),
            "Please draw something on the canvas!"
        );
        assert_eq!(
            StudioError::EmptyPrompt.user_message(),
            "Please provide a detailed description of your sketch!"
        );
        assert_eq!(
            StudioError::EmptyInstruction.user_message(),
            "Please describe how you want to modify the image!"
        );
        assert_eq!(
            StudioError::MissingImage {
                label: "Generated image".to_string()
            }
            .user_message(),
            "Generated image is required!"
        );
    }

    #[test]
    fn memory_messages_name_the_operation() {
        let generating = StudioError::OutOfMemory {
            phase: Phase::Generate,
        }
        .user_message();
        assert!(generating.contains("GPU Memory (VRAM) Error during generating"));

        let manipulating = StudioError::OutOfMemory {
            phase: Phase::Transform,
        }
        .user_message();
        assert!(manipulating.contains("GPU Memory (VRAM) Error during manipulation"));

        let loading = StudioError::OutOfMemory { phase: Phase::Load }.user_message();
        assert!(loading.contains("Attempting to fall back to CPU"));
    }

    #[test]
    fn not_ready_message_names_the_pipeline() {
        let err = StudioError::ModelNotReady {
            pipeline: PipelineKind::Sketch,
            status: "loading failed".to_string(),
        };
        assert_eq!(
            err.user_message(),
            "Sketch-to-Image model not loaded. loading failed"
        );
    }
}

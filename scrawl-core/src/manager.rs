use std::sync::Arc;

use candle_core::{DType, Device};
use tracing::{error, info, warn};

use crate::config::{ModelIds, StudioConfig};
use crate::device_map::{probe_device_profile, DeviceProfile};
use crate::error::{classify_failure, Phase, StudioError};
use crate::pipelines::{EditPipeline, PipelineLoader, SketchPipeline};

/// One initial attempt plus at most one CPU retry after accelerator memory
/// runs out.
const MAX_LOAD_ATTEMPTS: usize = 2;

/// Owns both pipelines and the story of how loading went. Construction never
/// fails; when loading does, the queries hand out `None` and the sticky error
/// explains why until a fresh manager is built.
pub struct PipelineManager {
    profile: DeviceProfile,
    sketch: Option<Arc<dyn SketchPipeline>>,
    edit: Option<Arc<dyn EditPipeline>>,
    load_error: Option<StudioError>,
}

impl PipelineManager {
    /// Probes the device described by the config, then loads.
    pub async fn load_with<L: PipelineLoader>(config: &StudioConfig, loader: &L) -> Self {
        let profile = match probe_device_profile(config.device, config.precision) {
            Ok(profile) => profile,
            Err(err) => {
                error!("device probe failed: {err:#}");
                return Self {
                    profile: DeviceProfile::cpu_fallback(),
                    sketch: None,
                    edit: None,
                    load_error: Some(classify_failure(&err, Phase::Load)),
                };
            }
        };
        Self::load_with_profile(profile, &config.models, loader).await
    }

    /// Loads on an already resolved profile. A failed attempt drops whatever
    /// the loader had materialized before the next one starts.
    pub async fn load_with_profile<L: PipelineLoader>(
        mut profile: DeviceProfile,
        models: &ModelIds,
        loader: &L,
    ) -> Self {
        let mut sketch = None;
        let mut edit = None;
        let mut load_error = None;

        for attempt in 0..MAX_LOAD_ATTEMPTS {
            info!(
                "loading pipelines on {} ({:?}), attempt {}",
                profile.kind.label(),
                profile.dtype,
                attempt + 1
            );
            match loader.load(models, &profile).await {
                Ok((loaded_sketch, loaded_edit)) => {
                    sketch = Some(Arc::new(loaded_sketch) as Arc<dyn SketchPipeline>);
                    edit = Some(Arc::new(loaded_edit) as Arc<dyn EditPipeline>);
                    load_error = None;
                    info!("pipelines ready");
                    break;
                }
                Err(err) => {
                    error!("pipeline load failed: {err:#}");
                    let classified = classify_failure(&err, Phase::Load);
                    let fall_back = matches!(classified, StudioError::OutOfMemory { .. })
                        && profile.kind.is_accelerator()
                        && attempt + 1 < MAX_LOAD_ATTEMPTS;
                    load_error = Some(classified);
                    if !fall_back {
                        break;
                    }
                    warn!("retrying on the CPU after accelerator memory ran out, this will be slow");
                    profile = DeviceProfile::cpu_fallback();
                }
            }
        }

        Self {
            profile,
            sketch,
            edit,
            load_error,
        }
    }

    pub fn sketch_pipeline(&self) -> Option<Arc<dyn SketchPipeline>> {
        self.sketch.clone()
    }

    pub fn edit_pipeline(&self) -> Option<Arc<dyn EditPipeline>> {
        self.edit.clone()
    }

    pub fn is_ready(&self) -> bool {
        self.sketch.is_some() && self.edit.is_some()
    }

    pub fn load_error(&self) -> Option<&StudioError> {
        self.load_error.as_ref()
    }

    pub fn profile(&self) -> &DeviceProfile {
        &self.profile
    }

    pub fn device(&self) -> &Device {
        &self.profile.device
    }

    pub fn precision(&self) -> DType {
        self.profile.dtype
    }

    /// User-facing summary of the load, mirrored by the status endpoint.
    pub fn load_status(&self) -> String {
        match &self.load_error {
            Some(err) => err.user_message(),
            None => format!(
                "AI models ready! Running on {}.",
                self.profile.kind.label()
            ),
        }
    }

    /// Best-effort device cleanup after a run. Intermediates are freed by
    /// their owners; this flushes outstanding device work.
    pub fn cleanup_memory(&self) {
        if self.profile.kind.is_accelerator() {
            if let Err(err) = self.profile.device.synchronize() {
                warn!("device synchronize failed during cleanup: {err}");
            }
        }
    }
}

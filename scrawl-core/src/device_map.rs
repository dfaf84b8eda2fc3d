use std::fmt;
use std::str::FromStr;

use anyhow::Result;
use candle_core::{DType, Device};
use tracing::warn;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum DeviceMap {
    ForceCpu,
    Ordinal(usize),
}

impl Default for DeviceMap {
    fn default() -> Self {
        Self::Ordinal(0)
    }
}

impl fmt::Display for DeviceMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ForceCpu => write!(f, "cpu"),
            Self::Ordinal(ordinal) => write!(f, "{ordinal}"),
        }
    }
}

impl FromStr for DeviceMap {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "cpu" => Ok(Self::ForceCpu),
            other => other
                .parse::<usize>()
                .map(Self::Ordinal)
                .map_err(|_| anyhow::anyhow!("expected \"cpu\" or a device ordinal, got {other:?}")),
        }
    }
}

serde_plain::derive_serialize_from_display!(DeviceMap);
serde_plain::derive_deserialize_from_fromstr!(DeviceMap, "device selector");

/// Weight precision preference. `Auto` picks half precision on CUDA and full
/// precision everywhere else.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Precision {
    #[default]
    Auto,
    Half,
    Full,
}

impl Precision {
    pub fn resolve(self, kind: DeviceKind) -> DType {
        match self {
            Self::Auto => {
                if kind == DeviceKind::Cuda {
                    DType::F16
                } else {
                    DType::F32
                }
            }
            Self::Half => DType::F16,
            Self::Full => DType::F32,
        }
    }
}

impl fmt::Display for Precision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Auto => write!(f, "auto"),
            Self::Half => write!(f, "f16"),
            Self::Full => write!(f, "f32"),
        }
    }
}

impl FromStr for Precision {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "auto" => Ok(Self::Auto),
            "f16" | "half" => Ok(Self::Half),
            "f32" | "full" => Ok(Self::Full),
            other => Err(anyhow::anyhow!(
                "expected \"auto\", \"f16\" or \"f32\", got {other:?}"
            )),
        }
    }
}

serde_plain::derive_serialize_from_display!(Precision);
serde_plain::derive_deserialize_from_fromstr!(Precision, "precision selector");

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeviceKind {
    Cpu,
    Cuda,
    Metal,
}

impl DeviceKind {
    pub fn of(device: &Device) -> Self {
        match device {
            Device::Cpu => Self::Cpu,
            Device::Cuda(_) => Self::Cuda,
            Device::Metal(_) => Self::Metal,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Cpu => "CPU",
            Self::Cuda => "CUDA",
            Self::Metal => "Metal",
        }
    }

    pub fn is_accelerator(self) -> bool {
        !matches!(self, Self::Cpu)
    }
}

/// Resolved execution target for the pipelines.
#[derive(Debug, Clone)]
pub struct DeviceProfile {
    pub device: Device,
    pub kind: DeviceKind,
    pub dtype: DType,
    pub total_memory_bytes: Option<u64>,
}

impl DeviceProfile {
    pub fn cpu_fallback() -> Self {
        Self {
            device: Device::Cpu,
            kind: DeviceKind::Cpu,
            dtype: DType::F32,
            total_memory_bytes: None,
        }
    }
}

const GIB: u64 = 1024 * 1024 * 1024;
const MIN_ACCELERATOR_MEMORY: u64 = 6 * GIB;
const COMFORTABLE_ACCELERATOR_MEMORY: u64 = 10 * GIB;

const TOTAL_MEMORY_ENV: &str = "SCRAWL_TOTAL_VRAM_MB";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MemoryVerdict {
    Proceed,
    WarnTight,
    FallBackToCpu,
}

fn memory_verdict(total_memory_bytes: Option<u64>, dtype: DType) -> MemoryVerdict {
    match total_memory_bytes {
        Some(bytes) if bytes < MIN_ACCELERATOR_MEMORY => MemoryVerdict::FallBackToCpu,
        Some(bytes) if bytes < COMFORTABLE_ACCELERATOR_MEMORY && dtype == DType::F32 => {
            MemoryVerdict::WarnTight
        }
        _ => MemoryVerdict::Proceed,
    }
}

/// Reported accelerator memory. Candle exposes no portable query, so this
/// honors an explicit override and otherwise stays unknown.
fn detect_total_memory() -> Option<u64> {
    let raw = std::env::var(TOTAL_MEMORY_ENV).ok()?;
    let megabytes = raw.trim().parse::<u64>().ok()?;
    Some(megabytes * 1024 * 1024)
}

/// Resolves the device and dtype the pipelines should load with. Accelerators
/// with too little memory are traded for the CPU before any weights move.
pub fn probe_device_profile(map: DeviceMap, precision: Precision) -> Result<DeviceProfile> {
    let device = crate::select_device(map)?;
    let kind = DeviceKind::of(&device);
    let mut dtype = precision.resolve(kind);

    let mut total_memory_bytes = None;
    if kind.is_accelerator() {
        total_memory_bytes = detect_total_memory();
        match memory_verdict(total_memory_bytes, dtype) {
            MemoryVerdict::FallBackToCpu => {
                warn!(
                    "insufficient accelerator memory detected ({}), at least 6-8 GiB is recommended; switching to CPU, which will be very slow",
                    describe_memory(total_memory_bytes)
                );
                return Ok(DeviceProfile {
                    total_memory_bytes,
                    ..DeviceProfile::cpu_fallback()
                });
            }
            MemoryVerdict::WarnTight => {
                warn!(
                    "limited accelerator memory ({}) with full precision selected, loading may fail",
                    describe_memory(total_memory_bytes)
                );
            }
            MemoryVerdict::Proceed => {}
        }
    }

    if kind == DeviceKind::Cpu {
        dtype = DType::F32;
    }

    Ok(DeviceProfile {
        device,
        kind,
        dtype,
        total_memory_bytes,
    })
}

fn describe_memory(bytes: Option<u64>) -> String {
    match bytes {
        Some(bytes) => format!("{:.1} GiB", bytes as f64 / GIB as f64),
        None => "unknown".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_map_parses_and_prints() {
        assert_eq!("cpu".parse::<DeviceMap>().unwrap(), DeviceMap::ForceCpu);
        assert_eq!("1".parse::<DeviceMap>().unwrap(), DeviceMap::Ordinal(1));
        assert_eq!(DeviceMap::ForceCpu.to_string(), "cpu");
        assert_eq!(DeviceMap::Ordinal(2).to_string(), "2");
        assert!("gpu".parse::<DeviceMap>().is_err());
    }

    #[test]
    fn device_map_defaults_to_first_ordinal() {
        assert_eq!(DeviceMap::default(), DeviceMap::Ordinal(0));
    }

    #[test]
    fn device_map_serde_uses_plain_strings() {
        let json = serde_json::to_string(&DeviceMap::ForceCpu).unwrap();
        assert_eq!(json, "\"cpu\"");
        let map: DeviceMap = serde_json::from_str("\"3\"").unwrap();
        assert_eq!(map, DeviceMap::Ordinal(3));
    }

    #[test]
    fn precision_resolution_tracks_device_kind() {
        assert_eq!(Precision::Auto.resolve(DeviceKind::Cuda), DType::F16);
        assert_eq!(Precision::Auto.resolve(DeviceKind::Cpu), DType::F32);
        assert_eq!(Precision::Auto.resolve(DeviceKind::Metal), DType::F32);
        assert_eq!(Precision::Half.resolve(DeviceKind::Cpu), DType::F16);
        assert_eq!(Precision::Full.resolve(DeviceKind::Cuda), DType::F32);
    }

    #[test]
    fn precision_parses_and_prints() {
        assert_eq!("half".parse::<Precision>().unwrap(), Precision::Half);
        assert_eq!("f16".parse::<Precision>().unwrap(), Precision::Half);
        assert_eq!("f32".parse::<Precision>().unwrap(), Precision::Full);
        assert_eq!("auto".parse::<Precision>().unwrap(), Precision::Auto);
        assert_eq!(Precision::Half.to_string(), "f16");
        assert!("double".parse::<Precision>().is_err());
    }

    #[test]
    fn scarce_memory_falls_back_to_cpu() {
        assert_eq!(
            memory_verdict(Some(4 * GIB), DType::F16),
            MemoryVerdict::FallBackToCpu
        );
        assert_eq!(
            memory_verdict(Some(6 * GIB - 1), DType::F32),
            MemoryVerdict::FallBackToCpu
        );
    }

    #[test]
    fn tight_memory_with_full_precision_only_warns() {
        assert_eq!(
            memory_verdict(Some(8 * GIB), DType::F32),
            MemoryVerdict::WarnTight
        );
        assert_eq!(
            memory_verdict(Some(6 * GIB), DType::F32),
            MemoryVerdict::WarnTight
        );
    }

    #[test]
    fn ample_or_unknown_memory_proceeds() {
        assert_eq!(memory_verdict(Some(8 * GIB), DType::F16), MemoryVerdict::Proceed);
        assert_eq!(memory_verdict(Some(10 * GIB), DType::F32), MemoryVerdict::Proceed);
        assert_eq!(memory_verdict(Some(24 * GIB), DType::F32), MemoryVerdict::Proceed);
        assert_eq!(memory_verdict(None, DType::F16), MemoryVerdict::Proceed);
    }

    #[test]
    fn cpu_probe_forces_full_precision() {
        let profile = probe_device_profile(DeviceMap::ForceCpu, Precision::Half).unwrap();
        assert_eq!(profile.kind, DeviceKind::Cpu);
        assert_eq!(profile.dtype, DType::F32);
        assert!(profile.total_memory_bytes.is_none());
    }
}

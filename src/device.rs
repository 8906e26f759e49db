//! # Compute Device Selection
//!
//! Picks the candle device the acoustic model is loaded onto, from the
//! `model.device` setting. Unavailable accelerators fall back to the CPU with
//! a warning, so a GPU-less host still serves requests.

use candle_core::Device;
use std::sync::OnceLock;
use tracing::{debug, info, warn};

/// Result of automatic detection, computed once per process.
static DETECTED_DEVICE: OnceLock<Device> = OnceLock::new();

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DevicePreference {
    /// CUDA, then Metal, then CPU
    #[default]
    Auto,
    Cpu,
    Cuda,
    Metal,
}

impl std::str::FromStr for DevicePreference {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "auto" => Ok(DevicePreference::Auto),
            "cpu" => Ok(DevicePreference::Cpu),
            "cuda" | "gpu" => Ok(DevicePreference::Cuda),
            "metal" => Ok(DevicePreference::Metal),
            other => Err(anyhow::anyhow!("Unknown device preference: {}", other)),
        }
    }
}

pub struct DeviceManager;

impl DeviceManager {
    pub fn select(preference: DevicePreference) -> Device {
        match preference {
            DevicePreference::Auto => DETECTED_DEVICE.get_or_init(Self::detect).clone(),
            DevicePreference::Cpu => Device::Cpu,
            DevicePreference::Cuda => Self::cuda().unwrap_or_else(|| {
                warn!("CUDA requested but unavailable, falling back to CPU");
                Device::Cpu
            }),
            DevicePreference::Metal => Self::metal().unwrap_or_else(|| {
                warn!("Metal requested but unavailable, falling back to CPU");
                Device::Cpu
            }),
        }
    }

    fn detect() -> Device {
        if let Some(device) = Self::cuda() {
            info!("Selected CUDA GPU for inference");
            return device;
        }
        if let Some(device) = Self::metal() {
            info!("Selected Metal GPU for inference");
            return device;
        }
        info!("Using CPU for inference");
        Device::Cpu
    }

    fn cuda() -> Option<Device> {
        Device::new_cuda(0)
            .map_err(|e| debug!("CUDA not available: {}", e))
            .ok()
    }

    fn metal() -> Option<Device> {
        Device::new_metal(0)
            .map_err(|e| debug!("Metal not available: {}", e))
            .ok()
    }

    pub fn describe(device: &Device) -> &'static str {
        match device {
            Device::Cpu => "cpu",
            Device::Cuda(_) => "cuda",
            Device::Metal(_) => "metal",
        }
    }
}

/// Resolve the configured device string, treating unknown values as `auto`.
pub fn device_from_setting(setting: &str) -> Device {
    let preference = setting.parse::<DevicePreference>().unwrap_or_else(|e| {
        warn!("{}, using auto", e);
        DevicePreference::Auto
    });
    DeviceManager::select(preference)
}

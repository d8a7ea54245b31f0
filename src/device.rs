//! # Compute Device Selection
//!
//! Picks the Candle device the Whisper models are loaded onto. Runs once at
//! startup; the chosen device is handed to the model loader.

use candle_core::Device;
use tracing::{debug, info, warn};

/// Device preference from `models.device`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DevicePreference {
    /// CUDA if present, then Metal, then CPU
    #[default]
    Auto,
    Cpu,
    /// Falls back to CPU when no CUDA device can be opened
    Cuda,
    /// Falls back to CPU when no Metal device can be opened
    Metal,
}

impl std::str::FromStr for DevicePreference {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "auto" => Ok(DevicePreference::Auto),
            "cpu" => Ok(DevicePreference::Cpu),
            "cuda" | "gpu" => Ok(DevicePreference::Cuda),
            "metal" => Ok(DevicePreference::Metal),
            _ => Err(format!("Unknown device preference: {}", s)),
        }
    }
}

/// Open the device for a preference, falling back to CPU.
pub fn select_device(preference: DevicePreference) -> Device {
    let device = match preference {
        DevicePreference::Cpu => Device::Cpu,
        DevicePreference::Cuda => cuda().unwrap_or_else(|| {
            warn!("CUDA requested but unavailable, using CPU");
            Device::Cpu
        }),
        DevicePreference::Metal => metal().unwrap_or_else(|| {
            warn!("Metal requested but unavailable, using CPU");
            Device::Cpu
        }),
        DevicePreference::Auto => cuda().or_else(metal).unwrap_or(Device::Cpu),
    };
    info!("Using {} for inference", device_label(&device));
    device
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

/// Short name for logs and the health endpoint.
pub fn device_label(device: &Device) -> &'static str {
    match device {
        Device::Cpu => "cpu",
        Device::Cuda(_) => "cuda",
        Device::Metal(_) => "metal",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_preference_parsing() {
        assert_eq!("auto".parse::<DevicePreference>().unwrap(), DevicePreference::Auto);
        assert_eq!("CPU".parse::<DevicePreference>().unwrap(), DevicePreference::Cpu);
        assert_eq!("gpu".parse::<DevicePreference>().unwrap(), DevicePreference::Cuda);
        assert_eq!("metal".parse::<DevicePreference>().unwrap(), DevicePreference::Metal);
        assert!("tpu".parse::<DevicePreference>().is_err());
    }

    #[test]
    fn test_cpu_preference_is_cpu() {
        let device = select_device(DevicePreference::Cpu);
        assert_eq!(device_label(&device), "cpu");
    }
}

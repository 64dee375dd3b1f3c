//! # Compute Device Selection
//!
//! Resolves the configured device string ("auto", "cpu", "cuda", "metal")
//! into a candle `Device`, preferring GPU acceleration when available and
//! always falling back to CPU rather than failing.

use candle_core::Device;
use std::sync::OnceLock;
use tracing::{debug, info, warn};

/// Detection runs once; the model is loaded a single time at startup and the
/// answer cannot change while the process lives.
static BEST_DEVICE: OnceLock<Device> = OnceLock::new();

/// Parsed device preference from configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DevicePreference {
    /// Pick the best available device
    #[default]
    Auto,
    /// Force CPU
    Cpu,
    /// Prefer CUDA, fall back to CPU
    Cuda,
    /// Prefer Metal, fall back to CPU
    Metal,
}

impl std::str::FromStr for DevicePreference {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "auto" | "automatic" => Ok(DevicePreference::Auto),
            "cpu" => Ok(DevicePreference::Cpu),
            "cuda" | "gpu" => Ok(DevicePreference::Cuda),
            "metal" => Ok(DevicePreference::Metal),
            _ => Err(format!("Unknown device preference: {}", s)),
        }
    }
}

/// Resolve a preference into a concrete device.
pub fn get_device(preference: DevicePreference) -> Device {
    match preference {
        DevicePreference::Auto => best_device(),
        DevicePreference::Cpu => Device::Cpu,
        DevicePreference::Cuda => cuda_device().unwrap_or(Device::Cpu),
        DevicePreference::Metal => metal_device().unwrap_or(Device::Cpu),
    }
}

/// Best available device, detected once and cached.
pub fn best_device() -> Device {
    BEST_DEVICE
        .get_or_init(|| {
            info!("Detecting compute device for speech inference...");

            if let Some(device) = cuda_device() {
                info!("Selected CUDA GPU");
                return device;
            }

            if let Some(device) = metal_device() {
                info!("Selected Metal GPU");
                return device;
            }

            info!("Using CPU (no GPU acceleration available)");
            Device::Cpu
        })
        .clone()
}

fn cuda_device() -> Option<Device> {
    match Device::new_cuda(0) {
        Ok(device) => Some(device),
        Err(e) => {
            debug!("CUDA not available: {}", e);
            None
        }
    }
}

fn metal_device() -> Option<Device> {
    match Device::new_metal(0) {
        Ok(device) => Some(device),
        Err(e) => {
            debug!("Metal not available: {}", e);
            None
        }
    }
}

/// Human-readable label for health reporting.
pub fn device_label(device: &Device) -> &'static str {
    match device {
        Device::Cpu => "cpu",
        Device::Cuda(_) => "cuda",
        Device::Metal(_) => "metal",
    }
}

/// Resolve a config string into a device, tolerating bad input.
pub fn create_device_from_string(device_str: &str) -> Device {
    match device_str.parse::<DevicePreference>() {
        Ok(preference) => get_device(preference),
        Err(_) => {
            warn!("Invalid device preference '{}', using auto", device_str);
            best_device()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_preference_parsing() {
        assert_eq!("auto".parse::<DevicePreference>().unwrap(), DevicePreference::Auto);
        assert_eq!("cpu".parse::<DevicePreference>().unwrap(), DevicePreference::Cpu);
        assert_eq!("cuda".parse::<DevicePreference>().unwrap(), DevicePreference::Cuda);
        assert_eq!("metal".parse::<DevicePreference>().unwrap(), DevicePreference::Metal);
        assert!("invalid".parse::<DevicePreference>().is_err());
    }

    #[test]
    fn test_cpu_preference_always_resolves() {
        let device = get_device(DevicePreference::Cpu);
        assert_eq!(device_label(&device), "cpu");
    }

    #[test]
    fn test_bad_string_falls_back_to_auto() {
        // Must not panic, whatever the host hardware is
        let _ = create_device_from_string("quantum");
    }
}

//! Accelerator discovery and Device-tier budgeting.
//!
//! With the `cuda` feature, devices are enumerated through cudarc and the
//! Device tier is sized from free memory. Without it, no devices are
//! reported and callers fall back to a configured budget.

use serde::{Deserialize, Serialize};
use tracing::info;

/// Information about a single accelerator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GpuDeviceInfo {
    /// Device index.
    pub id: usize,

    pub name: String,

    /// Total memory in bytes.
    pub total_memory: usize,

    /// Free memory in bytes (at detection time).
    pub free_memory: usize,
}

/// Detect all available accelerators.
pub fn detect_devices() -> Vec<GpuDeviceInfo> {
    #[cfg(feature = "cuda")]
    {
        detect_devices_cuda()
    }

    #[cfg(not(feature = "cuda"))]
    {
        info!("CUDA not enabled, sizing the device tier from configuration");
        Vec::new()
    }
}

#[cfg(feature = "cuda")]
fn detect_devices_cuda() -> Vec<GpuDeviceInfo> {
    use cudarc::driver::{result, CudaContext};

    let mut devices = Vec::new();
    for id in 0..16 {
        let Ok(ctx) = CudaContext::new(id) else {
            break;
        };
        let name = ctx.name().unwrap_or_else(|_| format!("cuda:{id}"));
        let (free_memory, total_memory) = match ctx.bind_to_thread().and_then(|_| result::mem_get_info()) {
            Ok(info) => info,
            Err(e) => {
                tracing::warn!(device = id, error = %e, "Failed to query device memory");
                continue;
            }
        };
        info!(device = id, %name, total_memory, free_memory, "Detected CUDA device");
        devices.push(GpuDeviceInfo {
            id,
            name,
            total_memory,
            free_memory,
        });
    }
    devices
}

/// Device-tier budget for a set of devices: the static fraction of total
/// memory, capped by what is free, on the smallest device.
pub fn cache_budget(devices: &[GpuDeviceInfo], mem_fraction_static: f64) -> Option<usize> {
    devices
        .iter()
        .map(|d| ((d.total_memory as f64 * mem_fraction_static) as usize).min(d.free_memory))
        .min()
        .filter(|budget| *budget > 0)
}

/// Device-tier budget of this machine, or `None` without accelerators.
pub fn device_cache_budget(mem_fraction_static: f64) -> Option<usize> {
    cache_budget(&detect_devices(), mem_fraction_static)
}

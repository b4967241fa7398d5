//! Accelerator selection for generation pipelines.
//!
//! Checkpoints are placed on the first CUDA device when the `cuda` feature
//! is enabled, on Metal with the `metal` feature, and on the CPU otherwise.

use anyhow::Result;
use candle_core::Device;
use tracing::{debug, warn};

/// Select the device every pipeline component is loaded onto.
///
/// `force_cpu` overrides any accelerator feature, which is mostly useful for
/// running the smaller checkpoints on machines without a GPU.
pub fn select(force_cpu: bool) -> Result<Device> {
    if force_cpu {
        warn!("Running on CPU: generation will be very slow");
        return Ok(Device::Cpu);
    }

    #[cfg(feature = "cuda")]
    {
        let device = Device::new_cuda(0).or_else(|_| Device::cuda_if_available(0))?;
        if device.is_cuda() {
            return Ok(device);
        }
    }

    #[cfg(feature = "metal")]
    {
        if let Ok(device) = Device::new_metal(0) {
            return Ok(device);
        }
    }

    warn!("No accelerator available, falling back to CPU");
    Ok(Device::Cpu)
}

/// Print the CUDA devices visible to the process, name and memory included.
///
/// Query goes through `nvidia-smi` since candle does not expose device
/// memory. Failures are ignored: the listing is informational only.
#[cfg(feature = "cuda")]
pub fn describe_cuda_devices() {
    let output = std::process::Command::new("nvidia-smi")
        .args([
            "--query-gpu=index,name,memory.total,memory.free",
            "--format=csv,noheader,nounits",
        ])
        .output();

    let Ok(output) = output else {
        debug!("nvidia-smi not available, skipping GPU listing");
        return;
    };
    if !output.status.success() {
        return;
    }

    let gpu_list = String::from_utf8_lossy(&output.stdout);
    println!("Available GPUs:");
    for line in gpu_list.lines() {
        let parts: Vec<&str> = line.split(',').collect();
        if parts.len() >= 4 {
            println!(
                "  GPU {}: {} - {}MB total, {}MB free",
                parts[0].trim(),
                parts[1].trim(),
                parts[2].trim(),
                parts[3].trim()
            );
        }
    }
    println!();
}

#[cfg(not(feature = "cuda"))]
pub fn describe_cuda_devices() {
    debug!("Built without CUDA support, skipping GPU listing");
}

/// Seed the device RNG for reproducible noise.
///
/// The CPU backend does not support seeding through the device handle, so a
/// failure is only logged.
pub fn seed(device: &Device, seed: u64) {
    if let Err(e) = device.set_seed(seed) {
        debug!(error = %e, "Could not set device seed (CPU backend)");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn force_cpu_always_selects_cpu() {
        let device = select(true).unwrap();
        assert!(matches!(device, Device::Cpu));
    }

    #[cfg(not(any(feature = "cuda", feature = "metal")))]
    #[test]
    fn default_build_falls_back_to_cpu() {
        let device = select(false).unwrap();
        assert!(matches!(device, Device::Cpu));
    }
}

use tch::{Cuda, Device};

use crate::error::{PipelineError, Result};

/// Parses `cpu`, `cuda`, `cuda:N`, `mps` or `auto`.
///
/// Accelerators that are not present are rejected rather than silently
/// replaced by the CPU; only `auto` falls back.
pub fn resolve_device(spec: &str) -> Result<Device> {
    let normalized = spec.trim().to_ascii_lowercase();
    let invalid = || PipelineError::InvalidDevice { device: spec.to_string() };

    match normalized.as_str() {
        "cpu" => Ok(Device::Cpu),
        "auto" => Ok(Device::cuda_if_available()),
        "mps" if tch::utils::has_mps() => Ok(Device::Mps),
        "cuda" | "gpu" if Cuda::is_available() => Ok(Device::Cuda(0)),
        other => {
            let index: usize = other
                .strip_prefix("cuda:")
                .and_then(|i| i.parse().ok())
                .ok_or_else(invalid)?;
            if index < Cuda::device_count() as usize {
                Ok(Device::Cuda(index))
            } else {
                Err(invalid())
            }
        }
    }
}

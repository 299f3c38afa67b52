//! Compute device selection for the embedding networks.

use anyhow::{bail, Result};
use ort::execution_providers::{CUDAExecutionProvider, ExecutionProvider, ExecutionProviderDispatch};
use std::fmt;

use crate::config::DevicePreference;

/// Device the ONNX sessions execute on. Resolved once at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Device {
    Cpu,
    Cuda { device_id: i32 },
}

impl Device {
    /// Resolve the configured preference. `Auto` takes the first CUDA device
    /// when the CUDA execution provider is usable and falls back to the CPU.
    pub fn select(preference: DevicePreference) -> Result<Self> {
        match preference {
            DevicePreference::Cpu => Ok(Device::Cpu),
            DevicePreference::Cuda => {
                if cuda_available() {
                    Ok(Device::Cuda { device_id: 0 })
                } else {
                    bail!("CUDA was requested but the CUDA execution provider is not available")
                }
            }
            DevicePreference::Auto => {
                if cuda_available() {
                    Ok(Device::Cuda { device_id: 0 })
                } else {
                    Ok(Device::Cpu)
                }
            }
        }
    }

    /// Execution providers to register on a session builder. The CPU provider
    /// is always implied by ONNX Runtime.
    pub fn execution_providers(&self) -> Vec<ExecutionProviderDispatch> {
        match self {
            Device::Cpu => Vec::new(),
            Device::Cuda { device_id } => vec![CUDAExecutionProvider::default()
                .with_device_id(*device_id)
                .build()
                .error_on_failure()],
        }
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Device::Cpu => write!(f, "cpu"),
            Device::Cuda { device_id } => write!(f, "cuda:{}", device_id),
        }
    }
}

fn cuda_available() -> bool {
    match CUDAExecutionProvider::default().is_available() {
        Ok(available) => available,
        Err(e) => {
            tracing::debug!(error = %e, "Could not query CUDA execution provider");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_explicit_cpu() {
        let device = Device::select(DevicePreference::Cpu).unwrap();
        assert_eq!(device, Device::Cpu);
        assert!(device.execution_providers().is_empty());
    }

    #[test]
    fn test_display() {
        assert_eq!(Device::Cpu.to_string(), "cpu");
        assert_eq!(Device::Cuda { device_id: 0 }.to_string(), "cuda:0");
    }
}

//! Explicit device context threaded through every split-convolution operation.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::spec::{AcceleratorBackend, BackendResult};
use crate::layout::MemoryTier;
use crate::tensor::{DType, DeviceTensor, Tensor};

/// Accelerator generation; some compute options depend on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Arch {
    Grayskull,
    WormholeB0,
    Blackhole,
}

impl Arch {
    /// Whether the math engine can keep its destination registers in fp32.
    pub fn supports_fp32_dest_acc(self) -> bool {
        !matches!(self, Arch::Grayskull)
    }
}

impl fmt::Display for Arch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Arch::Grayskull => f.write_str("grayskull"),
            Arch::WormholeB0 => f.write_str("wormhole_b0"),
            Arch::Blackhole => f.write_str("blackhole"),
        }
    }
}

/// Device the split convolution runs on: backend instance, device id and architecture.
pub struct DeviceContext<B: AcceleratorBackend + 'static> {
    backend: Arc<B>,
    device_id: usize,
    arch: Arch,
}

impl<B: AcceleratorBackend + 'static> Clone for DeviceContext<B> {
    fn clone(&self) -> Self {
        DeviceContext {
            backend: Arc::clone(&self.backend),
            device_id: self.device_id,
            arch: self.arch,
        }
    }
}

impl<B: AcceleratorBackend + 'static> DeviceContext<B> {
    /// Opens device 0 of a Wormhole B0 style accelerator.
    pub fn new(backend: Arc<B>) -> Self {
        Self {
            backend,
            device_id: 0,
            arch: Arch::WormholeB0,
        }
    }

    pub fn with_device_id(mut self, device_id: usize) -> Self {
        self.device_id = device_id;
        self
    }

    pub fn with_arch(mut self, arch: Arch) -> Self {
        self.arch = arch;
        self
    }

    pub fn backend(&self) -> &Arc<B> {
        &self.backend
    }

    pub fn device_id(&self) -> usize {
        self.device_id
    }

    pub fn arch(&self) -> Arch {
        self.arch
    }

    /// Materializes a host tensor through the backend, taking ownership of the new handle.
    pub fn upload(
        &self,
        tensor: &Tensor,
        dtype: DType,
        tier: MemoryTier,
    ) -> BackendResult<DeviceTensor<B>> {
        let handle = self.backend.from_host(tensor, dtype, tier)?;
        Ok(DeviceTensor::from_handle(Arc::clone(&self.backend), handle))
    }
}

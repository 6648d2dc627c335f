//! Owned device tensor: one backend handle with guaranteed, single release.

use std::fmt;
use std::sync::Arc;

use tracing::warn;

use super::Tensor;
use crate::backend::spec::{AcceleratorBackend, BackendResult, TensorDesc};
use crate::layout::MemoryTier;

/// Device-side tensor that owns a backend handle.
///
/// The handle is returned to the backend exactly once: explicitly through [`release`], which
/// reports failures, or when the tensor is dropped, which can only log them. The type is not
/// `Clone`, so a released handle can never be reached again.
///
/// [`release`]: DeviceTensor::release
pub struct DeviceTensor<B: AcceleratorBackend + 'static> {
    backend: Arc<B>,
    handle: Option<B::TensorHandle>,
}

impl<B: AcceleratorBackend + 'static> DeviceTensor<B> {
    /// Takes ownership of a handle freshly produced by `backend`.
    pub fn from_handle(backend: Arc<B>, handle: B::TensorHandle) -> Self {
        DeviceTensor {
            backend,
            handle: Some(handle),
        }
    }

    /// Returns the backend instance that owns the tensor.
    pub fn backend(&self) -> Arc<B> {
        Arc::clone(&self.backend)
    }

    /// Borrows the raw backend handle.
    pub fn handle(&self) -> &B::TensorHandle {
        self.handle
            .as_ref()
            .expect("device tensor handle is only taken on release")
    }

    /// Mutably borrows the raw backend handle, e.g. as an in-place accumulator.
    pub fn handle_mut(&mut self) -> &mut B::TensorHandle {
        self.handle
            .as_mut()
            .expect("device tensor handle is only taken on release")
    }

    /// Queries shape, dtype, layout and memory tier from the backend.
    pub fn desc(&self) -> BackendResult<TensorDesc> {
        self.backend.describe(self.handle())
    }

    pub fn tier(&self) -> BackendResult<MemoryTier> {
        Ok(self.desc()?.tier)
    }

    /// Copies the device tensor back to the host.
    pub fn to_host(&self) -> BackendResult<Tensor> {
        self.backend.to_host(self.handle())
    }

    /// Copies the tensor into `tier`; `self` stays alive and owned by the caller.
    pub fn to_memory_tier(&self, tier: MemoryTier) -> BackendResult<DeviceTensor<B>> {
        let handle = self.backend.to_memory_tier(self.handle(), tier)?;
        Ok(DeviceTensor::from_handle(self.backend(), handle))
    }

    /// Moves the tensor into `tier`, releasing the source allocation.
    ///
    /// Returns `self` untouched when it already lives in `tier`.
    pub fn into_memory_tier(self, tier: MemoryTier) -> BackendResult<DeviceTensor<B>> {
        if self.tier()? == tier {
            return Ok(self);
        }
        let moved = self.to_memory_tier(tier)?;
        self.release()?;
        Ok(moved)
    }

    /// Returns the handle to the backend, surfacing any deallocation failure.
    pub fn release(mut self) -> BackendResult<()> {
        match self.handle.take() {
            Some(handle) => self.backend.deallocate(handle),
            None => Ok(()),
        }
    }
}

impl<B: AcceleratorBackend + 'static> Drop for DeviceTensor<B> {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            if let Err(err) = self.backend.deallocate(handle) {
                warn!(
                    backend = self.backend.backend_name(),
                    "failed to release device tensor on drop: {err}"
                );
            }
        }
    }
}

impl<B: AcceleratorBackend + 'static> fmt::Debug for DeviceTensor<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut dbg = f.debug_struct("DeviceTensor");
        dbg.field("backend", &self.backend.backend_name());
        match self.desc() {
            Ok(desc) => dbg.field("desc", &format_args!("{desc}")),
            Err(_) => dbg.field("desc", &"<unavailable>"),
        };
        dbg.finish()
    }
}

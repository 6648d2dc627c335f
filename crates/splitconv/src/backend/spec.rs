//! Contract between the split-convolution layer and an accelerator tensor backend.
//!
//! The backend owns device memory and implements every numeric primitive. This layer only
//! sequences calls and moves handle ownership around, so the trait is deliberately narrow:
//! construction, readback, metadata, convolution, split/concat, in-place add, memory-tier
//! transfer and explicit release.

use std::fmt;

use thiserror::Error;

use crate::config::Conv2dParams;
use crate::layout::{Layout, MemoryTier};
use crate::tensor::{DType, Shape, Tensor};

/// Metadata a backend reports for a live tensor handle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TensorDesc {
    pub shape: Shape,
    pub dtype: DType,
    pub layout: Layout,
    pub tier: MemoryTier,
}

impl TensorDesc {
    pub fn new(shape: Shape, dtype: DType, layout: Layout, tier: MemoryTier) -> Self {
        Self {
            shape,
            dtype,
            layout,
            tier,
        }
    }

    /// Number of bytes the payload occupies in its dtype.
    pub fn byte_len(&self) -> usize {
        self.shape.num_elements() * self.dtype.size_in_bytes()
    }
}

impl fmt::Display for TensorDesc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {} @ {}",
            self.shape, self.dtype, self.layout, self.tier
        )
    }
}

/// One convolution invocation.
///
/// Activations are NHWC (`[N, H, W, C_in]`), weights OIHW (`[C_out, C_in/groups, KH, KW]`) and
/// the optional bias `[1, 1, 1, C_out]`.
pub struct Conv2dRequest<'a, H> {
    pub input: &'a H,
    pub weight: &'a H,
    pub bias: Option<&'a H>,
    pub params: &'a Conv2dParams,
    pub device_id: usize,
    /// Ask the backend to hand back the device-resident weight/bias it prepared for this call.
    pub return_weights_and_bias: bool,
}

/// Device-resident copies of the weight and bias a convolution consumed.
pub struct PreparedConvTensors<H> {
    pub weight: H,
    pub bias: Option<H>,
}

/// Result of a convolution invocation.
pub struct Conv2dOutput<H> {
    pub output: H,
    /// Present only when the request set `return_weights_and_bias`.
    pub prepared: Option<PreparedConvTensors<H>>,
}

/// Backend error surfaced to higher layers.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("{op} is not implemented: {reason}")]
    Unimplemented { op: &'static str, reason: String },
    #[error("backend execution failure: {message}")]
    Execution { message: String },
    #[error("out of {tier} memory: requested {requested} bytes, {available} available")]
    OutOfMemory {
        tier: MemoryTier,
        requested: usize,
        available: usize,
    },
    #[error("invalid tensor handle: {message}")]
    InvalidHandle { message: String },
}

impl BackendError {
    pub fn unimplemented(op: &'static str, reason: impl Into<String>) -> Self {
        BackendError::Unimplemented {
            op,
            reason: reason.into(),
        }
    }

    pub fn execution(message: impl Into<String>) -> Self {
        BackendError::Execution {
            message: message.into(),
        }
    }

    pub fn invalid_handle(message: impl Into<String>) -> Self {
        BackendError::InvalidHandle {
            message: message.into(),
        }
    }
}

/// Convenience alias for results returned by backend routines.
pub type BackendResult<T> = Result<T, BackendError>;

/// Accelerator backend providing the primitives the split convolution is built from.
///
/// Handles are not `Clone`: each one is owned by exactly one [`crate::DeviceTensor`] and must be
/// returned through [`AcceleratorBackend::deallocate`] exactly once.
pub trait AcceleratorBackend: Send + Sync {
    type TensorHandle: Send + Sync + 'static;

    /// Returns a human-readable backend identifier (e.g., `"cpu"`).
    fn backend_name(&self) -> &str;

    /// Builds a tensor from host data, rounding to `dtype` and placing it in `tier`.
    fn from_host(
        &self,
        tensor: &Tensor,
        dtype: DType,
        tier: MemoryTier,
    ) -> BackendResult<Self::TensorHandle>;

    /// Reads a tensor back into host memory (debug/testing only).
    fn to_host(&self, tensor: &Self::TensorHandle) -> BackendResult<Tensor>;

    /// Reports shape, dtype, layout and current memory tier.
    fn describe(&self, tensor: &Self::TensorHandle) -> BackendResult<TensorDesc>;

    /// Runs one 2-D convolution.
    fn conv2d(
        &self,
        request: Conv2dRequest<'_, Self::TensorHandle>,
    ) -> BackendResult<Conv2dOutput<Self::TensorHandle>>;

    /// Splits `tensor` along `axis` into consecutive chunks of `chunk` entries.
    fn split(
        &self,
        tensor: &Self::TensorHandle,
        chunk: usize,
        axis: isize,
    ) -> BackendResult<Vec<Self::TensorHandle>>;

    /// Concatenates `inputs` along `axis` into a fresh tensor.
    fn concat(
        &self,
        inputs: &[&Self::TensorHandle],
        axis: isize,
    ) -> BackendResult<Self::TensorHandle>;

    /// Accumulates `rhs` into `acc` element-wise.
    fn add_inplace(
        &self,
        acc: &mut Self::TensorHandle,
        rhs: &Self::TensorHandle,
    ) -> BackendResult<()>;

    /// Copies `tensor` into `tier`, returning the new allocation. The source stays alive.
    fn to_memory_tier(
        &self,
        tensor: &Self::TensorHandle,
        tier: MemoryTier,
    ) -> BackendResult<Self::TensorHandle>;

    /// Releases the memory behind `tensor`.
    fn deallocate(&self, tensor: Self::TensorHandle) -> BackendResult<()>;
}

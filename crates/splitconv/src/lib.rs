//! Split convolution over pluggable accelerator backends.
//!
//! A convolution too large for the accelerator's fast memory is executed as a grid of smaller
//! convolutions over channel slices of the input and the weight. Partial results are summed
//! over input-channel slices and concatenated over output-channel slices, giving the same
//! tensor an unsplit convolution would. The backend, expressed by
//! [`AcceleratorBackend`], owns all numerics and memory; this crate sequences its primitives and
//! manages handle ownership.

pub mod backend;
pub mod config;
pub mod layout;
pub mod split;
pub mod telemetry;
pub mod tensor;

pub use backend::{AcceleratorBackend, Arch, BackendError, DeviceContext};
pub use config::{ComputeKernelConfig, Conv2dConfig, Conv2dParams, SplitConvConfig};
pub use layout::{Layout, MemoryTier};
pub use split::{
    prepare_split_weights, split_conv_and_run, SplitConvError, SplitConvExecutor,
    SplitConvOutput, SplitFactors, SplitWeights,
};
pub use tensor::{DType, DeviceTensor, Shape, Tensor};

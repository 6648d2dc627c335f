//! Core tensor abstractions shared across backends.
//!
//! Host tensors carry weights and test data; [`DeviceTensor`] owns a backend handle and is the
//! unit of ownership transfer throughout the split convolution.

mod device_tensor;
pub mod dtype;
mod host_tensor;
pub mod shape;

pub use device_tensor::DeviceTensor;
pub use dtype::DType;
pub use host_tensor::Tensor;
pub use shape::Shape;

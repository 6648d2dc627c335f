//! Backend contract and the device context that carries it.

pub mod context;
pub mod spec;

pub use context::{Arch, DeviceContext};
pub use spec::{
    AcceleratorBackend, BackendError, BackendResult, Conv2dOutput, Conv2dRequest,
    PreparedConvTensors, TensorDesc,
};

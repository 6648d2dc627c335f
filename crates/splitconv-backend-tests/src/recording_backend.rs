use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use splitconv::backend::{
    AcceleratorBackend, BackendError, BackendResult, Conv2dOutput, Conv2dRequest, TensorDesc,
};
use splitconv::{DType, MemoryTier, Tensor};

/// Observable details of one `conv2d` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConvCall {
    pub with_bias: bool,
    pub return_weights_and_bias: bool,
    pub in_channels: usize,
    pub out_channels: usize,
    pub weight_tier: MemoryTier,
    pub device_id: usize,
}

#[derive(Default)]
struct Recording {
    calls: HashMap<&'static str, usize>,
    convs: Vec<ConvCall>,
    fail_at: Option<(&'static str, usize)>,
}

/// Test-only backend wrapper that counts primitive calls and can inject a failure.
///
/// Every call is forwarded to the wrapped backend. A failure armed with [`fail_on`] makes the
/// `nth` call (1-based) of the named operation return [`BackendError::Execution`] without
/// reaching the inner backend.
///
/// [`fail_on`]: RecordingBackend::fail_on
pub struct RecordingBackend<B: AcceleratorBackend> {
    inner: Arc<B>,
    recording: Mutex<Recording>,
}

impl<B: AcceleratorBackend> RecordingBackend<B> {
    pub fn new(inner: Arc<B>) -> Self {
        Self {
            inner,
            recording: Mutex::new(Recording::default()),
        }
    }

    /// Number of calls to `op` so far.
    pub fn calls(&self, op: &str) -> usize {
        self.recording
            .lock()
            .expect("backend mutex poisoned")
            .calls
            .get(op)
            .copied()
            .unwrap_or(0)
    }

    pub fn conv_calls(&self) -> Vec<ConvCall> {
        self.recording
            .lock()
            .expect("backend mutex poisoned")
            .convs
            .clone()
    }

    /// Arms a failure for the `nth` call of `op`, counted from the current totals.
    pub fn fail_on(&self, op: &'static str, nth: usize) {
        let mut recording = self.recording.lock().expect("backend mutex poisoned");
        let at = recording.calls.get(op).copied().unwrap_or(0) + nth;
        recording.fail_at = Some((op, at));
    }

    pub fn reset(&self) {
        *self.recording.lock().expect("backend mutex poisoned") = Recording::default();
    }

    fn record(&self, op: &'static str) -> BackendResult<()> {
        let mut recording = self.recording.lock().expect("backend mutex poisoned");
        let count = recording.calls.entry(op).or_insert(0);
        *count += 1;
        let count = *count;
        if recording.fail_at == Some((op, count)) {
            return Err(BackendError::execution(format!(
                "injected failure in {op} call {count}"
            )));
        }
        Ok(())
    }
}

impl<B: AcceleratorBackend> AcceleratorBackend for RecordingBackend<B> {
    type TensorHandle = B::TensorHandle;

    fn backend_name(&self) -> &str {
        "recording"
    }

    fn from_host(
        &self,
        tensor: &Tensor,
        dtype: DType,
        tier: MemoryTier,
    ) -> BackendResult<Self::TensorHandle> {
        self.record("from_host")?;
        self.inner.from_host(tensor, dtype, tier)
    }

    fn to_host(&self, tensor: &Self::TensorHandle) -> BackendResult<Tensor> {
        self.inner.to_host(tensor)
    }

    fn describe(&self, tensor: &Self::TensorHandle) -> BackendResult<TensorDesc> {
        self.inner.describe(tensor)
    }

    fn conv2d(
        &self,
        request: Conv2dRequest<'_, Self::TensorHandle>,
    ) -> BackendResult<Conv2dOutput<Self::TensorHandle>> {
        let weight_tier = self.inner.describe(request.weight)?.tier;
        self.recording
            .lock()
            .expect("backend mutex poisoned")
            .convs
            .push(ConvCall {
                with_bias: request.bias.is_some(),
                return_weights_and_bias: request.return_weights_and_bias,
                in_channels: request.params.in_channels,
                out_channels: request.params.out_channels,
                weight_tier,
                device_id: request.device_id,
            });
        self.record("conv2d")?;
        self.inner.conv2d(request)
    }

    fn split(
        &self,
        tensor: &Self::TensorHandle,
        chunk: usize,
        axis: isize,
    ) -> BackendResult<Vec<Self::TensorHandle>> {
        self.record("split")?;
        self.inner.split(tensor, chunk, axis)
    }

    fn concat(
        &self,
        inputs: &[&Self::TensorHandle],
        axis: isize,
    ) -> BackendResult<Self::TensorHandle> {
        self.record("concat")?;
        self.inner.concat(inputs, axis)
    }

    fn add_inplace(
        &self,
        acc: &mut Self::TensorHandle,
        rhs: &Self::TensorHandle,
    ) -> BackendResult<()> {
        self.record("add_inplace")?;
        self.inner.add_inplace(acc, rhs)
    }

    fn to_memory_tier(
        &self,
        tensor: &Self::TensorHandle,
        tier: MemoryTier,
    ) -> BackendResult<Self::TensorHandle> {
        self.record("to_memory_tier")?;
        self.inner.to_memory_tier(tensor, tier)
    }

    fn deallocate(&self, tensor: Self::TensorHandle) -> BackendResult<()> {
        // Not injectable.
        self.recording
            .lock()
            .expect("backend mutex poisoned")
            .calls
            .entry("deallocate")
            .and_modify(|count| *count += 1)
            .or_insert(1);
        self.inner.deallocate(tensor)
    }
}

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use half::{bf16, f16};
use tracing::trace;

use splitconv::backend::{
    AcceleratorBackend, BackendError, BackendResult, Conv2dOutput, Conv2dRequest,
    PreparedConvTensors, TensorDesc,
};
use splitconv::config::{ComputeKernelConfig, Conv2dParams};
use splitconv::{DType, Layout, MemoryTier, Shape, Tensor};

static HANDLE_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

fn next_handle_id() -> u64 {
    HANDLE_ID_COUNTER.fetch_add(1, AtomicOrdering::Relaxed)
}

/// Tensor owned by the reference CPU backend.
///
/// Values are kept as `f32` but always rounded to `desc.dtype`, so reduced-precision tensors
/// behave numerically like their device counterparts.
pub struct CpuTensor {
    id: u64,
    desc: TensorDesc,
    data: Vec<f32>,
}

impl CpuTensor {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn desc(&self) -> &TensorDesc {
        &self.desc
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }
}

#[derive(Default)]
struct Ledger {
    live: HashMap<u64, (MemoryTier, usize)>,
    bytes: HashMap<MemoryTier, usize>,
    peak: HashMap<MemoryTier, usize>,
    weight_uploads: usize,
}

impl Ledger {
    fn tier_bytes(&self, tier: MemoryTier) -> usize {
        self.bytes.get(&tier).copied().unwrap_or(0)
    }
}

/// Reference CPU implementation of [`AcceleratorBackend`].
///
/// Memory tiers are bookkeeping only, but allocations are accounted per tier and an optional
/// L1 capacity turns oversized scratch allocations into [`BackendError::OutOfMemory`].
pub struct CpuBackend {
    l1_capacity: Option<usize>,
    ledger: Mutex<Ledger>,
}

impl CpuBackend {
    pub fn new() -> Self {
        Self {
            l1_capacity: None,
            ledger: Mutex::new(Ledger::default()),
        }
    }

    /// Limits the bytes that may be live in L1 at any time.
    pub fn with_l1_capacity(mut self, bytes: usize) -> Self {
        self.l1_capacity = Some(bytes);
        self
    }

    /// Number of handles allocated and not yet released.
    pub fn live_handles(&self) -> usize {
        self.ledger().live.len()
    }

    pub fn live_bytes(&self, tier: MemoryTier) -> usize {
        self.ledger().tier_bytes(tier)
    }

    /// Highest number of bytes simultaneously live in `tier` since creation or the last reset.
    pub fn peak_bytes(&self, tier: MemoryTier) -> usize {
        self.ledger().peak.get(&tier).copied().unwrap_or(0)
    }

    pub fn reset_peaks(&self) {
        let mut ledger = self.ledger();
        let current = ledger.bytes.clone();
        ledger.peak = current;
    }

    /// Host-resident weights or biases staged in DRAM by convolutions.
    pub fn weight_uploads(&self) -> usize {
        self.ledger().weight_uploads
    }

    fn ledger(&self) -> MutexGuard<'_, Ledger> {
        self.ledger.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn allocate(&self, desc: TensorDesc, mut data: Vec<f32>) -> BackendResult<CpuTensor> {
        if data.len() != desc.shape.num_elements() {
            return Err(BackendError::execution(format!(
                "payload of {} values does not fill {}",
                data.len(),
                desc
            )));
        }
        round_slice(desc.dtype, &mut data);

        let bytes = desc.byte_len();
        let mut ledger = self.ledger();
        let used = ledger.tier_bytes(desc.tier);
        if desc.tier == MemoryTier::L1 {
            if let Some(capacity) = self.l1_capacity {
                if used + bytes > capacity {
                    return Err(BackendError::OutOfMemory {
                        tier: MemoryTier::L1,
                        requested: bytes,
                        available: capacity.saturating_sub(used),
                    });
                }
            }
        }

        let id = next_handle_id();
        ledger.live.insert(id, (desc.tier, bytes));
        let total = used + bytes;
        ledger.bytes.insert(desc.tier, total);
        let peak = ledger.peak.entry(desc.tier).or_insert(0);
        *peak = (*peak).max(total);
        trace!(id, %desc, "allocated cpu tensor");

        Ok(CpuTensor { id, desc, data })
    }

    fn check_live(&self, tensor: &CpuTensor) -> BackendResult<()> {
        if self.ledger().live.contains_key(&tensor.id) {
            Ok(())
        } else {
            Err(BackendError::invalid_handle(format!(
                "tensor {} is not live on this backend",
                tensor.id
            )))
        }
    }

    /// Stages the host-resident weight and bias of a convolution in DRAM.
    ///
    /// Each host-resident operand counts as one upload and occupies DRAM in the weights dtype
    /// until [`unstage`] returns the bytes. Device-resident operands are read in place.
    ///
    /// [`unstage`]: CpuBackend::unstage
    fn stage(&self, request: &Conv2dRequest<'_, CpuTensor>, dtype: DType) -> BackendResult<usize> {
        let operands = || std::iter::once(request.weight).chain(request.bias);
        for tensor in operands() {
            self.check_live(tensor)?;
        }
        let mut staged = 0;
        for tensor in operands().filter(|tensor| !tensor.desc.tier.is_device()) {
            let bytes = tensor.desc.shape.num_elements() * dtype.size_in_bytes();
            let mut ledger = self.ledger();
            let total = ledger.tier_bytes(MemoryTier::Dram) + bytes;
            ledger.bytes.insert(MemoryTier::Dram, total);
            let peak = ledger.peak.entry(MemoryTier::Dram).or_insert(0);
            *peak = (*peak).max(total);
            ledger.weight_uploads += 1;
            staged += bytes;
        }
        if staged > 0 {
            trace!(bytes = staged, "staged conv2d weights in dram");
        }
        Ok(staged)
    }

    fn unstage(&self, bytes: usize) {
        let mut ledger = self.ledger();
        let remaining = ledger.tier_bytes(MemoryTier::Dram).saturating_sub(bytes);
        ledger.bytes.insert(MemoryTier::Dram, remaining);
    }

    fn device_copy(
        &self,
        source: &CpuTensor,
        dtype: DType,
        data: Vec<f32>,
    ) -> BackendResult<CpuTensor> {
        let desc = TensorDesc::new(
            source.desc.shape.clone(),
            dtype,
            source.desc.layout,
            MemoryTier::Dram,
        );
        self.allocate(desc, data)
    }
}

fn rounded(tensor: &CpuTensor, dtype: DType) -> Vec<f32> {
    let mut data = tensor.data.clone();
    round_slice(dtype, &mut data);
    data
}

impl Default for CpuBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl AcceleratorBackend for CpuBackend {
    type TensorHandle = CpuTensor;

    fn backend_name(&self) -> &str {
        "cpu"
    }

    fn from_host(
        &self,
        tensor: &Tensor,
        dtype: DType,
        tier: MemoryTier,
    ) -> BackendResult<Self::TensorHandle> {
        let desc = TensorDesc::new(tensor.shape().clone(), dtype, tensor.layout(), tier);
        self.allocate(desc, tensor.data().to_vec())
    }

    fn to_host(&self, tensor: &Self::TensorHandle) -> BackendResult<Tensor> {
        self.check_live(tensor)?;
        Tensor::from_vec(tensor.desc.shape.clone(), tensor.data.clone())
            .map(|host| host.with_layout(tensor.desc.layout))
            .map_err(|err| BackendError::execution(err.to_string()))
    }

    fn describe(&self, tensor: &Self::TensorHandle) -> BackendResult<TensorDesc> {
        self.check_live(tensor)?;
        Ok(tensor.desc.clone())
    }

    fn conv2d(
        &self,
        request: Conv2dRequest<'_, Self::TensorHandle>,
    ) -> BackendResult<Conv2dOutput<Self::TensorHandle>> {
        let params = request.params;
        self.check_live(request.input)?;
        let geometry = ConvGeometry::resolve(params, request.input, request.weight, request.bias)?;

        let weights_dtype = params.conv_config.weights_dtype;
        let staged = self.stage(&request, weights_dtype)?;
        let weight = rounded(request.weight, weights_dtype);
        let bias = request.bias.map(|bias| rounded(bias, weights_dtype));

        let values = conv2d_nhwc(
            &geometry,
            params,
            &request.input.data,
            &weight,
            bias.as_deref(),
        );
        let out_desc = TensorDesc::new(
            Shape::new(geometry.output_dims()),
            params.conv_config.dtype,
            Layout::RowMajor,
            MemoryTier::L1,
        );
        let output = self.allocate(out_desc, values);
        self.unstage(staged);
        let output = output?;

        let prepared = if request.return_weights_and_bias {
            let device_weight = self.device_copy(request.weight, weights_dtype, weight)?;
            let device_bias = match (request.bias, bias) {
                (Some(source), Some(values)) => {
                    Some(self.device_copy(source, weights_dtype, values)?)
                }
                _ => None,
            };
            Some(PreparedConvTensors {
                weight: device_weight,
                bias: device_bias,
            })
        } else {
            None
        };

        Ok(Conv2dOutput { output, prepared })
    }

    fn split(
        &self,
        tensor: &Self::TensorHandle,
        chunk: usize,
        axis: isize,
    ) -> BackendResult<Vec<Self::TensorHandle>> {
        self.check_live(tensor)?;
        let shape = &tensor.desc.shape;
        let axis = shape
            .resolve_axis(axis)
            .ok_or_else(|| BackendError::execution("split axis out of range"))?;
        let dims = shape.dims();
        if chunk == 0 || dims[axis] % chunk != 0 {
            return Err(BackendError::execution(format!(
                "axis {} of {} cannot be split into chunks of {}",
                axis, shape, chunk
            )));
        }

        let outer: usize = dims[..axis].iter().product();
        let inner: usize = dims[axis + 1..].iter().product();
        let src_stride = dims[axis] * inner;
        let part = chunk * inner;

        let mut parts = Vec::with_capacity(dims[axis] / chunk);
        for idx in 0..dims[axis] / chunk {
            let mut data = Vec::with_capacity(outer * part);
            for outer_idx in 0..outer {
                let start = outer_idx * src_stride + idx * part;
                data.extend_from_slice(&tensor.data[start..start + part]);
            }
            let desc = TensorDesc {
                shape: shape.with_dim(axis, chunk),
                ..tensor.desc.clone()
            };
            parts.push(self.allocate(desc, data)?);
        }
        Ok(parts)
    }

    fn concat(
        &self,
        inputs: &[&Self::TensorHandle],
        axis: isize,
    ) -> BackendResult<Self::TensorHandle> {
        let first = inputs
            .first()
            .ok_or_else(|| BackendError::execution("concat expects at least one input"))?;
        for tensor in inputs {
            self.check_live(tensor)?;
        }
        let rank = first.desc.shape.rank();
        let axis = first
            .desc
            .shape
            .resolve_axis(axis)
            .ok_or_else(|| BackendError::execution("concat axis out of range"))?;

        let mut axis_total = 0usize;
        for tensor in inputs {
            let dims = tensor.desc.shape.dims();
            if dims.len() != rank {
                return Err(BackendError::execution("concat rank mismatch"));
            }
            if tensor.desc.dtype != first.desc.dtype {
                return Err(BackendError::execution("concat requires matching dtypes"));
            }
            for (idx, (&dim, &first_dim)) in dims.iter().zip(first.desc.shape.dims()).enumerate() {
                if idx != axis && dim != first_dim {
                    return Err(BackendError::execution("concat dimension mismatch"));
                }
            }
            axis_total += dims[axis];
        }

        let out_shape = first.desc.shape.with_dim(axis, axis_total);
        let out_dims = out_shape.dims();
        let outer: usize = out_dims[..axis].iter().product();
        let inner: usize = out_dims[axis + 1..].iter().product();

        let mut data = Vec::with_capacity(out_shape.num_elements());
        for outer_idx in 0..outer {
            for tensor in inputs {
                let chunk = tensor.desc.shape.dims()[axis] * inner;
                let start = outer_idx * chunk;
                data.extend_from_slice(&tensor.data[start..start + chunk]);
            }
        }

        let desc = TensorDesc {
            shape: out_shape,
            ..first.desc.clone()
        };
        self.allocate(desc, data)
    }

    fn add_inplace(
        &self,
        acc: &mut Self::TensorHandle,
        rhs: &Self::TensorHandle,
    ) -> BackendResult<()> {
        self.check_live(acc)?;
        self.check_live(rhs)?;
        if acc.desc.shape != rhs.desc.shape {
            return Err(BackendError::execution(format!(
                "add operands differ in shape: {} vs {}",
                acc.desc.shape, rhs.desc.shape
            )));
        }
        let dtype = acc.desc.dtype;
        for (a, &b) in acc.data.iter_mut().zip(rhs.data.iter()) {
            *a = round_value(dtype, *a + b);
        }
        Ok(())
    }

    fn to_memory_tier(
        &self,
        tensor: &Self::TensorHandle,
        tier: MemoryTier,
    ) -> BackendResult<Self::TensorHandle> {
        self.check_live(tensor)?;
        let desc = TensorDesc {
            tier,
            ..tensor.desc.clone()
        };
        self.allocate(desc, tensor.data.clone())
    }

    fn deallocate(&self, tensor: Self::TensorHandle) -> BackendResult<()> {
        let mut ledger = self.ledger();
        let (tier, bytes) = ledger.live.remove(&tensor.id).ok_or_else(|| {
            BackendError::invalid_handle(format!("tensor {} released twice or foreign", tensor.id))
        })?;
        let remaining = ledger.tier_bytes(tier).saturating_sub(bytes);
        ledger.bytes.insert(tier, remaining);
        trace!(id = tensor.id, %tier, bytes, "released cpu tensor");
        Ok(())
    }
}

/// Validated convolution geometry.
struct ConvGeometry {
    batch: usize,
    in_h: usize,
    in_w: usize,
    c_in: usize,
    out_h: usize,
    out_w: usize,
    c_out: usize,
    kernel_h: usize,
    kernel_w: usize,
    groups: usize,
}

impl ConvGeometry {
    fn resolve(
        params: &Conv2dParams,
        input: &CpuTensor,
        weight: &CpuTensor,
        bias: Option<&CpuTensor>,
    ) -> BackendResult<Self> {
        params
            .validate()
            .map_err(|err| BackendError::execution(err.to_string()))?;
        let expected_input = params.input_dims();
        if input.desc.shape.dims() != expected_input {
            return Err(BackendError::execution(format!(
                "conv2d input {} does not match NHWC {:?}",
                input.desc.shape, expected_input
            )));
        }
        let expected_weight = [
            params.out_channels,
            params.in_channels / params.groups,
            params.kernel_size[0],
            params.kernel_size[1],
        ];
        if weight.desc.shape.dims() != expected_weight {
            return Err(BackendError::execution(format!(
                "conv2d weight {} does not match OIHW {:?}",
                weight.desc.shape, expected_weight
            )));
        }
        if let Some(bias) = bias {
            if bias.desc.shape.dims() != [1, 1, 1, params.out_channels] {
                return Err(BackendError::execution(format!(
                    "conv2d bias {} does not match [1, 1, 1, {}]",
                    bias.desc.shape, params.out_channels
                )));
            }
        }
        let (out_h, out_w) = params
            .output_hw()
            .map_err(|err| BackendError::execution(err.to_string()))?;

        Ok(Self {
            batch: params.batch_size,
            in_h: params.input_height,
            in_w: params.input_width,
            c_in: params.in_channels,
            out_h,
            out_w,
            c_out: params.out_channels,
            kernel_h: params.kernel_size[0],
            kernel_w: params.kernel_size[1],
            groups: params.groups,
        })
    }

    fn output_dims(&self) -> Vec<usize> {
        vec![self.batch, self.out_h, self.out_w, self.c_out]
    }
}

/// Direct NHWC x OIHW convolution.
///
/// Products accumulate in `f32`. When the destination is a reduced-precision dtype and fp32
/// destination accumulation is off, the running sum is rounded after every kernel row.
fn conv2d_nhwc(
    geometry: &ConvGeometry,
    params: &Conv2dParams,
    input: &[f32],
    weight: &[f32],
    bias: Option<&[f32]>,
) -> Vec<f32> {
    let ConvGeometry {
        batch,
        in_h,
        in_w,
        c_in,
        out_h,
        out_w,
        c_out,
        kernel_h,
        kernel_w,
        groups,
    } = *geometry;
    let c_in_g = c_in / groups;
    let c_out_g = c_out / groups;
    let [stride_h, stride_w] = params.stride;
    let [dil_h, dil_w] = params.dilation;
    let [pad_h, pad_w] = params.padding;
    let out_dtype = params.conv_config.dtype;
    let row_rounding = row_rounding_dtype(out_dtype, &params.compute_config);
    let activation = params.conv_config.activation;

    let mut out = vec![0.0f32; batch * out_h * out_w * c_out];
    for n in 0..batch {
        for oy in 0..out_h {
            for ox in 0..out_w {
                let out_base = ((n * out_h + oy) * out_w + ox) * c_out;
                for co in 0..c_out {
                    let group = co / c_out_g;
                    let mut acc = 0.0f32;
                    for ky in 0..kernel_h {
                        let iy = (oy * stride_h + ky * dil_h) as isize - pad_h as isize;
                        if iy < 0 || iy >= in_h as isize {
                            continue;
                        }
                        for kx in 0..kernel_w {
                            let ix = (ox * stride_w + kx * dil_w) as isize - pad_w as isize;
                            if ix < 0 || ix >= in_w as isize {
                                continue;
                            }
                            let in_base =
                                ((n * in_h + iy as usize) * in_w + ix as usize) * c_in
                                    + group * c_in_g;
                            for ci in 0..c_in_g {
                                let w_idx = ((co * c_in_g + ci) * kernel_h + ky) * kernel_w + kx;
                                acc += input[in_base + ci] * weight[w_idx];
                            }
                        }
                        if let Some(dtype) = row_rounding {
                            acc = round_value(dtype, acc);
                        }
                    }
                    if let Some(bias) = bias {
                        acc += bias[co];
                    }
                    if let Some(activation) = activation {
                        acc = activation.apply(acc);
                    }
                    out[out_base + co] = round_value(out_dtype, acc);
                }
            }
        }
    }
    out
}

fn row_rounding_dtype(out_dtype: DType, compute: &ComputeKernelConfig) -> Option<DType> {
    (out_dtype.is_reduced() && !compute.fp32_dest_acc_en).then_some(out_dtype)
}

fn round_value(dtype: DType, value: f32) -> f32 {
    match dtype {
        DType::F32 => value,
        DType::F16 => f16::from_f32(value).to_f32(),
        DType::BF16 => bf16::from_f32(value).to_f32(),
    }
}

fn round_slice(dtype: DType, values: &mut [f32]) {
    if dtype.is_reduced() {
        for v in values {
            *v = round_value(dtype, *v);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn upload(
        backend: &CpuBackend,
        dims: &[usize],
        data: Vec<f32>,
        tier: MemoryTier,
    ) -> CpuTensor {
        let host = Tensor::from_vec(Shape::new(dims.to_vec()), data).unwrap();
        backend.from_host(&host, DType::F32, tier).unwrap()
    }

    fn f32_conv(
        in_channels: usize,
        out_channels: usize,
        height: usize,
        width: usize,
    ) -> Conv2dParams {
        let mut params = Conv2dParams::new(in_channels, out_channels, height, width);
        params.conv_config.dtype = DType::F32;
        params.conv_config.weights_dtype = DType::F32;
        params
    }

    fn run_conv(
        backend: &CpuBackend,
        params: &Conv2dParams,
        input: &CpuTensor,
        weight: &CpuTensor,
        bias: Option<&CpuTensor>,
    ) -> CpuTensor {
        backend
            .conv2d(Conv2dRequest {
                input,
                weight,
                bias,
                params,
                device_id: 0,
                return_weights_and_bias: false,
            })
            .unwrap()
            .output
    }

    #[test]
    fn bf16_rounding_drops_low_mantissa_bits() {
        assert_eq!(round_value(DType::BF16, 1.0 + 1.0 / 512.0), 1.0);
        assert_eq!(round_value(DType::F32, 1.0 + 1.0 / 512.0), 1.0 + 1.0 / 512.0);
    }

    #[test]
    fn split_and_concat_are_inverse_on_last_axis() {
        let backend = CpuBackend::new();
        let src = upload(&backend, &[2, 4], (0..8).map(|v| v as f32).collect(), MemoryTier::Dram);
        let parts = backend.split(&src, 2, -1).unwrap();
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0].data(), &[0.0, 1.0, 4.0, 5.0]);
        assert_eq!(parts[1].data(), &[2.0, 3.0, 6.0, 7.0]);

        let refs: Vec<&CpuTensor> = parts.iter().collect();
        let joined = backend.concat(&refs, 1).unwrap();
        assert_eq!(joined.data(), src.data());
    }

    #[test]
    fn ledger_tracks_live_bytes_per_tier() {
        let backend = CpuBackend::new();
        let a = upload(&backend, &[4], vec![0.0; 4], MemoryTier::Dram);
        let b = backend.to_memory_tier(&a, MemoryTier::L1).unwrap();
        assert_eq!(backend.live_handles(), 2);
        assert_eq!(backend.live_bytes(MemoryTier::Dram), 16);
        assert_eq!(backend.live_bytes(MemoryTier::L1), 16);

        backend.deallocate(a).unwrap();
        backend.deallocate(b).unwrap();
        assert_eq!(backend.live_handles(), 0);
        assert_eq!(backend.live_bytes(MemoryTier::L1), 0);
        assert_eq!(backend.peak_bytes(MemoryTier::L1), 16);
    }

    #[test]
    fn l1_capacity_is_enforced() {
        let backend = CpuBackend::new().with_l1_capacity(8);
        let a = upload(&backend, &[4], vec![0.0; 4], MemoryTier::Dram);
        let err = backend.to_memory_tier(&a, MemoryTier::L1).err().unwrap();
        assert!(matches!(
            err,
            BackendError::OutOfMemory {
                tier: MemoryTier::L1,
                requested: 16,
                available: 8
            }
        ));
    }

    #[test]
    fn conv2d_1x1_is_a_channel_matmul() {
        let backend = CpuBackend::new();
        let mut params = Conv2dParams::new(2, 1, 1, 2).with_kernel_size(1).with_padding(0);
        params.conv_config.dtype = DType::F32;
        params.conv_config.weights_dtype = DType::F32;

        let input = upload(&backend, &[1, 1, 2, 2], vec![1.0, 2.0, 3.0, 4.0], MemoryTier::Dram);
        let weight = upload(&backend, &[1, 2, 1, 1], vec![10.0, 1.0], MemoryTier::Host);
        let bias = upload(&backend, &[1, 1, 1, 1], vec![0.5], MemoryTier::Host);

        let result = backend
            .conv2d(Conv2dRequest {
                input: &input,
                weight: &weight,
                bias: Some(&bias),
                params: &params,
                device_id: 0,
                return_weights_and_bias: true,
            })
            .unwrap();
        assert_eq!(result.output.data(), &[12.5, 34.5]);
        assert_eq!(result.output.desc().tier, MemoryTier::L1);
        assert_eq!(backend.weight_uploads(), 2);

        let prepared = result.prepared.unwrap();
        assert_eq!(prepared.weight.desc().tier, MemoryTier::Dram);
        assert!(prepared.bias.is_some());
    }

    #[test]
    fn conv2d_stride_skips_input_pixels() {
        let backend = CpuBackend::new();
        let mut params = f32_conv(1, 1, 4, 4).with_kernel_size(1).with_padding(0);
        params.stride = [2, 2];

        let pixels = (0..16).map(|v| v as f32).collect();
        let input = upload(&backend, &[1, 4, 4, 1], pixels, MemoryTier::Dram);
        let weight = upload(&backend, &[1, 1, 1, 1], vec![1.0], MemoryTier::Host);
        let output = run_conv(&backend, &params, &input, &weight, None);

        assert_eq!(output.desc().shape.dims(), &[1, 2, 2, 1]);
        assert_eq!(output.data(), &[0.0, 2.0, 8.0, 10.0]);
    }

    #[test]
    fn conv2d_dilation_spreads_the_window() {
        let backend = CpuBackend::new();
        let mut params = f32_conv(1, 1, 5, 5).with_padding(0);
        params.dilation = [2, 2];

        let pixels = (0..25).map(|v| v as f32).collect();
        let input = upload(&backend, &[1, 5, 5, 1], pixels, MemoryTier::Dram);
        let weight = upload(&backend, &[1, 1, 3, 3], vec![1.0; 9], MemoryTier::Host);
        let output = run_conv(&backend, &params, &input, &weight, None);

        // Rows and columns 0, 2 and 4 of a 5x5 ramp.
        assert_eq!(output.desc().shape.dims(), &[1, 1, 1, 1]);
        assert_eq!(output.data(), &[108.0]);
    }

    #[test]
    fn conv2d_groups_keep_channels_apart() {
        let backend = CpuBackend::new();
        let mut params = f32_conv(2, 2, 1, 1).with_kernel_size(1).with_padding(0);
        params.groups = 2;

        let input = upload(&backend, &[1, 1, 1, 2], vec![2.0, 7.0], MemoryTier::Dram);
        let weight = upload(&backend, &[2, 1, 1, 1], vec![3.0, 5.0], MemoryTier::Host);
        let bias = upload(&backend, &[1, 1, 1, 2], vec![0.5, -1.0], MemoryTier::Host);
        let output = run_conv(&backend, &params, &input, &weight, Some(&bias));

        assert_eq!(output.data(), &[6.5, 34.0]);
    }

    #[test]
    fn conv2d_stages_host_weights_in_dram_for_the_call() {
        let backend = CpuBackend::new();
        let params = f32_conv(2, 1, 1, 2).with_kernel_size(1).with_padding(0);
        let input = upload(&backend, &[1, 1, 2, 2], vec![1.0; 4], MemoryTier::Dram);
        let weight = upload(&backend, &[1, 2, 1, 1], vec![1.0, 1.0], MemoryTier::Host);
        let bias = upload(&backend, &[1, 1, 1, 1], vec![0.0], MemoryTier::Host);
        backend.reset_peaks();

        let output = run_conv(&backend, &params, &input, &weight, Some(&bias));
        // 16 input bytes plus 8 weight and 4 bias bytes while the convolution runs.
        assert_eq!(backend.peak_bytes(MemoryTier::Dram), 28);
        assert_eq!(backend.live_bytes(MemoryTier::Dram), 16);
        assert_eq!(backend.weight_uploads(), 2);

        let resident = backend.to_memory_tier(&weight, MemoryTier::Dram).unwrap();
        backend.reset_peaks();
        backend.deallocate(output).unwrap();
        let output = run_conv(&backend, &params, &input, &resident, None);
        assert_eq!(backend.peak_bytes(MemoryTier::Dram), 24);
        assert_eq!(backend.weight_uploads(), 2);
        backend.deallocate(output).unwrap();
    }

    #[test]
    fn releasing_unknown_handle_fails() {
        let owner = CpuBackend::new();
        let other = CpuBackend::new();
        let tensor = upload(&owner, &[1], vec![1.0], MemoryTier::Dram);
        assert!(matches!(
            other.deallocate(tensor),
            Err(BackendError::InvalidHandle { .. })
        ));
    }
}

use std::sync::Arc;

use tracing::{debug_span, trace};

use super::{
    SplitConvError, SplitConvOutput, SplitConvResult, SplitFactors, SplitWeights, CHANNEL_AXIS,
};
use crate::backend::{AcceleratorBackend, BackendError, Conv2dRequest, DeviceContext};
use crate::config::Conv2dParams;
use crate::layout::{Layout, MemoryTier};
use crate::tensor::DeviceTensor;

/// Runs one logical convolution as `factors.input * factors.output` slice convolutions.
///
/// `input` is an NHWC row-major tensor of shape `params.input_dims()` and is consumed: when
/// it is split its storage is released right after the split, otherwise it serves as the only
/// input slice and is released once every convolution has run.
///
/// For each output slice the partial results of all input slices are summed into an
/// accumulator held in DRAM; output slices are then concatenated along the channel axis. The
/// bias of an output slice is passed with its first input slice only, not with every input
/// slice, which would add it once per input slice. Only dense unit-stride windows can be
/// sliced: a stride, dilation or group count other than 1 is a [`SplitConvError::Config`].
/// With `cache_weights` the backend also hands back the device-resident weights (one per slice
/// pair) and biases (one per output slice), returned in [`SplitConvOutput::cached`] for reuse.
pub fn split_conv_and_run<B: AcceleratorBackend + 'static>(
    ctx: &DeviceContext<B>,
    input: DeviceTensor<B>,
    weights: &SplitWeights<B>,
    params: &Conv2dParams,
    factors: SplitFactors,
    cache_weights: bool,
) -> SplitConvResult<SplitConvOutput<B>> {
    let desc = input.desc()?;
    if desc.layout != Layout::RowMajor {
        return Err(SplitConvError::Layout {
            expected: Layout::RowMajor,
            found: desc.layout,
        });
    }

    let (split_in, _) = factors.slice_channels(params.in_channels, params.out_channels)?;
    params
        .validate()
        .map_err(|err| SplitConvError::Config(err.to_string()))?;
    let slice_params = params
        .for_slice(factors)
        .map_err(|err| SplitConvError::Config(err.to_string()))?;
    if factors.input > 1 && params.conv_config.activation.is_some() {
        return Err(SplitConvError::Config(
            "a fused activation cannot be applied to partial sums over input slices".into(),
        ));
    }
    if params.compute_config.fp32_dest_acc_en && !ctx.arch().supports_fp32_dest_acc() {
        return Err(SplitConvError::Config(format!(
            "{} cannot accumulate in fp32 destination registers",
            ctx.arch()
        )));
    }
    if desc.shape.dims() != params.input_dims() {
        return Err(SplitConvError::shape(format!(
            "input {} does not match expected NHWC {:?}",
            desc.shape,
            params.input_dims()
        )));
    }
    validate_grid(weights, factors)?;

    let backend = Arc::clone(ctx.backend());
    let _span = debug_span!(
        "split_conv",
        backend = backend.backend_name(),
        arch = %ctx.arch(),
        in_split = factors.input,
        out_split = factors.output,
        cache_weights
    )
    .entered();

    let input_slices = if factors.input > 1 {
        let slices: Vec<DeviceTensor<B>> = backend
            .split(input.handle(), split_in, CHANNEL_AXIS as isize)?
            .into_iter()
            .map(|handle| DeviceTensor::from_handle(Arc::clone(&backend), handle))
            .collect();
        input.release()?;
        slices
    } else {
        vec![input]
    };

    let mut outputs = Vec::with_capacity(factors.output);
    let mut cached_weights = Vec::new();
    let mut cached_bias = Vec::new();

    for out_slice in 0..factors.output {
        let bias = weights
            .bias(out_slice)
            .ok_or_else(|| SplitConvError::shape(format!("missing bias slice {out_slice}")))?;
        let mut accumulator: Option<DeviceTensor<B>> = None;
        let mut weight_row = Vec::new();

        for (in_slice, input_slice) in input_slices.iter().enumerate() {
            let weight = weights.weight(out_slice, in_slice).ok_or_else(|| {
                SplitConvError::shape(format!("missing weight slice [{out_slice}][{in_slice}]"))
            })?;
            let result = backend.conv2d(Conv2dRequest {
                input: input_slice.handle(),
                weight: weight.handle(),
                // Added once per output slice; later input slices only contribute partial sums.
                bias: (in_slice == 0).then(|| bias.handle()),
                params: &slice_params,
                device_id: ctx.device_id(),
                return_weights_and_bias: cache_weights,
            })?;
            let partial = DeviceTensor::from_handle(Arc::clone(&backend), result.output);

            if cache_weights {
                let prepared = result.prepared.ok_or_else(|| {
                    BackendError::execution("conv2d did not return prepared weights and bias")
                })?;
                weight_row.push(DeviceTensor::from_handle(
                    Arc::clone(&backend),
                    prepared.weight,
                ));
                if let Some(handle) = prepared.bias {
                    cached_bias.push(DeviceTensor::from_handle(Arc::clone(&backend), handle));
                }
            }

            accumulator = Some(match accumulator {
                None => {
                    let acc = partial.to_memory_tier(MemoryTier::Dram)?;
                    partial.release()?;
                    acc
                }
                Some(mut acc) => {
                    backend.add_inplace(acc.handle_mut(), partial.handle())?;
                    partial.release()?;
                    acc
                }
            });
            trace!(out_slice, in_slice, "accumulated slice convolution");
        }

        let acc = accumulator
            .ok_or_else(|| SplitConvError::shape("split convolution has no input slices"))?;
        outputs.push(acc.into_memory_tier(MemoryTier::Dram)?);
        if cache_weights {
            cached_weights.push(weight_row);
        }
    }

    for slice in input_slices {
        slice.release()?;
    }

    let output = if outputs.len() > 1 {
        let handle = {
            let parts: Vec<&B::TensorHandle> = outputs.iter().map(DeviceTensor::handle).collect();
            backend.concat(&parts, CHANNEL_AXIS as isize)?
        };
        let output = DeviceTensor::from_handle(Arc::clone(&backend), handle);
        for slice in outputs {
            slice.release()?;
        }
        output
    } else {
        outputs
            .pop()
            .ok_or_else(|| SplitConvError::shape("split convolution produced no output slices"))?
    };

    let cached = cache_weights.then(|| SplitWeights::new(cached_weights, cached_bias));
    Ok(SplitConvOutput { output, cached })
}

fn validate_grid<B: AcceleratorBackend + 'static>(
    weights: &SplitWeights<B>,
    factors: SplitFactors,
) -> SplitConvResult<()> {
    if weights.out_slices() != factors.output || weights.in_slices() != Some(factors.input) {
        return Err(SplitConvError::shape(format!(
            "weight grid is {}x{:?}, expected {}x{}",
            weights.out_slices(),
            weights.in_slices(),
            factors.output,
            factors.input
        )));
    }
    if weights.bias_len() != factors.output {
        return Err(SplitConvError::shape(format!(
            "bias holds {} slices, expected one per output slice ({})",
            weights.bias_len(),
            factors.output
        )));
    }
    Ok(())
}

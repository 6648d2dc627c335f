use tracing::debug;

use super::{SplitConvError, SplitConvResult, SplitFactors, SplitWeights, CHANNEL_AXIS};
use crate::backend::{AcceleratorBackend, DeviceContext};
use crate::layout::MemoryTier;
use crate::tensor::{DType, DeviceTensor, Tensor};

/// Precision the weight and bias slices are handed to the backend in. The convolution itself
/// converts them to `Conv2dConfig::weights_dtype` when it first moves them onto the device.
const SLICE_DTYPE: DType = DType::F32;

/// Cuts a full OIHW `weight` and `[1, 1, 1, C_out]` `bias` into split-convolution slices.
///
/// The weight is cut along axis 0 into `factors.output` blocks, and each block along axis 1
/// into `factors.input` pieces. The bias is cut along its channel axis only when
/// `factors.input > 1`; otherwise the whole bias is the single entry, even for
/// `factors.output > 1`. Slices stay in host memory until their first convolution. The source
/// tensors are left untouched.
pub fn prepare_split_weights<B: AcceleratorBackend + 'static>(
    ctx: &DeviceContext<B>,
    in_channels: usize,
    out_channels: usize,
    factors: SplitFactors,
    weight: &Tensor,
    bias: &Tensor,
) -> SplitConvResult<SplitWeights<B>> {
    let (split_in, split_out) = factors.slice_channels(in_channels, out_channels)?;
    validate_weight_bias(in_channels, out_channels, weight, bias)?;

    let blocks = if factors.output > 1 {
        host_split(weight, 0, split_out)?
    } else {
        vec![weight.clone()]
    };

    let mut grid = Vec::with_capacity(blocks.len());
    for block in &blocks {
        let row = host_split(block, 1, split_in)?
            .iter()
            .map(|piece| upload(ctx, piece))
            .collect::<SplitConvResult<Vec<_>>>()?;
        grid.push(row);
    }

    // TODO: gate on factors.output once the bias_split_follows_input_factor test settles
    // whether the input-factor predicate is intended.
    let bias_pieces = if factors.input > 1 {
        host_split(bias, CHANNEL_AXIS, split_out)?
    } else {
        vec![bias.clone()]
    };
    let bias = bias_pieces
        .iter()
        .map(|piece| upload(ctx, piece))
        .collect::<SplitConvResult<Vec<_>>>()?;

    debug!(
        in_split = factors.input,
        out_split = factors.output,
        weight_slices = grid.iter().map(Vec::len).sum::<usize>(),
        bias_slices = bias.len(),
        "prepared split convolution weights"
    );

    Ok(SplitWeights::new(grid, bias))
}

fn validate_weight_bias(
    in_channels: usize,
    out_channels: usize,
    weight: &Tensor,
    bias: &Tensor,
) -> SplitConvResult<()> {
    let w = weight.shape().dims();
    if w.len() != 4 {
        return Err(SplitConvError::shape(format!(
            "weight must be OIHW [C_out, C_in, KH, KW], got {:?}",
            w
        )));
    }
    if w[0] != out_channels || w[1] != in_channels {
        return Err(SplitConvError::shape(format!(
            "weight {:?} does not match in_channels={} out_channels={}",
            w, in_channels, out_channels
        )));
    }

    let b = bias.shape().dims();
    if b.len() != 4 || b[..CHANNEL_AXIS].iter().any(|&d| d != 1) {
        return Err(SplitConvError::shape(format!(
            "bias must be [1, 1, 1, C_out], got {:?}",
            b
        )));
    }
    if b[CHANNEL_AXIS] != w[0] {
        return Err(SplitConvError::shape(format!(
            "bias has {} channels but weight has {} output channels",
            b[CHANNEL_AXIS], w[0]
        )));
    }
    Ok(())
}

fn host_split(tensor: &Tensor, axis: usize, chunk: usize) -> SplitConvResult<Vec<Tensor>> {
    tensor
        .split(axis, chunk)
        .map_err(|err| SplitConvError::shape(err.to_string()))
}

fn upload<B: AcceleratorBackend + 'static>(
    ctx: &DeviceContext<B>,
    tensor: &Tensor,
) -> SplitConvResult<DeviceTensor<B>> {
    Ok(ctx.upload(tensor, SLICE_DTYPE, MemoryTier::Host)?)
}

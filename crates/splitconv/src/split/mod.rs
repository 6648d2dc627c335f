//! Split convolution: one logical convolution run as a grid of channel-slice convolutions.
//!
//! [`prepare_split_weights`] cuts the weight into a `[out_slice][in_slice]` grid and the bias
//! into per-output-slice pieces. [`split_conv_and_run`] then convolves every
//! `(out_slice, in_slice)` pair, sums partial results over input slices in a DRAM accumulator
//! and concatenates output slices along the channel axis. [`SplitConvExecutor`] ties both
//! together for a layer that runs many forward passes.

mod driver;
mod error;
mod executor;
mod prepare;

use serde::{Deserialize, Serialize};

use crate::backend::{AcceleratorBackend, BackendResult};
use crate::tensor::DeviceTensor;

pub use driver::split_conv_and_run;
pub use error::{SplitConvError, SplitConvResult};
pub use executor::SplitConvExecutor;
pub use prepare::prepare_split_weights;

/// Channel axis of NHWC activations and of the `[1, 1, 1, C_out]` bias.
pub const CHANNEL_AXIS: usize = 3;

/// Number of equal partitions of the input and output channel dimensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(default)]
pub struct SplitFactors {
    pub input: usize,
    pub output: usize,
}

impl Default for SplitFactors {
    fn default() -> Self {
        Self::unsplit()
    }
}

impl SplitFactors {
    pub fn new(input: usize, output: usize) -> Self {
        Self { input, output }
    }

    pub fn unsplit() -> Self {
        Self::new(1, 1)
    }

    /// Number of slice convolutions one forward pass issues.
    pub fn num_slices(self) -> usize {
        self.input * self.output
    }

    /// Per-slice `(in_channels, out_channels)`, or `ShapeMismatch` when a factor is zero or
    /// does not divide its channel count.
    pub fn slice_channels(
        self,
        in_channels: usize,
        out_channels: usize,
    ) -> SplitConvResult<(usize, usize)> {
        if self.input == 0 || self.output == 0 {
            return Err(SplitConvError::shape(format!(
                "split factors must be positive (got input={}, output={})",
                self.input, self.output
            )));
        }
        if in_channels % self.input != 0 {
            return Err(SplitConvError::shape(format!(
                "in_channels {} is not divisible by input split factor {}",
                in_channels, self.input
            )));
        }
        if out_channels % self.output != 0 {
            return Err(SplitConvError::shape(format!(
                "out_channels {} is not divisible by output split factor {}",
                out_channels, self.output
            )));
        }
        Ok((in_channels / self.input, out_channels / self.output))
    }
}

/// Weight grid `[out_slice][in_slice]` and per-output-slice bias tensors.
pub struct SplitWeights<B: AcceleratorBackend + 'static> {
    weights: Vec<Vec<DeviceTensor<B>>>,
    bias: Vec<DeviceTensor<B>>,
}

impl<B: AcceleratorBackend + 'static> SplitWeights<B> {
    pub fn new(weights: Vec<Vec<DeviceTensor<B>>>, bias: Vec<DeviceTensor<B>>) -> Self {
        Self { weights, bias }
    }

    pub fn weight(&self, out_slice: usize, in_slice: usize) -> Option<&DeviceTensor<B>> {
        self.weights.get(out_slice)?.get(in_slice)
    }

    pub fn bias(&self, out_slice: usize) -> Option<&DeviceTensor<B>> {
        self.bias.get(out_slice)
    }

    pub fn out_slices(&self) -> usize {
        self.weights.len()
    }

    /// Width of each weight-grid row; `None` when the rows disagree.
    pub fn in_slices(&self) -> Option<usize> {
        let first = self.weights.first().map_or(0, Vec::len);
        self.weights
            .iter()
            .all(|row| row.len() == first)
            .then_some(first)
    }

    pub fn bias_len(&self) -> usize {
        self.bias.len()
    }

    /// Whether every weight and bias tensor already lives in device memory.
    pub fn is_device_resident(&self) -> BackendResult<bool> {
        for tensor in self.weights.iter().flatten().chain(self.bias.iter()) {
            if !tensor.tier()?.is_device() {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Releases every tensor, reporting the first failure after attempting all of them.
    pub fn release(self) -> BackendResult<()> {
        let mut first_err = None;
        for tensor in self.weights.into_iter().flatten().chain(self.bias) {
            if let Err(err) = tensor.release() {
                first_err.get_or_insert(err);
            }
        }
        first_err.map_or(Ok(()), Err)
    }
}

/// Result of [`split_conv_and_run`].
pub struct SplitConvOutput<B: AcceleratorBackend + 'static> {
    pub output: DeviceTensor<B>,
    /// Device-resident weights and bias, present when caching was requested.
    pub cached: Option<SplitWeights<B>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slice_channels_divides_both_axes() {
        let factors = SplitFactors::new(2, 4);
        assert_eq!(factors.slice_channels(512, 256).unwrap(), (256, 64));
        assert_eq!(factors.num_slices(), 8);
    }

    #[test]
    fn indivisible_input_channels_are_a_shape_mismatch() {
        let err = SplitFactors::new(3, 1).slice_channels(8, 8).unwrap_err();
        assert!(matches!(err, SplitConvError::ShapeMismatch(_)));
        assert!(err.to_string().contains("in_channels 8"));
    }

    #[test]
    fn zero_factor_is_rejected() {
        let err = SplitFactors::new(1, 0).slice_channels(8, 8).unwrap_err();
        assert!(matches!(err, SplitConvError::ShapeMismatch(_)));
    }

    #[test]
    fn factors_default_to_unsplit() {
        let factors: SplitFactors = serde_json::from_str(r#"{ "output": 2 }"#).unwrap();
        assert_eq!(factors, SplitFactors::new(1, 2));
    }
}

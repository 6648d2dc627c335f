use std::mem;

use tracing::debug;

use super::{
    prepare_split_weights, split_conv_and_run, SplitConvError, SplitConvResult, SplitWeights,
};
use crate::backend::{AcceleratorBackend, DeviceContext};
use crate::config::SplitConvConfig;
use crate::tensor::{DeviceTensor, Tensor};

/// One convolution layer executed with channel splitting.
///
/// Weights are sliced once at construction. When the config asks for weight caching, the first
/// forward pass swaps the host-resident slices for the device-resident ones the backend
/// produced, and later passes reuse them without another host-to-device transfer.
pub struct SplitConvExecutor<B: AcceleratorBackend + 'static> {
    ctx: DeviceContext<B>,
    config: SplitConvConfig,
    weights: SplitWeights<B>,
    cached: bool,
}

impl<B: AcceleratorBackend + 'static> SplitConvExecutor<B> {
    pub fn new(
        ctx: DeviceContext<B>,
        config: SplitConvConfig,
        weight: &Tensor,
        bias: &Tensor,
    ) -> SplitConvResult<Self> {
        config
            .factors
            .slice_channels(config.params.in_channels, config.params.out_channels)?;
        let config_err = |err: anyhow::Error| SplitConvError::Config(err.to_string());
        config.params.validate().map_err(config_err)?;
        config.params.for_slice(config.factors).map_err(config_err)?;
        let weights = prepare_split_weights(
            &ctx,
            config.params.in_channels,
            config.params.out_channels,
            config.factors,
            weight,
            bias,
        )?;
        Ok(Self {
            ctx,
            config,
            weights,
            cached: false,
        })
    }

    pub fn config(&self) -> &SplitConvConfig {
        &self.config
    }

    pub fn weights(&self) -> &SplitWeights<B> {
        &self.weights
    }

    /// Whether the weights in use are the device-resident copies from an earlier pass.
    pub fn is_cached(&self) -> bool {
        self.cached
    }

    /// Runs the split convolution over `input`, consuming it.
    pub fn forward(&mut self, input: DeviceTensor<B>) -> SplitConvResult<DeviceTensor<B>> {
        let request_cache = self.config.cache_weights && !self.cached;
        let result = split_conv_and_run(
            &self.ctx,
            input,
            &self.weights,
            &self.config.params,
            self.config.factors,
            request_cache,
        )?;

        if let Some(device_weights) = result.cached {
            let host_weights = mem::replace(&mut self.weights, device_weights);
            self.cached = true;
            host_weights.release()?;
            debug!(
                backend = self.ctx.backend().backend_name(),
                "switched split convolution to device-resident weights"
            );
        }

        Ok(result.output)
    }
}

//! Explicit convolution configuration.
//!
//! Every knob the convolution primitive understands is a named field with a default, so a
//! layer's settings can be written down in JSON and validated before anything touches the
//! device.

use anyhow::{ensure, Result};
use serde::{Deserialize, Serialize};

use crate::backend::Arch;
use crate::split::SplitFactors;
use crate::tensor::DType;

/// Fused activation applied to a convolution's output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Activation {
    Relu,
    Silu,
}

impl Activation {
    pub fn apply(self, x: f32) -> f32 {
        match self {
            Activation::Relu => x.max(0.0),
            Activation::Silu => x / (1.0 + (-x).exp()),
        }
    }
}

/// Number of passes the math engine spends per multiply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MathFidelity {
    LoFi,
    HiFi2,
    HiFi3,
    HiFi4,
}

/// Output/weight precision and fused activation of a convolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Conv2dConfig {
    pub dtype: DType,
    pub weights_dtype: DType,
    pub activation: Option<Activation>,
}

impl Default for Conv2dConfig {
    fn default() -> Self {
        Self {
            dtype: DType::BF16,
            weights_dtype: DType::BF16,
            activation: None,
        }
    }
}

/// Numeric-precision and scheduling options for a compute kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ComputeKernelConfig {
    pub math_fidelity: MathFidelity,
    pub math_approx_mode: bool,
    pub fp32_dest_acc_en: bool,
    pub packer_l1_acc: bool,
}

impl Default for ComputeKernelConfig {
    fn default() -> Self {
        Self {
            math_fidelity: MathFidelity::LoFi,
            math_approx_mode: true,
            fp32_dest_acc_en: false,
            packer_l1_acc: false,
        }
    }
}

impl ComputeKernelConfig {
    /// Builds a config for `arch`, dropping options the architecture cannot honour.
    pub fn for_arch(
        arch: Arch,
        math_fidelity: MathFidelity,
        math_approx_mode: bool,
        fp32_dest_acc_en: bool,
        packer_l1_acc: bool,
    ) -> Self {
        let fp32 = arch.supports_fp32_dest_acc();
        Self {
            math_fidelity,
            math_approx_mode,
            fp32_dest_acc_en: fp32_dest_acc_en && fp32,
            packer_l1_acc: packer_l1_acc && fp32,
        }
    }
}

fn default_batch_size() -> usize {
    1
}

fn default_kernel_size() -> [usize; 2] {
    [3, 3]
}

fn default_unit_pair() -> [usize; 2] {
    [1, 1]
}

fn default_groups() -> usize {
    1
}

/// Full parameter set of one convolution invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conv2dParams {
    pub in_channels: usize,
    pub out_channels: usize,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    pub input_height: usize,
    pub input_width: usize,
    #[serde(default = "default_kernel_size")]
    pub kernel_size: [usize; 2],
    #[serde(default = "default_unit_pair")]
    pub stride: [usize; 2],
    #[serde(default = "default_unit_pair")]
    pub padding: [usize; 2],
    #[serde(default = "default_unit_pair")]
    pub dilation: [usize; 2],
    #[serde(default = "default_groups")]
    pub groups: usize,
    #[serde(default)]
    pub conv_config: Conv2dConfig,
    #[serde(default)]
    pub compute_config: ComputeKernelConfig,
}

impl Conv2dParams {
    /// 3x3, stride 1, padding 1 convolution over a single image.
    pub fn new(
        in_channels: usize,
        out_channels: usize,
        input_height: usize,
        input_width: usize,
    ) -> Self {
        Self {
            in_channels,
            out_channels,
            batch_size: default_batch_size(),
            input_height,
            input_width,
            kernel_size: default_kernel_size(),
            stride: default_unit_pair(),
            padding: default_unit_pair(),
            dilation: default_unit_pair(),
            groups: default_groups(),
            conv_config: Conv2dConfig::default(),
            compute_config: ComputeKernelConfig::default(),
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Square kernel of side `kernel_size`.
    pub fn with_kernel_size(mut self, kernel_size: usize) -> Self {
        self.kernel_size = [kernel_size, kernel_size];
        self
    }

    /// Symmetric padding of `padding` on every spatial edge.
    pub fn with_padding(mut self, padding: usize) -> Self {
        self.padding = [padding, padding];
        self
    }

    pub fn with_conv_config(mut self, conv_config: Conv2dConfig) -> Self {
        self.conv_config = conv_config;
        self
    }

    pub fn with_compute_config(mut self, compute_config: ComputeKernelConfig) -> Self {
        self.compute_config = compute_config;
        self
    }

    /// Expected NHWC input dims.
    pub fn input_dims(&self) -> [usize; 4] {
        [
            self.batch_size,
            self.input_height,
            self.input_width,
            self.in_channels,
        ]
    }

    /// Spatial output size `(out_h, out_w)`.
    pub fn output_hw(&self) -> Result<(usize, usize)> {
        let out_h = conv2d_out_dim(
            self.input_height,
            self.kernel_size[0],
            self.stride[0],
            self.dilation[0],
            self.padding[0],
        )?;
        let out_w = conv2d_out_dim(
            self.input_width,
            self.kernel_size[1],
            self.stride[1],
            self.dilation[1],
            self.padding[1],
        )?;
        Ok((out_h, out_w))
    }

    /// Expected NHWC output dims.
    pub fn output_dims(&self) -> Result<[usize; 4]> {
        let (out_h, out_w) = self.output_hw()?;
        Ok([self.batch_size, out_h, out_w, self.out_channels])
    }

    /// Parameters of a single slice convolution.
    ///
    /// Channel counts shrink by the split factors. Slices only cover dense unit-stride
    /// windows, so any other stride, dilation or group count is an error.
    pub fn for_slice(&self, factors: SplitFactors) -> Result<Conv2dParams> {
        ensure!(
            self.stride == [1, 1],
            "split convolution runs with stride [1, 1], got {:?}",
            self.stride
        );
        ensure!(
            self.dilation == [1, 1],
            "split convolution runs with dilation [1, 1], got {:?}",
            self.dilation
        );
        ensure!(
            self.groups == 1,
            "split convolution runs with groups 1, got {}",
            self.groups
        );
        let (in_channels, out_channels) =
            factors.slice_channels(self.in_channels, self.out_channels)?;
        Ok(Conv2dParams {
            in_channels,
            out_channels,
            ..self.clone()
        })
    }

    /// Checks internal consistency of the parameters.
    pub fn validate(&self) -> Result<()> {
        ensure!(
            self.in_channels > 0 && self.out_channels > 0,
            "conv2d channel counts must be > 0 (got in={}, out={})",
            self.in_channels,
            self.out_channels
        );
        ensure!(self.batch_size > 0, "conv2d batch size must be > 0");
        ensure!(self.groups > 0, "conv2d groups must be > 0");
        ensure!(
            self.in_channels % self.groups == 0 && self.out_channels % self.groups == 0,
            "conv2d channels ({}, {}) must be divisible by groups {}",
            self.in_channels,
            self.out_channels,
            self.groups
        );
        self.output_hw()?;
        Ok(())
    }
}

fn conv2d_out_dim(
    input: usize,
    window: usize,
    stride: usize,
    dilation: usize,
    pad: usize,
) -> Result<usize> {
    ensure!(window > 0, "conv2d window must be > 0");
    ensure!(stride > 0, "conv2d stride must be > 0");
    ensure!(dilation > 0, "conv2d dilation must be > 0");
    let effective = (window - 1)
        .checked_mul(dilation)
        .and_then(|v| v.checked_add(1))
        .ok_or_else(|| anyhow::anyhow!("conv2d effective window overflow"))?;
    let padded = pad
        .checked_mul(2)
        .and_then(|p| input.checked_add(p))
        .ok_or_else(|| anyhow::anyhow!("conv2d padded dimension overflow"))?;
    ensure!(
        padded >= effective,
        "conv2d window ({}) exceeds padded input ({})",
        effective,
        padded
    );
    Ok((padded - effective) / stride + 1)
}

/// Settings of one split-convolution layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SplitConvConfig {
    #[serde(default)]
    pub factors: SplitFactors,
    pub params: Conv2dParams,
    /// Keep the device-resident weights the first forward pass produces.
    #[serde(default)]
    pub cache_weights: bool,
}

impl SplitConvConfig {
    pub fn new(params: Conv2dParams, factors: SplitFactors) -> Self {
        Self {
            factors,
            params,
            cache_weights: false,
        }
    }

    pub fn with_cache_weights(mut self, cache_weights: bool) -> Self {
        self.cache_weights = cache_weights;
        self
    }

    pub fn from_json_str(src: &str) -> serde_json::Result<Self> {
        serde_json::from_str(src)
    }

    pub fn to_json_string(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_reference_layer_settings() {
        let conv = Conv2dConfig::default();
        assert_eq!(conv.dtype, DType::BF16);
        assert_eq!(conv.weights_dtype, DType::BF16);
        assert_eq!(conv.activation, None);

        let compute = ComputeKernelConfig::default();
        assert_eq!(compute.math_fidelity, MathFidelity::LoFi);
        assert!(compute.math_approx_mode);
        assert!(!compute.fp32_dest_acc_en);
        assert!(!compute.packer_l1_acc);
    }

    #[test]
    fn grayskull_drops_fp32_accumulation() {
        let gs =
            ComputeKernelConfig::for_arch(Arch::Grayskull, MathFidelity::HiFi4, false, true, true);
        assert!(!gs.fp32_dest_acc_en);
        assert!(!gs.packer_l1_acc);

        let wh =
            ComputeKernelConfig::for_arch(Arch::WormholeB0, MathFidelity::HiFi4, false, true, true);
        assert!(wh.fp32_dest_acc_en);
        assert!(wh.packer_l1_acc);
    }

    #[test]
    fn output_dims_keep_spatial_size_for_same_padding() {
        let params = Conv2dParams::new(8, 16, 16, 12).with_batch_size(2);
        assert_eq!(params.output_dims().unwrap(), [2, 16, 12, 16]);
    }

    #[test]
    fn oversized_kernel_is_rejected() {
        let params = Conv2dParams::new(4, 4, 2, 2)
            .with_kernel_size(5)
            .with_padding(0);
        assert!(params.validate().is_err());
    }

    #[test]
    fn huge_padding_is_an_error_not_a_panic() {
        let mut params = Conv2dParams::new(4, 4, 2, 2);
        params.padding = [usize::MAX / 2 + 1, 1];
        assert!(params.validate().is_err());

        let json = format!(
            r#"{{ "params": {{ "in_channels": 4, "out_channels": 4, "input_height": 2,
                "input_width": 2, "padding": [{}, 1] }} }}"#,
            usize::MAX / 2 + 1
        );
        let cfg = SplitConvConfig::from_json_str(&json).unwrap();
        assert!(cfg.params.validate().is_err());
    }

    #[test]
    fn slice_params_divide_channels() {
        let params = Conv2dParams::new(8, 12, 4, 4);
        let slice = params.for_slice(SplitFactors::new(2, 3)).unwrap();
        assert_eq!(slice.in_channels, 4);
        assert_eq!(slice.out_channels, 4);
        assert_eq!(slice.kernel_size, params.kernel_size);
        assert_eq!(slice.padding, params.padding);
    }

    #[test]
    fn slice_params_reject_non_dense_windows() {
        let factors = SplitFactors::new(2, 2);

        let mut strided = Conv2dParams::new(8, 8, 4, 4);
        strided.stride = [2, 2];
        assert!(strided.validate().is_ok());
        assert!(strided.for_slice(factors).is_err());

        let mut dilated = Conv2dParams::new(8, 8, 8, 8);
        dilated.dilation = [1, 2];
        assert!(dilated.for_slice(factors).is_err());

        let mut grouped = Conv2dParams::new(8, 8, 4, 4);
        grouped.groups = 2;
        assert!(grouped.validate().is_ok());
        assert!(grouped.for_slice(factors).is_err());
    }

    #[test]
    fn json_fills_in_defaults() {
        let cfg = SplitConvConfig::from_json_str(
            r#"{
                "factors": { "input": 2, "output": 4 },
                "params": { "in_channels": 512, "out_channels": 512, "input_height": 64, "input_width": 64 },
                "cache_weights": true
            }"#,
        )
        .unwrap();
        assert_eq!(cfg.factors, SplitFactors::new(2, 4));
        assert!(cfg.cache_weights);
        assert_eq!(cfg.params.kernel_size, [3, 3]);
        assert_eq!(cfg.params.padding, [1, 1]);
        assert_eq!(cfg.params.batch_size, 1);
        assert_eq!(cfg.params.conv_config, Conv2dConfig::default());

        let reparsed = SplitConvConfig::from_json_str(&cfg.to_json_string().unwrap()).unwrap();
        assert_eq!(reparsed, cfg);
    }

    #[test]
    fn json_accepts_explicit_activation_and_dtype() {
        let cfg: Conv2dConfig =
            serde_json::from_str(r#"{ "dtype": "f32", "activation": "relu" }"#).unwrap();
        assert_eq!(cfg.dtype, DType::F32);
        assert_eq!(cfg.weights_dtype, DType::BF16);
        assert_eq!(cfg.activation, Some(Activation::Relu));
    }
}

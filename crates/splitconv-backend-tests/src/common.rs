use rand::rngs::StdRng;
use rand::SeedableRng;

use splitconv::{
    prepare_split_weights, split_conv_and_run, AcceleratorBackend, ComputeKernelConfig,
    Conv2dConfig, Conv2dParams, DType, DeviceContext, DeviceTensor, MemoryTier, Shape,
    SplitFactors, Tensor,
};

/// Tolerances for full-precision (`f32`) outputs.
pub const ATOL: f32 = 5e-4;
pub const RTOL: f32 = 1e-4;

/// Tolerances for `bf16` outputs, whose 8-bit mantissa is rounded per partial sum.
pub const BF16_ATOL: f32 = 1e-1;
pub const BF16_RTOL: f32 = 2e-2;

/// Convolution parameters computing entirely in `f32` with fp32 destination accumulation.
pub fn f32_params(
    in_channels: usize,
    out_channels: usize,
    height: usize,
    width: usize,
) -> Conv2dParams {
    Conv2dParams::new(in_channels, out_channels, height, width)
        .with_conv_config(Conv2dConfig {
            dtype: DType::F32,
            weights_dtype: DType::F32,
            activation: None,
        })
        .with_compute_config(ComputeKernelConfig {
            fp32_dest_acc_en: true,
            ..ComputeKernelConfig::default()
        })
}

/// Host-side input, weight and bias for one convolution.
pub struct ConvProblem {
    pub params: Conv2dParams,
    pub input: Tensor,
    pub weight: Tensor,
    pub bias: Tensor,
}

impl ConvProblem {
    pub fn random(params: Conv2dParams, seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let input = Tensor::randn(Shape::new(params.input_dims()), 1.0, &mut rng);
        let weight = Tensor::randn(
            Shape::new([
                params.out_channels,
                params.in_channels / params.groups,
                params.kernel_size[0],
                params.kernel_size[1],
            ]),
            0.1,
            &mut rng,
        );
        let bias = Tensor::randn(Shape::new([1, 1, 1, params.out_channels]), 0.5, &mut rng);
        Self {
            params,
            input,
            weight,
            bias,
        }
    }

    /// Uploads the input in the output dtype, DRAM resident, row-major.
    pub fn upload_input<B: AcceleratorBackend + 'static>(
        &self,
        ctx: &DeviceContext<B>,
    ) -> DeviceTensor<B> {
        ctx.upload(&self.input, self.params.conv_config.dtype, MemoryTier::Dram)
            .expect("input upload")
    }

    /// Prepares, runs and reads back one split convolution, releasing everything it allocated.
    pub fn run_split<B: AcceleratorBackend + 'static>(
        &self,
        ctx: &DeviceContext<B>,
        factors: SplitFactors,
    ) -> Tensor {
        let weights = prepare_split_weights(
            ctx,
            self.params.in_channels,
            self.params.out_channels,
            factors,
            &self.weight,
            &self.bias,
        )
        .expect("prepare split weights");
        let result = split_conv_and_run(
            ctx,
            self.upload_input(ctx),
            &weights,
            &self.params,
            factors,
            false,
        )
        .expect("split convolution");
        let host = result.output.to_host().expect("readback");
        result.output.release().expect("release output");
        weights.release().expect("release weights");
        host
    }

    /// Direct grouped convolution on the host in `f64`, ignoring dtype rounding.
    pub fn reference(&self) -> Vec<f32> {
        let p = &self.params;
        let [n, h, w, c_in] = p.input_dims();
        let [_, out_h, out_w, c_out] = p.output_dims().expect("reference output dims");
        let [kh, kw] = p.kernel_size;
        let c_in_g = c_in / p.groups;
        let c_out_g = c_out / p.groups;
        let input = self.input.data();
        let weight = self.weight.data();
        let bias = self.bias.data();

        let mut out = Vec::with_capacity(n * out_h * out_w * c_out);
        for b in 0..n {
            for oy in 0..out_h {
                for ox in 0..out_w {
                    for co in 0..c_out {
                        let first_in = (co / c_out_g) * c_in_g;
                        let mut acc = bias[co] as f64;
                        for ky in 0..kh {
                            for kx in 0..kw {
                                let iy = (oy * p.stride[0] + ky * p.dilation[0]) as isize
                                    - p.padding[0] as isize;
                                let ix = (ox * p.stride[1] + kx * p.dilation[1]) as isize
                                    - p.padding[1] as isize;
                                if iy < 0 || ix < 0 || iy >= h as isize || ix >= w as isize {
                                    continue;
                                }
                                let base =
                                    ((b * h + iy as usize) * w + ix as usize) * c_in + first_in;
                                for ci in 0..c_in_g {
                                    let widx = ((co * c_in_g + ci) * kh + ky) * kw + kx;
                                    acc += input[base + ci] as f64 * weight[widx] as f64;
                                }
                            }
                        }
                        out.push(acc as f32);
                    }
                }
            }
        }
        out
    }
}

/// Asserts `|a - e| <= atol + rtol * |e|` element-wise.
pub fn assert_close(actual: &[f32], expected: &[f32], atol: f32, rtol: f32) {
    assert_eq!(
        actual.len(),
        expected.len(),
        "length mismatch: {} vs {}",
        actual.len(),
        expected.len()
    );
    for (idx, (&a, &e)) in actual.iter().zip(expected).enumerate() {
        let tol = atol + rtol * e.abs();
        assert!(
            (a - e).abs() <= tol,
            "mismatch at {idx}: actual={a} expected={e} (|diff|={} > tol={tol})",
            (a - e).abs()
        );
    }
}

use std::sync::Arc;

use splitconv::config::Activation;
use splitconv::{
    prepare_split_weights, split_conv_and_run, AcceleratorBackend, Conv2dParams, DeviceContext,
    MemoryTier, Shape, SplitFactors, Tensor,
};

use crate::common::{assert_close, f32_params, ConvProblem, ATOL, BF16_ATOL, BF16_RTOL, RTOL};

pub fn unsplit_matches_host_reference<B: AcceleratorBackend + 'static>(backend: &Arc<B>) {
    let ctx = DeviceContext::new(Arc::clone(backend));
    let problem = ConvProblem::random(f32_params(8, 8, 9, 7), 11);

    let output = problem.run_split(&ctx, SplitFactors::unsplit());

    assert_eq!(output.shape().dims(), &[1, 9, 7, 8]);
    assert_close(output.data(), &problem.reference(), ATOL, RTOL);
}

pub fn split_matches_unsplit_f32<B: AcceleratorBackend + 'static>(backend: &Arc<B>) {
    let ctx = DeviceContext::new(Arc::clone(backend));
    let problem = ConvProblem::random(f32_params(8, 8, 10, 12), 5);
    let unsplit = problem.run_split(&ctx, SplitFactors::unsplit());

    for (input, output) in [(2, 1), (2, 2), (4, 2), (2, 4), (8, 8)] {
        let split = problem.run_split(&ctx, SplitFactors::new(input, output));
        assert_eq!(split.shape(), unsplit.shape());
        assert_close(split.data(), unsplit.data(), ATOL, RTOL);
    }
}

pub fn split_matches_unsplit_bf16<B: AcceleratorBackend + 'static>(backend: &Arc<B>) {
    let ctx = DeviceContext::new(Arc::clone(backend));
    let problem = ConvProblem::random(Conv2dParams::new(16, 8, 8, 8), 23);
    let unsplit = problem.run_split(&ctx, SplitFactors::unsplit());

    for (input, output) in [(2, 1), (4, 2), (2, 4), (8, 8)] {
        let split = problem.run_split(&ctx, SplitFactors::new(input, output));
        assert_close(split.data(), unsplit.data(), BF16_ATOL, BF16_RTOL);
    }
}

pub fn batched_split_matches_host_reference<B: AcceleratorBackend + 'static>(backend: &Arc<B>) {
    let ctx = DeviceContext::new(Arc::clone(backend));
    let params = f32_params(4, 6, 5, 5)
        .with_batch_size(3)
        .with_kernel_size(1)
        .with_padding(0);
    let problem = ConvProblem::random(params, 3);

    let output = problem.run_split(&ctx, SplitFactors::new(2, 3));

    assert_eq!(output.shape().dims(), &[3, 5, 5, 6]);
    assert_close(output.data(), &problem.reference(), ATOL, RTOL);
}

/// 8 -> 8 channels over a `4x16x16x8` NHWC input with identity-centred 3x3 kernels and zero
/// bias: every output pixel must equal its input pixel.
pub fn identity_weights_reproduce_input<B: AcceleratorBackend + 'static>(backend: &Arc<B>) {
    let ctx = DeviceContext::new(Arc::clone(backend));
    let params = Conv2dParams::new(8, 8, 16, 16).with_batch_size(4);
    let factors = SplitFactors::new(2, 2);

    let input_shape = Shape::new(params.input_dims());
    let values = (0..input_shape.num_elements())
        .map(|idx| (idx % 17) as f32 - 8.0)
        .collect();
    let input = Tensor::from_vec(input_shape, values).unwrap();

    let mut weight = Tensor::zeros(Shape::new([8, 8, 3, 3]));
    for channel in 0..8 {
        weight.data_mut()[((channel * 8 + channel) * 3 + 1) * 3 + 1] = 1.0;
    }
    let bias = Tensor::zeros(Shape::new([1, 1, 1, 8]));

    let weights = prepare_split_weights(&ctx, 8, 8, factors, &weight, &bias).unwrap();
    let device_input = ctx
        .upload(&input, params.conv_config.dtype, MemoryTier::Dram)
        .unwrap();
    let result = split_conv_and_run(&ctx, device_input, &weights, &params, factors, false).unwrap();
    let output = result.output.to_host().unwrap();

    assert_eq!(output.shape().dims(), &[4, 16, 16, 8]);
    assert_eq!(output.data(), input.data());

    result.output.release().unwrap();
    weights.release().unwrap();
}

pub fn fused_relu_applies_to_unsplit_output<B: AcceleratorBackend + 'static>(backend: &Arc<B>) {
    let ctx = DeviceContext::new(Arc::clone(backend));
    let mut params = f32_params(4, 4, 6, 6);
    params.conv_config.activation = Some(Activation::Relu);
    let problem = ConvProblem::random(params, 17);

    let output = problem.run_split(&ctx, SplitFactors::unsplit());
    let expected: Vec<f32> = problem
        .reference()
        .into_iter()
        .map(|v| Activation::Relu.apply(v))
        .collect();

    assert!(output.data().iter().all(|&v| v >= 0.0));
    assert_close(output.data(), &expected, ATOL, RTOL);
}

use std::sync::Arc;

use splitconv::config::Activation;
use splitconv::{
    prepare_split_weights, split_conv_and_run, AcceleratorBackend, Arch, Conv2dParams,
    DeviceContext, Layout, MemoryTier, Shape, SplitConvError, SplitFactors, Tensor,
};

use crate::common::{f32_params, ConvProblem};

pub fn prepare_rejects_indivisible_split<B: AcceleratorBackend + 'static>(backend: &Arc<B>) {
    let ctx = DeviceContext::new(Arc::clone(backend));
    let problem = ConvProblem::random(f32_params(8, 8, 4, 4), 0);

    let err = prepare_split_weights(
        &ctx,
        8,
        8,
        SplitFactors::new(3, 1),
        &problem.weight,
        &problem.bias,
    )
    .err()
    .expect("8 input channels cannot be split three ways");
    assert!(matches!(err, SplitConvError::ShapeMismatch(_)));
}

pub fn prepare_rejects_mismatched_bias<B: AcceleratorBackend + 'static>(backend: &Arc<B>) {
    let ctx = DeviceContext::new(Arc::clone(backend));
    let problem = ConvProblem::random(f32_params(8, 8, 4, 4), 0);
    let short_bias = Tensor::zeros(Shape::new([1, 1, 1, 4]));

    let err = prepare_split_weights(
        &ctx,
        8,
        8,
        SplitFactors::new(2, 2),
        &problem.weight,
        &short_bias,
    )
    .err()
    .expect("bias with 4 channels against 8 output channels");
    assert!(matches!(err, SplitConvError::ShapeMismatch(_)));
}

pub fn prepare_rejects_mismatched_weight<B: AcceleratorBackend + 'static>(backend: &Arc<B>) {
    let ctx = DeviceContext::new(Arc::clone(backend));
    let problem = ConvProblem::random(f32_params(8, 8, 4, 4), 0);

    let err = prepare_split_weights(
        &ctx,
        4,
        8,
        SplitFactors::new(2, 2),
        &problem.weight,
        &problem.bias,
    )
    .err()
    .expect("weight has 8 input channels, caller declared 4");
    assert!(matches!(err, SplitConvError::ShapeMismatch(_)));
}

pub fn run_rejects_tile_layout<B: AcceleratorBackend + 'static>(backend: &Arc<B>) {
    let ctx = DeviceContext::new(Arc::clone(backend));
    let problem = ConvProblem::random(f32_params(4, 4, 4, 4), 0);
    let factors = SplitFactors::new(2, 2);
    let weights = prepare_split_weights(&ctx, 4, 4, factors, &problem.weight, &problem.bias)
        .unwrap();

    let tiled = problem.input.clone().with_layout(Layout::Tile);
    let input = ctx
        .upload(&tiled, problem.params.conv_config.dtype, MemoryTier::Dram)
        .unwrap();
    let err = split_conv_and_run(&ctx, input, &weights, &problem.params, factors, false)
        .err()
        .expect("tiled input must be rejected");

    match err {
        SplitConvError::Layout { expected, found } => {
            assert_eq!(expected, Layout::RowMajor);
            assert_eq!(found, Layout::Tile);
        }
        other => panic!("expected layout error, got {other:?}"),
    }
    weights.release().unwrap();
}

pub fn run_rejects_wrong_input_shape<B: AcceleratorBackend + 'static>(backend: &Arc<B>) {
    let ctx = DeviceContext::new(Arc::clone(backend));
    let problem = ConvProblem::random(f32_params(4, 4, 4, 4), 0);
    let factors = SplitFactors::new(2, 1);
    let weights = prepare_split_weights(&ctx, 4, 4, factors, &problem.weight, &problem.bias)
        .unwrap();

    let wrong = Tensor::zeros(Shape::new([1, 5, 4, 4]));
    let input = ctx
        .upload(&wrong, problem.params.conv_config.dtype, MemoryTier::Dram)
        .unwrap();
    let err = split_conv_and_run(&ctx, input, &weights, &problem.params, factors, false)
        .err()
        .expect("input height differs from params");
    assert!(matches!(err, SplitConvError::ShapeMismatch(_)));
    weights.release().unwrap();
}

pub fn run_rejects_grid_of_other_factors<B: AcceleratorBackend + 'static>(backend: &Arc<B>) {
    let ctx = DeviceContext::new(Arc::clone(backend));
    let problem = ConvProblem::random(f32_params(4, 4, 4, 4), 0);
    let weights = prepare_split_weights(
        &ctx,
        4,
        4,
        SplitFactors::new(2, 2),
        &problem.weight,
        &problem.bias,
    )
    .unwrap();

    let err = split_conv_and_run(
        &ctx,
        problem.upload_input(&ctx),
        &weights,
        &problem.params,
        SplitFactors::new(4, 2),
        false,
    )
    .err()
    .expect("2x2 grid used with 4x2 factors");
    assert!(matches!(err, SplitConvError::ShapeMismatch(_)));
    weights.release().unwrap();
}

pub fn fused_activation_rejected_with_input_split<B: AcceleratorBackend + 'static>(
    backend: &Arc<B>,
) {
    let ctx = DeviceContext::new(Arc::clone(backend));
    let mut params = f32_params(4, 4, 4, 4);
    params.conv_config.activation = Some(Activation::Silu);
    let problem = ConvProblem::random(params, 0);
    let factors = SplitFactors::new(2, 1);
    let weights = prepare_split_weights(&ctx, 4, 4, factors, &problem.weight, &problem.bias)
        .unwrap();

    let err = split_conv_and_run(
        &ctx,
        problem.upload_input(&ctx),
        &weights,
        &problem.params,
        factors,
        false,
    )
    .err()
    .expect("activation over partial sums");
    assert!(matches!(err, SplitConvError::Config(_)));
    weights.release().unwrap();
}

pub fn fp32_accumulation_rejected_on_grayskull<B: AcceleratorBackend + 'static>(
    backend: &Arc<B>,
) {
    let ctx = DeviceContext::new(Arc::clone(backend)).with_arch(Arch::Grayskull);
    let problem = ConvProblem::random(f32_params(4, 4, 4, 4), 0);
    assert!(problem.params.compute_config.fp32_dest_acc_en);
    let factors = SplitFactors::unsplit();
    let weights = prepare_split_weights(&ctx, 4, 4, factors, &problem.weight, &problem.bias)
        .unwrap();

    let err = split_conv_and_run(
        &ctx,
        problem.upload_input(&ctx),
        &weights,
        &problem.params,
        factors,
        false,
    )
    .err()
    .expect("grayskull has no fp32 destination registers");
    assert!(matches!(err, SplitConvError::Config(_)));
    weights.release().unwrap();
}

fn run_with_geometry<B: AcceleratorBackend + 'static>(
    backend: &Arc<B>,
    adjust: impl FnOnce(&mut Conv2dParams),
) -> SplitConvError {
    let ctx = DeviceContext::new(Arc::clone(backend));
    let problem = ConvProblem::random(f32_params(4, 4, 8, 8), 0);
    let factors = SplitFactors::new(2, 2);
    let weights = prepare_split_weights(&ctx, 4, 4, factors, &problem.weight, &problem.bias)
        .unwrap();

    let mut params = problem.params.clone();
    adjust(&mut params);
    let err = split_conv_and_run(
        &ctx,
        problem.upload_input(&ctx),
        &weights,
        &params,
        factors,
        false,
    )
    .err()
    .expect("slices only cover dense unit-stride windows");
    weights.release().unwrap();
    err
}

pub fn run_rejects_strided_params<B: AcceleratorBackend + 'static>(backend: &Arc<B>) {
    let err = run_with_geometry(backend, |params| params.stride = [2, 2]);
    assert!(matches!(err, SplitConvError::Config(_)), "got {err:?}");
}

pub fn run_rejects_dilated_params<B: AcceleratorBackend + 'static>(backend: &Arc<B>) {
    let err = run_with_geometry(backend, |params| params.dilation = [2, 1]);
    assert!(matches!(err, SplitConvError::Config(_)), "got {err:?}");
}

pub fn run_rejects_grouped_params<B: AcceleratorBackend + 'static>(backend: &Arc<B>) {
    let err = run_with_geometry(backend, |params| params.groups = 2);
    assert!(matches!(err, SplitConvError::Config(_)), "got {err:?}");
}

/// The bias is cut per output slice only when the input is also split. An output-only split
/// therefore leaves a single full-width bias, which the driver refuses as a grid mismatch.
pub fn bias_split_follows_input_factor<B: AcceleratorBackend + 'static>(backend: &Arc<B>) {
    let ctx = DeviceContext::new(Arc::clone(backend));
    let problem = ConvProblem::random(f32_params(4, 4, 4, 4), 0);

    for (factors, expected_len) in [
        (SplitFactors::new(2, 2), 2),
        (SplitFactors::new(2, 1), 1),
        (SplitFactors::new(1, 1), 1),
        (SplitFactors::new(1, 2), 1),
    ] {
        let weights = prepare_split_weights(&ctx, 4, 4, factors, &problem.weight, &problem.bias)
            .unwrap();
        assert_eq!(weights.bias_len(), expected_len, "bias pieces for {factors:?}");
        weights.release().unwrap();
    }

    let factors = SplitFactors::new(1, 2);
    let weights = prepare_split_weights(&ctx, 4, 4, factors, &problem.weight, &problem.bias)
        .unwrap();
    let err = split_conv_and_run(
        &ctx,
        problem.upload_input(&ctx),
        &weights,
        &problem.params,
        factors,
        false,
    )
    .err()
    .expect("one bias for two output slices");
    assert!(matches!(err, SplitConvError::ShapeMismatch(_)));
    weights.release().unwrap();
}

use std::sync::Arc;

use splitconv::{
    prepare_split_weights, split_conv_and_run, BackendError, Conv2dParams, DeviceContext,
    MemoryTier, SplitConvConfig, SplitConvError, SplitConvExecutor, SplitFactors,
};
use splitconv_backend_ref_cpu::CpuBackend;
use splitconv_backend_tests::common::{f32_params, ConvProblem};
use splitconv_backend_tests::recording_backend::RecordingBackend;

fn assert_nothing_live(backend: &CpuBackend) {
    assert_eq!(backend.live_handles(), 0);
    for tier in [MemoryTier::Host, MemoryTier::Dram, MemoryTier::L1] {
        assert_eq!(backend.live_bytes(tier), 0, "{tier} still holds bytes");
    }
}

#[test]
fn split_run_returns_every_allocation() {
    splitconv::telemetry::ensure_tracing();
    let backend = Arc::new(CpuBackend::new());
    let ctx = DeviceContext::new(Arc::clone(&backend));
    let problem = ConvProblem::random(f32_params(8, 8, 6, 6), 1);
    let factors = SplitFactors::new(2, 4);

    let weights = prepare_split_weights(&ctx, 8, 8, factors, &problem.weight, &problem.bias)
        .unwrap();
    let result = split_conv_and_run(
        &ctx,
        problem.upload_input(&ctx),
        &weights,
        &problem.params,
        factors,
        true,
    )
    .unwrap();
    assert_eq!(backend.live_bytes(MemoryTier::L1), 0);

    result.output.release().unwrap();
    result.cached.unwrap().release().unwrap();
    weights.release().unwrap();
    assert_nothing_live(&backend);
}

#[test]
fn failed_run_releases_intermediates() {
    let cpu = Arc::new(CpuBackend::new());
    let recording = Arc::new(RecordingBackend::new(Arc::clone(&cpu)));
    let ctx = DeviceContext::new(Arc::clone(&recording));
    let problem = ConvProblem::random(f32_params(8, 8, 4, 4), 2);
    let factors = SplitFactors::new(2, 2);

    let weights = prepare_split_weights(&ctx, 8, 8, factors, &problem.weight, &problem.bias)
        .unwrap();
    recording.fail_on("conv2d", 3);
    let err = split_conv_and_run(
        &ctx,
        problem.upload_input(&ctx),
        &weights,
        &problem.params,
        factors,
        false,
    )
    .err()
    .expect("third slice convolution fails");
    assert!(matches!(
        err,
        SplitConvError::Backend(BackendError::Execution { .. })
    ));

    weights.release().unwrap();
    assert_nothing_live(&cpu);
}

#[test]
fn split_fits_where_unsplit_runs_out_of_l1() {
    let params = Conv2dParams::new(16, 16, 16, 16);
    let problem = ConvProblem::random(params, 3);
    // Full output: 16 * 16 * 16 bf16 values = 8192 bytes; a half-width slice needs 4096.
    let backend = Arc::new(CpuBackend::new().with_l1_capacity(6000));
    let ctx = DeviceContext::new(Arc::clone(&backend));

    let unsplit = SplitFactors::unsplit();
    let weights = prepare_split_weights(&ctx, 16, 16, unsplit, &problem.weight, &problem.bias)
        .unwrap();
    let err = split_conv_and_run(
        &ctx,
        problem.upload_input(&ctx),
        &weights,
        &problem.params,
        unsplit,
        false,
    )
    .err()
    .expect("unsplit output exceeds L1");
    assert!(matches!(
        err,
        SplitConvError::Backend(BackendError::OutOfMemory {
            tier: MemoryTier::L1,
            requested: 8192,
            available: 6000,
        })
    ));
    weights.release().unwrap();

    let split = SplitFactors::new(2, 2);
    let weights = prepare_split_weights(&ctx, 16, 16, split, &problem.weight, &problem.bias)
        .unwrap();
    backend.reset_peaks();
    let result = split_conv_and_run(
        &ctx,
        problem.upload_input(&ctx),
        &weights,
        &problem.params,
        split,
        false,
    )
    .unwrap();
    assert_eq!(backend.peak_bytes(MemoryTier::L1), 4096);
    assert_eq!(result.output.desc().unwrap().shape.dims(), &[1, 16, 16, 16]);

    result.output.release().unwrap();
    weights.release().unwrap();
    assert_nothing_live(&backend);
}

#[test]
fn cached_executor_uploads_weights_once() {
    let backend = Arc::new(CpuBackend::new());
    let ctx = DeviceContext::new(Arc::clone(&backend));
    let problem = ConvProblem::random(f32_params(8, 8, 5, 5), 4);
    let config = SplitConvConfig::new(problem.params.clone(), SplitFactors::new(2, 2))
        .with_cache_weights(true);
    let mut executor =
        SplitConvExecutor::new(ctx.clone(), config, &problem.weight, &problem.bias).unwrap();

    executor.forward(problem.upload_input(&ctx)).unwrap().release().unwrap();
    // Four weight slices plus one bias per output slice.
    assert_eq!(backend.weight_uploads(), 6);

    executor.forward(problem.upload_input(&ctx)).unwrap().release().unwrap();
    executor.forward(problem.upload_input(&ctx)).unwrap().release().unwrap();
    assert_eq!(backend.weight_uploads(), 6);

    drop(executor);
    assert_nothing_live(&backend);
}

#[test]
fn uncached_executor_uploads_weights_every_pass() {
    let backend = Arc::new(CpuBackend::new());
    let ctx = DeviceContext::new(Arc::clone(&backend));
    let problem = ConvProblem::random(f32_params(8, 8, 5, 5), 5);
    let config = SplitConvConfig::new(problem.params.clone(), SplitFactors::new(2, 2));
    let mut executor =
        SplitConvExecutor::new(ctx.clone(), config, &problem.weight, &problem.bias).unwrap();

    for pass in 1..=3 {
        executor.forward(problem.upload_input(&ctx)).unwrap().release().unwrap();
        assert_eq!(backend.weight_uploads(), 6 * pass);
    }
}

#[test]
fn host_weights_are_staged_in_dram_during_the_run() {
    let backend = Arc::new(CpuBackend::new());
    let ctx = DeviceContext::new(Arc::clone(&backend));
    let problem = ConvProblem::random(f32_params(8, 8, 4, 4), 6);
    let factors = SplitFactors::unsplit();

    let weights = prepare_split_weights(&ctx, 8, 8, factors, &problem.weight, &problem.bias)
        .unwrap();
    let input = problem.upload_input(&ctx);
    backend.reset_peaks();
    let result =
        split_conv_and_run(&ctx, input, &weights, &problem.params, factors, false).unwrap();

    // 512 input bytes, 2304 weight bytes and 32 bias bytes side by side in DRAM.
    assert_eq!(backend.peak_bytes(MemoryTier::Dram), 512 + 2304 + 32);
    assert_eq!(backend.live_bytes(MemoryTier::Dram), 512);
    assert_eq!(backend.weight_uploads(), 2);

    result.output.release().unwrap();
    weights.release().unwrap();
    assert_nothing_live(&backend);
}

use std::sync::Arc;

use splitconv::{
    prepare_split_weights, split_conv_and_run, AcceleratorBackend, BackendError, DeviceContext,
    MemoryTier, SplitConvError, SplitFactors,
};

use crate::common::{f32_params, ConvProblem};
use crate::recording_backend::RecordingBackend;

fn recording_context<B: AcceleratorBackend + 'static>(
    backend: &Arc<B>,
) -> (Arc<RecordingBackend<B>>, DeviceContext<RecordingBackend<B>>) {
    let recording = Arc::new(RecordingBackend::new(Arc::clone(backend)));
    let ctx = DeviceContext::new(Arc::clone(&recording));
    (recording, ctx)
}

pub fn call_counts_follow_split_grid<B: AcceleratorBackend + 'static>(backend: &Arc<B>) {
    let (recording, ctx) = recording_context(backend);
    let problem = ConvProblem::random(f32_params(8, 8, 6, 6), 1);
    let factors = SplitFactors::new(2, 4);

    let weights = prepare_split_weights(&ctx, 8, 8, factors, &problem.weight, &problem.bias)
        .unwrap();
    assert_eq!(recording.calls("from_host"), 2 * 4 + 4);

    let input = problem.upload_input(&ctx);
    recording.reset();
    let result =
        split_conv_and_run(&ctx, input, &weights, &problem.params, factors, false).unwrap();

    assert_eq!(recording.calls("conv2d"), 8);
    assert_eq!(recording.calls("split"), 1);
    assert_eq!(recording.calls("concat"), 1);
    assert_eq!(recording.calls("add_inplace"), 4);
    assert_eq!(recording.calls("to_memory_tier"), 4);

    let convs = recording.conv_calls();
    assert!(convs
        .iter()
        .all(|call| call.in_channels == 4 && call.out_channels == 2));
    assert!(convs.iter().all(|call| !call.return_weights_and_bias));
    let biased: Vec<bool> = convs.iter().map(|call| call.with_bias).collect();
    assert_eq!(
        biased,
        vec![true, false, true, false, true, false, true, false],
        "bias goes with the first input slice of every output slice"
    );

    result.output.release().unwrap();
    weights.release().unwrap();
}

pub fn conv_calls_carry_context_device_id<B: AcceleratorBackend + 'static>(backend: &Arc<B>) {
    let (recording, ctx) = recording_context(backend);
    let ctx = ctx.with_device_id(3);
    let problem = ConvProblem::random(f32_params(4, 4, 4, 4), 6);
    let factors = SplitFactors::new(2, 2);

    let weights = prepare_split_weights(&ctx, 4, 4, factors, &problem.weight, &problem.bias)
        .unwrap();
    let result = split_conv_and_run(
        &ctx,
        problem.upload_input(&ctx),
        &weights,
        &problem.params,
        factors,
        false,
    )
    .unwrap();

    let convs = recording.conv_calls();
    assert_eq!(convs.len(), 4);
    assert!(convs.iter().all(|call| call.device_id == 3));

    result.output.release().unwrap();
    weights.release().unwrap();
}

pub fn unsplit_run_skips_split_and_concat<B: AcceleratorBackend + 'static>(backend: &Arc<B>) {
    let (recording, ctx) = recording_context(backend);
    let problem = ConvProblem::random(f32_params(4, 4, 5, 5), 2);
    let factors = SplitFactors::unsplit();

    let weights = prepare_split_weights(&ctx, 4, 4, factors, &problem.weight, &problem.bias)
        .unwrap();
    let input = problem.upload_input(&ctx);
    recording.reset();
    let result =
        split_conv_and_run(&ctx, input, &weights, &problem.params, factors, false).unwrap();

    assert_eq!(recording.calls("conv2d"), 1);
    assert_eq!(recording.calls("split"), 0);
    assert_eq!(recording.calls("concat"), 0);
    assert_eq!(recording.calls("add_inplace"), 0);
    assert_eq!(result.output.tier().unwrap(), MemoryTier::Dram);

    result.output.release().unwrap();
    weights.release().unwrap();
}

pub fn cached_weights_are_reused<B: AcceleratorBackend + 'static>(backend: &Arc<B>) {
    let (recording, ctx) = recording_context(backend);
    let problem = ConvProblem::random(f32_params(8, 4, 6, 6), 9);
    let factors = SplitFactors::new(2, 2);

    let weights = prepare_split_weights(&ctx, 8, 4, factors, &problem.weight, &problem.bias)
        .unwrap();
    assert!(!weights.is_device_resident().unwrap());

    let first = split_conv_and_run(
        &ctx,
        problem.upload_input(&ctx),
        &weights,
        &problem.params,
        factors,
        true,
    )
    .unwrap();
    assert!(recording
        .conv_calls()
        .iter()
        .all(|call| call.return_weights_and_bias && call.weight_tier == MemoryTier::Host));

    let cached = first.cached.expect("cache requested");
    assert_eq!(cached.out_slices(), 2);
    assert_eq!(cached.in_slices(), Some(2));
    assert_eq!(cached.bias_len(), 2);
    assert!(cached.is_device_resident().unwrap());
    weights.release().unwrap();

    recording.reset();
    let second = split_conv_and_run(
        &ctx,
        problem.upload_input(&ctx),
        &cached,
        &problem.params,
        factors,
        false,
    )
    .unwrap();
    assert!(second.cached.is_none());
    assert!(recording
        .conv_calls()
        .iter()
        .all(|call| call.weight_tier == MemoryTier::Dram));

    let first_host = first.output.to_host().unwrap();
    let second_host = second.output.to_host().unwrap();
    assert_eq!(first_host.data(), second_host.data());

    first.output.release().unwrap();
    second.output.release().unwrap();
    cached.release().unwrap();
}

pub fn backend_failure_aborts_call<B: AcceleratorBackend + 'static>(backend: &Arc<B>) {
    let (recording, ctx) = recording_context(backend);
    let problem = ConvProblem::random(f32_params(8, 8, 4, 4), 4);
    let factors = SplitFactors::new(2, 2);
    let weights = prepare_split_weights(&ctx, 8, 8, factors, &problem.weight, &problem.bias)
        .unwrap();

    for op in ["conv2d", "add_inplace", "concat", "split"] {
        recording.reset();
        recording.fail_on(op, 1);
        let err = split_conv_and_run(
            &ctx,
            problem.upload_input(&ctx),
            &weights,
            &problem.params,
            factors,
            false,
        )
        .err()
        .unwrap_or_else(|| panic!("failure in {op} must abort the call"));
        match err {
            SplitConvError::Backend(BackendError::Execution { message }) => {
                assert!(message.contains(op), "unexpected message: {message}")
            }
            other => panic!("expected propagated backend error, got {other:?}"),
        }
    }

    weights.release().unwrap();
}

pub fn failed_conv_stops_later_slices<B: AcceleratorBackend + 'static>(backend: &Arc<B>) {
    let (recording, ctx) = recording_context(backend);
    let problem = ConvProblem::random(f32_params(8, 8, 4, 4), 6);
    let factors = SplitFactors::new(2, 2);
    let weights = prepare_split_weights(&ctx, 8, 8, factors, &problem.weight, &problem.bias)
        .unwrap();
    let input = problem.upload_input(&ctx);

    recording.reset();
    recording.fail_on("conv2d", 2);
    let result = split_conv_and_run(&ctx, input, &weights, &problem.params, factors, false);

    assert!(result.is_err());
    assert_eq!(recording.calls("conv2d"), 2);
    assert_eq!(recording.calls("concat"), 0);

    weights.release().unwrap();
}

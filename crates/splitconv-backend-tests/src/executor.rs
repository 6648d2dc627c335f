use std::sync::Arc;

use splitconv::{
    AcceleratorBackend, DeviceContext, SplitConvConfig, SplitConvError, SplitConvExecutor,
    SplitFactors,
};

use crate::common::{assert_close, f32_params, ConvProblem, ATOL, RTOL};

pub fn executor_caches_after_first_forward<B: AcceleratorBackend + 'static>(backend: &Arc<B>) {
    let ctx = DeviceContext::new(Arc::clone(backend));
    let problem = ConvProblem::random(f32_params(8, 8, 6, 6), 31);
    let config = SplitConvConfig::new(problem.params.clone(), SplitFactors::new(2, 2))
        .with_cache_weights(true);

    let mut executor =
        SplitConvExecutor::new(ctx.clone(), config, &problem.weight, &problem.bias).unwrap();
    assert!(!executor.is_cached());
    assert!(!executor.weights().is_device_resident().unwrap());

    let first = executor.forward(problem.upload_input(&ctx)).unwrap();
    assert!(executor.is_cached());
    assert!(executor.weights().is_device_resident().unwrap());

    let second = executor.forward(problem.upload_input(&ctx)).unwrap();
    assert!(executor.is_cached());

    let first = first.to_host().unwrap();
    let second = second.to_host().unwrap();
    assert_eq!(first.data(), second.data());
    assert_close(second.data(), &problem.reference(), ATOL, RTOL);
}

pub fn executor_without_cache_keeps_host_weights<B: AcceleratorBackend + 'static>(
    backend: &Arc<B>,
) {
    let ctx = DeviceContext::new(Arc::clone(backend));
    let problem = ConvProblem::random(f32_params(4, 8, 5, 5), 32);
    let config = SplitConvConfig::new(problem.params.clone(), SplitFactors::new(2, 4));

    let mut executor =
        SplitConvExecutor::new(ctx.clone(), config, &problem.weight, &problem.bias).unwrap();
    for _ in 0..2 {
        let output = executor.forward(problem.upload_input(&ctx)).unwrap();
        assert_close(
            output.to_host().unwrap().data(),
            &problem.reference(),
            ATOL,
            RTOL,
        );
        output.release().unwrap();
    }
    assert!(!executor.is_cached());
    assert!(!executor.weights().is_device_resident().unwrap());
}

pub fn executor_from_json_config<B: AcceleratorBackend + 'static>(backend: &Arc<B>) {
    let ctx = DeviceContext::new(Arc::clone(backend));
    let config = SplitConvConfig::from_json_str(
        r#"{
            "factors": { "input": 2, "output": 2 },
            "params": {
                "in_channels": 4,
                "out_channels": 4,
                "input_height": 6,
                "input_width": 6,
                "conv_config": { "dtype": "f32", "weights_dtype": "f32" },
                "compute_config": { "fp32_dest_acc_en": true }
            },
            "cache_weights": true
        }"#,
    )
    .unwrap();
    let problem = ConvProblem::random(config.params.clone(), 33);

    let mut executor =
        SplitConvExecutor::new(ctx.clone(), config, &problem.weight, &problem.bias).unwrap();
    let output = executor.forward(problem.upload_input(&ctx)).unwrap();

    assert!(executor.is_cached());
    assert_close(
        output.to_host().unwrap().data(),
        &problem.reference(),
        ATOL,
        RTOL,
    );
}

pub fn executor_rejects_invalid_config<B: AcceleratorBackend + 'static>(backend: &Arc<B>) {
    let ctx = DeviceContext::new(Arc::clone(backend));
    let problem = ConvProblem::random(f32_params(4, 4, 2, 2), 34);
    let params = problem.params.clone().with_kernel_size(7).with_padding(0);
    let config = SplitConvConfig::new(params, SplitFactors::unsplit());

    let err = SplitConvExecutor::new(ctx, config, &problem.weight, &problem.bias)
        .err()
        .expect("7x7 kernel over a 2x2 input");
    assert!(matches!(err, SplitConvError::Config(_)));
}

pub fn executor_rejects_strided_params<B: AcceleratorBackend + 'static>(backend: &Arc<B>) {
    let ctx = DeviceContext::new(Arc::clone(backend));
    let problem = ConvProblem::random(f32_params(4, 4, 8, 8), 35);
    let mut params = problem.params.clone();
    params.stride = [2, 2];
    let config = SplitConvConfig::new(params, SplitFactors::new(2, 2));

    let err = SplitConvExecutor::new(ctx, config, &problem.weight, &problem.bias)
        .err()
        .expect("slices only run with unit stride");
    assert!(matches!(err, SplitConvError::Config(_)));
}

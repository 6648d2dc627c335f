use splitconv::backend::Conv2dRequest;
use splitconv::{AcceleratorBackend, MemoryTier};
use splitconv_backend_ref_cpu::CpuBackend;
use splitconv_backend_tests::common::{assert_close, f32_params, ConvProblem, ATOL, RTOL};

fn run_direct(backend: &CpuBackend, problem: &ConvProblem) -> Vec<f32> {
    let dtype = problem.params.conv_config.dtype;
    let input = backend.from_host(&problem.input, dtype, MemoryTier::Dram).unwrap();
    let weight = backend.from_host(&problem.weight, dtype, MemoryTier::Host).unwrap();
    let bias = backend.from_host(&problem.bias, dtype, MemoryTier::Host).unwrap();

    let result = backend
        .conv2d(Conv2dRequest {
            input: &input,
            weight: &weight,
            bias: Some(&bias),
            params: &problem.params,
            device_id: 0,
            return_weights_and_bias: false,
        })
        .unwrap();
    let expected_dims = problem.params.output_dims().unwrap();
    assert_eq!(result.output.desc().shape.dims(), &expected_dims);
    let values = result.output.data().to_vec();

    for tensor in [input, weight, bias, result.output] {
        backend.deallocate(tensor).unwrap();
    }
    values
}

#[test]
fn strided_dilated_and_grouped_windows_match_host_reference() {
    splitconv::telemetry::ensure_tracing();
    let backend = CpuBackend::new();

    let mut strided = f32_params(4, 6, 9, 7);
    strided.stride = [2, 3];

    let mut dilated = f32_params(3, 4, 8, 8).with_padding(2);
    dilated.dilation = [2, 2];

    let mut grouped = f32_params(6, 4, 5, 5);
    grouped.groups = 2;

    let mut depthwise = f32_params(4, 8, 6, 6).with_batch_size(2);
    depthwise.groups = 4;
    depthwise.stride = [2, 1];
    depthwise.dilation = [1, 2];

    for (seed, params) in [strided, dilated, grouped, depthwise].into_iter().enumerate() {
        let problem = ConvProblem::random(params, 40 + seed as u64);
        let actual = run_direct(&backend, &problem);
        assert_close(&actual, &problem.reference(), ATOL, RTOL);
    }
    assert_eq!(backend.live_handles(), 0);
}

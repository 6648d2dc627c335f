pub mod common;
pub mod executor;
pub mod orchestration;
pub mod recording_backend;
pub mod split_parity;
pub mod validation;

#[macro_export]
macro_rules! define_backend_tests {
    ($module:ident, $backend_ctor:expr) => {
        #[cfg(test)]
        mod $module {
            #[allow(unused_imports)]
            use super::*;
            use $crate::{executor, orchestration, split_parity, validation};

            macro_rules! suite_test {
                ($name:ident, $func:path) => {
                    #[test]
                    fn $name() {
                        ::splitconv::telemetry::ensure_tracing();
                        let backend = ($backend_ctor)();
                        $func(&backend);
                    }
                };
            }

            suite_test!(parity_unsplit_matches_host_reference, split_parity::unsplit_matches_host_reference);
            suite_test!(parity_split_matches_unsplit_f32, split_parity::split_matches_unsplit_f32);
            suite_test!(parity_split_matches_unsplit_bf16, split_parity::split_matches_unsplit_bf16);
            suite_test!(parity_batched_split_matches_host_reference, split_parity::batched_split_matches_host_reference);
            suite_test!(parity_identity_weights_reproduce_input, split_parity::identity_weights_reproduce_input);
            suite_test!(parity_fused_relu_applies_to_unsplit_output, split_parity::fused_relu_applies_to_unsplit_output);
            suite_test!(orchestration_call_counts_follow_split_grid, orchestration::call_counts_follow_split_grid);
            suite_test!(orchestration_conv_calls_carry_context_device_id, orchestration::conv_calls_carry_context_device_id);
            suite_test!(orchestration_unsplit_run_skips_split_and_concat, orchestration::unsplit_run_skips_split_and_concat);
            suite_test!(orchestration_cached_weights_are_reused, orchestration::cached_weights_are_reused);
            suite_test!(orchestration_backend_failure_aborts_call, orchestration::backend_failure_aborts_call);
            suite_test!(orchestration_failed_conv_stops_later_slices, orchestration::failed_conv_stops_later_slices);
            suite_test!(validation_prepare_rejects_indivisible_split, validation::prepare_rejects_indivisible_split);
            suite_test!(validation_prepare_rejects_mismatched_bias, validation::prepare_rejects_mismatched_bias);
            suite_test!(validation_prepare_rejects_mismatched_weight, validation::prepare_rejects_mismatched_weight);
            suite_test!(validation_run_rejects_tile_layout, validation::run_rejects_tile_layout);
            suite_test!(validation_run_rejects_wrong_input_shape, validation::run_rejects_wrong_input_shape);
            suite_test!(validation_run_rejects_grid_of_other_factors, validation::run_rejects_grid_of_other_factors);
            suite_test!(validation_run_rejects_strided_params, validation::run_rejects_strided_params);
            suite_test!(validation_run_rejects_dilated_params, validation::run_rejects_dilated_params);
            suite_test!(validation_run_rejects_grouped_params, validation::run_rejects_grouped_params);
            suite_test!(validation_fused_activation_rejected_with_input_split, validation::fused_activation_rejected_with_input_split);
            suite_test!(validation_fp32_accumulation_rejected_on_grayskull, validation::fp32_accumulation_rejected_on_grayskull);
            suite_test!(validation_bias_split_follows_input_factor, validation::bias_split_follows_input_factor);
            suite_test!(executor_caches_after_first_forward, executor::executor_caches_after_first_forward);
            suite_test!(executor_without_cache_keeps_host_weights, executor::executor_without_cache_keeps_host_weights);
            suite_test!(executor_from_json_config, executor::executor_from_json_config);
            suite_test!(executor_rejects_invalid_config, executor::executor_rejects_invalid_config);
            suite_test!(executor_rejects_strided_params, executor::executor_rejects_strided_params);
        }
    };
}

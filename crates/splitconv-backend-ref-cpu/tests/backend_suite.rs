use std::sync::Arc;

use splitconv_backend_ref_cpu::CpuBackend;
use splitconv_backend_tests::define_backend_tests;

define_backend_tests!(cpu_backend, || Arc::new(CpuBackend::new()));

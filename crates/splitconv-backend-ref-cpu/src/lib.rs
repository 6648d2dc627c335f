//! Reference CPU backend for `splitconv`.
//!
//! Every tensor lives in host memory; memory tiers are tracked as bookkeeping so callers can
//! check allocation balance and peak fast-memory usage.

pub mod cpu;

pub use cpu::{CpuBackend, CpuTensor};

use std::sync::Arc;

use splitconv::backend::AcceleratorBackend;
use splitconv::{DType, DeviceContext, Layout, MemoryTier, Shape, Tensor};
use splitconv_backend_ref_cpu::CpuBackend;

fn sample() -> Tensor {
    Tensor::from_vec(Shape::new([1, 2, 2, 2]), vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.5])
        .unwrap()
}

#[test]
fn upload_reports_requested_placement() {
    let backend = Arc::new(CpuBackend::new());
    let ctx = DeviceContext::new(Arc::clone(&backend));

    let tensor = ctx.upload(&sample(), DType::BF16, MemoryTier::Dram).unwrap();
    let desc = tensor.desc().unwrap();

    assert_eq!(desc.shape, Shape::new([1, 2, 2, 2]));
    assert_eq!(desc.dtype, DType::BF16);
    assert_eq!(desc.layout, Layout::RowMajor);
    assert_eq!(desc.tier, MemoryTier::Dram);
    assert_eq!(desc.byte_len(), 16);
    assert_eq!(tensor.to_host().unwrap().data(), sample().data());
}

#[test]
fn release_and_drop_both_return_the_handle() {
    let backend = Arc::new(CpuBackend::new());
    let ctx = DeviceContext::new(Arc::clone(&backend));

    let released = ctx.upload(&sample(), DType::F32, MemoryTier::Dram).unwrap();
    let dropped = ctx.upload(&sample(), DType::F32, MemoryTier::L1).unwrap();
    assert_eq!(backend.live_handles(), 2);

    released.release().unwrap();
    assert_eq!(backend.live_handles(), 1);
    drop(dropped);
    assert_eq!(backend.live_handles(), 0);
}

#[test]
fn into_memory_tier_moves_and_frees_source() {
    let backend = Arc::new(CpuBackend::new());
    let ctx = DeviceContext::new(Arc::clone(&backend));
    let tensor = ctx.upload(&sample(), DType::F32, MemoryTier::L1).unwrap();

    let moved = tensor.into_memory_tier(MemoryTier::Dram).unwrap();
    assert_eq!(moved.tier().unwrap(), MemoryTier::Dram);
    assert_eq!(backend.live_bytes(MemoryTier::L1), 0);
    assert_eq!(backend.live_handles(), 1);

    let same = moved.into_memory_tier(MemoryTier::Dram).unwrap();
    assert_eq!(backend.live_handles(), 1);
    same.release().unwrap();
}

#[test]
fn to_memory_tier_keeps_source_alive() {
    let backend = Arc::new(CpuBackend::new());
    let ctx = DeviceContext::new(Arc::clone(&backend));
    let tensor = ctx.upload(&sample(), DType::F32, MemoryTier::Dram).unwrap();

    let copy = tensor.to_memory_tier(MemoryTier::L1).unwrap();
    assert_eq!(backend.live_handles(), 2);
    assert_eq!(copy.to_host().unwrap(), tensor.to_host().unwrap());
}

#[test]
fn tile_layout_survives_upload() {
    let backend = Arc::new(CpuBackend::new());
    let ctx = DeviceContext::new(Arc::clone(&backend));
    let tiled = sample().with_layout(Layout::Tile);

    let tensor = ctx.upload(&tiled, DType::F32, MemoryTier::Dram).unwrap();
    assert_eq!(tensor.desc().unwrap().layout, Layout::Tile);
    assert_eq!(ctx.backend().backend_name(), "cpu");
}

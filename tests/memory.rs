use std::sync::Arc;

use stagecoach::gpu::{
    BufferPreset, DeviceLimits, Format, ImageInfo, ImagePreset, NullBackend, NullConfig,
};
use stagecoach::{Allocator, GPUError};

fn allocator(limits: DeviceLimits, budget: Option<u64>) -> Allocator<NullBackend> {
    Allocator::new(Arc::new(NullBackend::new(NullConfig {
        limits,
        budget,
        ..Default::default()
    })))
}

#[test]
fn allocation_above_device_limit_is_out_of_memory() {
    let alloc = allocator(
        DeviceLimits {
            max_allocation_size: 1 << 20,
            ..Default::default()
        },
        None,
    );

    let err = alloc
        .allocate_buffer((1 << 20) + 1, BufferPreset::DeviceLocal)
        .unwrap_err();
    assert_eq!(
        err,
        GPUError::OutOfMemory {
            requested: (1 << 20) + 1,
            limit: 1 << 20
        }
    );

    let huge = ImageInfo {
        dim: [1024, 1024, 1],
        format: Format::RGBA32Float,
        ..Default::default()
    };
    let err = alloc.allocate_image(&huge, ImagePreset::Sampled).unwrap_err();
    assert!(matches!(err, GPUError::OutOfMemory { .. }));

    assert_eq!(alloc.stats().failed_allocations, 2);
    assert_eq!(alloc.stats().live_allocations, 0);
    assert!(alloc.allocate_buffer(1 << 20, BufferPreset::DeviceLocal).is_ok());
}

#[test]
fn device_exhaustion_reports_the_request() {
    let alloc = allocator(DeviceLimits::default(), Some(4096));
    let _held = alloc.allocate_buffer(4000, BufferPreset::DeviceLocal).unwrap();
    let err = alloc.allocate_buffer(200, BufferPreset::Staging).unwrap_err();
    match err {
        GPUError::OutOfMemory { requested, .. } => assert_eq!(requested, 200),
        other => panic!("unexpected {other:?}"),
    }
}

#[test]
fn pool_returns_none_when_full_and_reuses_freed_space() {
    let alloc = allocator(
        DeviceLimits {
            min_pool_alignment: 256,
            ..Default::default()
        },
        None,
    );
    let pool = alloc.allocate_buffer_pool(1024, BufferPreset::Dynamic).unwrap();

    let ranges: Vec<_> = (0..4)
        .map(|_| alloc.allocate_pool_buffer(&pool, 200).unwrap())
        .collect();
    let offsets: Vec<u64> = ranges.iter().map(|r| r.offset()).collect();
    assert_eq!(offsets, vec![0, 256, 512, 768]);
    assert!(alloc.allocate_pool_buffer(&pool, 1).is_none());
    assert_eq!(pool.stats().used, 800);

    drop(ranges);
    let stats = pool.stats();
    assert_eq!((stats.used, stats.live, stats.high_water), (0, 0, 968));

    let whole = alloc.allocate_pool_buffer(&pool, 1024).unwrap();
    assert_eq!(whole.offset(), 0);
    assert_eq!(whole.buffer(), pool.buffer());
}

#[test]
fn pool_ranges_share_the_block_memory() {
    let backend = Arc::new(NullBackend::default());
    let alloc = Allocator::new(backend.clone());
    let pool = alloc.allocate_buffer_pool(512, BufferPreset::Staging).unwrap();
    let mut a = alloc.allocate_pool_buffer(&pool, 4).unwrap();
    let mut b = alloc.allocate_pool_buffer(&pool, 4).unwrap();
    a.write(0, &[1, 1, 1, 1]).unwrap();
    b.as_mut_slice().unwrap().copy_from_slice(&[2, 2, 2, 2]);

    let block = backend.buffer_contents(pool.buffer()).unwrap();
    assert_eq!(&block[0..4], &[1, 1, 1, 1]);
    let at = b.offset() as usize;
    assert_eq!(&block[at..at + 4], &[2, 2, 2, 2]);
}

use std::collections::BTreeMap;
use std::mem::ManuallyDrop;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use ash::vk;
use parking_lot::Mutex;

use super::error::{GPUError, Result};
use super::{Backend, BufferInfo, BufferPreset, ImageInfo, ImagePreset, MappedPtr, Resource};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AllocatorStats {
    pub live_allocations: u64,
    pub live_bytes: u64,
    pub failed_allocations: u64,
}

#[derive(Default)]
struct Counters {
    live_allocations: AtomicU64,
    live_bytes: AtomicU64,
    failed_allocations: AtomicU64,
}

impl Counters {
    fn add(&self, bytes: u64) {
        self.live_allocations.fetch_add(1, Ordering::Relaxed);
        self.live_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    fn remove(&self, bytes: u64) {
        self.live_allocations.fetch_sub(1, Ordering::Relaxed);
        self.live_bytes.fetch_sub(bytes, Ordering::Relaxed);
    }
}

/// Creates device resources and fixed-size pools on top of a [`Backend`].
pub struct Allocator<B: Backend> {
    backend: Arc<B>,
    counters: Arc<Counters>,
}

impl<B: Backend> Clone for Allocator<B> {
    fn clone(&self) -> Self {
        Self {
            backend: self.backend.clone(),
            counters: self.counters.clone(),
        }
    }
}

impl<B: Backend> Allocator<B> {
    pub fn new(backend: Arc<B>) -> Self {
        Self {
            backend,
            counters: Arc::default(),
        }
    }

    pub fn backend(&self) -> &Arc<B> {
        &self.backend
    }

    pub fn stats(&self) -> AllocatorStats {
        AllocatorStats {
            live_allocations: self.counters.live_allocations.load(Ordering::Relaxed),
            live_bytes: self.counters.live_bytes.load(Ordering::Relaxed),
            failed_allocations: self.counters.failed_allocations.load(Ordering::Relaxed),
        }
    }

    /// Allocates a dedicated buffer.
    ///
    /// Sizes beyond the device's allocation limit are refused with
    /// [`GPUError::OutOfMemory`]; the request is never truncated.
    pub fn allocate_buffer(&self, byte_size: u64, preset: BufferPreset) -> Result<Allocation<B>> {
        self.allocate_named_buffer(&BufferInfo {
            debug_name: "",
            byte_size,
            preset,
        })
    }

    pub fn allocate_named_buffer(&self, info: &BufferInfo) -> Result<Allocation<B>> {
        self.check_size(info.byte_size)?;
        let raw = self
            .backend
            .create_buffer(info)
            .map_err(|e| self.on_failure(e, info.byte_size))?;
        log::trace!(
            "allocated buffer '{}' ({} bytes, {:?})",
            info.debug_name,
            info.byte_size,
            info.preset
        );
        Ok(self.track(
            Resource::Buffer(raw.buffer),
            raw.memory,
            raw.mapped,
            info.byte_size,
        ))
    }

    pub fn allocate_image(&self, info: &ImageInfo, preset: ImagePreset) -> Result<Allocation<B>> {
        if info.dim.iter().any(|d| *d == 0) {
            return Err(GPUError::invalid("image extent has a zero dimension"));
        }
        let info = ImageInfo { preset, ..*info };
        let byte_size = info.byte_size();
        self.check_size(byte_size)?;
        let raw = self
            .backend
            .create_image(&info)
            .map_err(|e| self.on_failure(e, byte_size))?;
        log::trace!(
            "allocated image '{}' {:?} ({} bytes)",
            info.debug_name,
            info.dim,
            byte_size
        );
        Ok(self.track(Resource::Image(raw.image), raw.memory, None, byte_size))
    }

    /// Allocates one fixed block that is carved linearly by
    /// [`Allocator::allocate_pool_buffer`].
    pub fn allocate_buffer_pool(&self, byte_size: u64, preset: BufferPreset) -> Result<MemoryPool<B>> {
        let block = self.allocate_named_buffer(&BufferInfo {
            debug_name: "memory pool",
            byte_size,
            preset,
        })?;
        let alignment = self.backend.limits().min_pool_alignment.max(1);
        log::debug!("created {:?} pool of {} bytes", preset, byte_size);
        Ok(MemoryPool {
            shared: Arc::new(PoolShared {
                block,
                preset,
                alignment,
                state: Mutex::new(LinearState::default()),
            }),
        })
    }

    /// Carves `byte_size` bytes out of `pool`, or `None` when no contiguous
    /// range is left. Never touches the device.
    pub fn allocate_pool_buffer(
        &self,
        pool: &MemoryPool<B>,
        byte_size: u64,
    ) -> Option<PoolAllocation<B>> {
        pool.shared.allocate(byte_size).map(|offset| PoolAllocation {
            pool: pool.shared.clone(),
            offset,
            size: byte_size,
        })
    }

    fn check_size(&self, byte_size: u64) -> Result<()> {
        if byte_size == 0 {
            return Err(GPUError::invalid("zero-sized allocation"));
        }
        let limit = self.backend.limits().max_allocation_size;
        if byte_size > limit {
            self.counters.failed_allocations.fetch_add(1, Ordering::Relaxed);
            log::warn!("refusing {} byte allocation, device limit is {}", byte_size, limit);
            return Err(GPUError::OutOfMemory {
                requested: byte_size,
                limit,
            });
        }
        Ok(())
    }

    fn on_failure(&self, err: GPUError, requested: u64) -> GPUError {
        self.counters.failed_allocations.fetch_add(1, Ordering::Relaxed);
        match err {
            GPUError::OutOfMemory { .. } => GPUError::OutOfMemory {
                requested,
                limit: self.backend.limits().max_allocation_size,
            },
            other => other,
        }
    }

    fn track(
        &self,
        resource: Resource,
        memory: B::Memory,
        mapped: Option<MappedPtr>,
        byte_size: u64,
    ) -> Allocation<B> {
        self.counters.add(byte_size);
        Allocation {
            backend: self.backend.clone(),
            counters: self.counters.clone(),
            resource,
            memory: ManuallyDrop::new(memory),
            mapped,
            byte_size,
        }
    }
}

/// A dedicated buffer or image. Destroyed on drop by the allocator that made it.
pub struct Allocation<B: Backend> {
    backend: Arc<B>,
    counters: Arc<Counters>,
    resource: Resource,
    memory: ManuallyDrop<B::Memory>,
    mapped: Option<MappedPtr>,
    byte_size: u64,
}

impl<B: Backend> std::fmt::Debug for Allocation<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Allocation")
            .field("resource", &self.resource)
            .field("byte_size", &self.byte_size)
            .field("mapped", &self.mapped.is_some())
            .finish()
    }
}

impl<B: Backend> Allocation<B> {
    pub fn resource(&self) -> Resource {
        self.resource
    }

    pub fn buffer(&self) -> Option<vk::Buffer> {
        match self.resource {
            Resource::Buffer(b) => Some(b),
            Resource::Image(_) => None,
        }
    }

    pub fn image(&self) -> Option<vk::Image> {
        match self.resource {
            Resource::Image(i) => Some(i),
            Resource::Buffer(_) => None,
        }
    }

    pub fn byte_size(&self) -> u64 {
        self.byte_size
    }

    pub fn mapped(&self) -> Option<MappedPtr> {
        self.mapped
    }

    pub fn memory(&self) -> &B::Memory {
        &self.memory
    }

    /// Host view of the whole allocation, `None` unless host visible.
    pub fn as_mut_slice(&mut self) -> Option<&mut [u8]> {
        let ptr = self.mapped?;
        Some(unsafe { std::slice::from_raw_parts_mut(ptr.as_ptr(), self.byte_size as usize) })
    }

    pub fn write(&mut self, offset: u64, bytes: &[u8]) -> Result<()> {
        write_mapped(self.mapped, self.byte_size, offset, bytes)
    }

    pub fn flush(&self, offset: u64, size: u64) -> Result<()> {
        self.backend.flush(&self.memory, offset, size)
    }

    /// Returns the allocation to its allocator right away.
    pub fn free(self) {}
}

impl<B: Backend> Drop for Allocation<B> {
    fn drop(&mut self) {
        // SAFETY: `memory` is never touched again after this point.
        let memory = unsafe { ManuallyDrop::take(&mut self.memory) };
        match self.resource {
            Resource::Buffer(buffer) => self.backend.destroy_buffer(buffer, memory),
            Resource::Image(image) => self.backend.destroy_image(image, memory),
        }
        self.counters.remove(self.byte_size);
    }
}

fn write_mapped(mapped: Option<MappedPtr>, len: u64, offset: u64, bytes: &[u8]) -> Result<()> {
    let ptr = mapped.ok_or_else(|| GPUError::invalid("allocation is not host visible"))?;
    let end = offset
        .checked_add(bytes.len() as u64)
        .filter(|end| *end <= len)
        .ok_or_else(|| GPUError::invalid("write past the end of the allocation"))?;
    debug_assert!(end <= len);
    unsafe {
        std::ptr::copy_nonoverlapping(
            bytes.as_ptr(),
            ptr.as_ptr().add(offset as usize),
            bytes.len(),
        );
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub capacity: u64,
    pub used: u64,
    pub live: usize,
    pub high_water: u64,
}

#[derive(Default)]
struct LinearState {
    head: u64,
    // offset -> end of every live range
    live: BTreeMap<u64, u64>,
    used: u64,
    high_water: u64,
}

struct PoolShared<B: Backend> {
    block: Allocation<B>,
    preset: BufferPreset,
    alignment: u64,
    state: Mutex<LinearState>,
}

impl<B: Backend> PoolShared<B> {
    fn allocate(&self, byte_size: u64) -> Option<u64> {
        if byte_size == 0 {
            return None;
        }
        let mut state = self.state.lock();
        let offset = align_up(state.head, self.alignment);
        let end = offset.checked_add(byte_size)?;
        if end > self.block.byte_size() {
            log::trace!(
                "pool exhausted: {} bytes requested at head {} of {}",
                byte_size,
                state.head,
                self.block.byte_size()
            );
            return None;
        }
        state.head = end;
        state.live.insert(offset, end);
        state.used += byte_size;
        state.high_water = state.high_water.max(end);
        Some(offset)
    }

    fn release(&self, offset: u64, size: u64) {
        let mut state = self.state.lock();
        let Some(end) = state.live.remove(&offset) else {
            return;
        };
        state.used -= size;
        if end == state.head {
            state.head = state.live.values().next_back().copied().unwrap_or(0);
        }
        if state.live.is_empty() {
            state.head = 0;
        }
    }
}

fn align_up(value: u64, alignment: u64) -> u64 {
    value.div_ceil(alignment) * alignment
}

/// A single fixed block carved into [`PoolAllocation`]s.
///
/// The block outlives every range drawn from it: each range keeps the pool
/// alive until it is dropped.
pub struct MemoryPool<B: Backend> {
    shared: Arc<PoolShared<B>>,
}

impl<B: Backend> Clone for MemoryPool<B> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<B: Backend> MemoryPool<B> {
    pub fn capacity(&self) -> u64 {
        self.shared.block.byte_size()
    }

    pub fn preset(&self) -> BufferPreset {
        self.shared.preset
    }

    pub fn buffer(&self) -> vk::Buffer {
        self.shared.block.buffer().unwrap_or_default()
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.shared.state.lock();
        PoolStats {
            capacity: self.capacity(),
            used: state.used,
            live: state.live.len(),
            high_water: state.high_water,
        }
    }
}

/// A byte range of a [`MemoryPool`] block. Returned to its pool on drop.
pub struct PoolAllocation<B: Backend> {
    pool: Arc<PoolShared<B>>,
    offset: u64,
    size: u64,
}

impl<B: Backend> std::fmt::Debug for PoolAllocation<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolAllocation")
            .field("buffer", &self.buffer())
            .field("offset", &self.offset)
            .field("size", &self.size)
            .finish()
    }
}

impl<B: Backend> PoolAllocation<B> {
    pub fn buffer(&self) -> vk::Buffer {
        self.pool.block.buffer().unwrap_or_default()
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn mapped(&self) -> Option<MappedPtr> {
        // SAFETY: `offset` lies inside the block.
        self.pool
            .block
            .mapped()
            .map(|ptr| unsafe { ptr.add(self.offset) })
    }

    pub fn as_mut_slice(&mut self) -> Option<&mut [u8]> {
        let ptr = self.mapped()?;
        Some(unsafe { std::slice::from_raw_parts_mut(ptr.as_ptr(), self.size as usize) })
    }

    pub fn write(&mut self, offset: u64, bytes: &[u8]) -> Result<()> {
        write_mapped(self.mapped(), self.size, offset, bytes)
    }

    /// Flushes `[offset, offset + size)` relative to this range.
    pub fn flush(&self, offset: u64, size: u64) -> Result<()> {
        self.pool.block.flush(self.offset + offset, size)
    }
}

impl<B: Backend> Drop for PoolAllocation<B> {
    fn drop(&mut self) {
        self.pool.release(self.offset, self.size);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::{DeviceLimits, NullBackend, NullConfig};

    fn allocator() -> Allocator<NullBackend> {
        Allocator::new(Arc::new(NullBackend::new(NullConfig {
            limits: DeviceLimits {
                max_allocation_size: 1 << 20,
                min_pool_alignment: 64,
                ..Default::default()
            },
            ..Default::default()
        })))
    }

    #[test]
    fn dedicated_allocations_are_tracked_and_freed() {
        let alloc = allocator();
        let mut a = alloc.allocate_buffer(128, BufferPreset::Staging).unwrap();
        a.write(0, &[1, 2, 3]).unwrap();
        assert_eq!(&a.as_mut_slice().unwrap()[..3], &[1, 2, 3]);
        assert_eq!(alloc.stats().live_bytes, 128);

        a.free();
        assert_eq!(alloc.stats(), AllocatorStats::default());
    }

    #[test]
    fn device_local_memory_has_no_host_view() {
        let alloc = allocator();
        let mut a = alloc.allocate_buffer(16, BufferPreset::DeviceLocal).unwrap();
        assert!(a.as_mut_slice().is_none());
        assert!(matches!(a.write(0, &[0]), Err(GPUError::InvalidArgument { .. })));
    }

    #[test]
    fn zero_sized_allocation_is_invalid() {
        let alloc = allocator();
        let err = alloc.allocate_buffer(0, BufferPreset::DeviceLocal).unwrap_err();
        assert!(matches!(err, GPUError::InvalidArgument { .. }));
    }

    #[test]
    fn linear_pool_rolls_head_back_when_top_is_freed() {
        let alloc = allocator();
        let pool = alloc.allocate_buffer_pool(256, BufferPreset::Dynamic).unwrap();

        let a = alloc.allocate_pool_buffer(&pool, 10).unwrap();
        let b = alloc.allocate_pool_buffer(&pool, 10).unwrap();
        assert_eq!((a.offset(), b.offset()), (0, 64));

        drop(b);
        let c = alloc.allocate_pool_buffer(&pool, 10).unwrap();
        assert_eq!(c.offset(), 64);

        drop(a);
        // Freeing below the head leaves the head where it is.
        let d = alloc.allocate_pool_buffer(&pool, 10).unwrap();
        assert_eq!(d.offset(), 128);
        assert_eq!(pool.stats().live, 2);
        assert_eq!(pool.stats().high_water, 138);
    }

    #[test]
    fn pool_outlives_its_handle() {
        let alloc = allocator();
        let pool = alloc.allocate_buffer_pool(64, BufferPreset::Staging).unwrap();
        let mut range = alloc.allocate_pool_buffer(&pool, 64).unwrap();
        drop(pool);
        range.write(60, &[7; 4]).unwrap();
        assert_eq!(alloc.stats().live_allocations, 1);
        drop(range);
        assert_eq!(alloc.stats().live_allocations, 0);
    }
}

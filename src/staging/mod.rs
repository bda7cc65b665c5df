//! Bounded host-writable arena that payloads are staged through.
//!
//! Requests that do not fit wait in a FIFO and are granted from
//! [`StagingRing::poll_pending`] once earlier regions have been released.
//! A [`Region`] never calls back into the ring when it is dropped; it only
//! pushes its range onto a release queue the ring drains on its next call.
//!
//! Grants are attempted with the queue lock released. Under heavy contention
//! a request arriving while another thread is between its "queue empty"
//! check and its allocation attempt can be served ahead of it.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use ash::vk;
use crossbeam_queue::SegQueue;
use futures::channel::oneshot;
use parking_lot::Mutex;

use crate::gpu::error::{GPUError, Result};
use crate::gpu::{Allocator, Backend, BufferPreset, MappedPtr, MemoryPool, PoolAllocation};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StagingStats {
    pub capacity: u64,
    pub free_bytes: u64,
    pub largest_free: u64,
    pub pending: usize,
    pub granted_total: u64,
}

struct PendingAllocationRequest<B: Backend> {
    byte_size: u64,
    sender: oneshot::Sender<Region<B>>,
}

struct RingShared<B: Backend> {
    block: PoolAllocation<B>,
    base: MappedPtr,
    capacity: u64,
    // Every grant is rounded up to this, which keeps all offsets aligned to it.
    granularity: u64,
    arena: Mutex<offset_allocator::Allocator>,
    pending: Mutex<VecDeque<PendingAllocationRequest<B>>>,
    // serializes queue draining so the front request is stable while granting
    draining: Mutex<()>,
    releases: SegQueue<offset_allocator::Allocation>,
    granted_total: AtomicU64,
}

impl<B: Backend> RingShared<B> {
    fn reclaim(&self) {
        if self.releases.is_empty() {
            return;
        }
        let mut arena = self.arena.lock();
        while let Some(alloc) = self.releases.pop() {
            arena.free(alloc);
        }
    }

    fn reserved(&self, byte_size: u64) -> u64 {
        byte_size.div_ceil(self.granularity) * self.granularity
    }

    fn try_grant(self: &Arc<Self>, byte_size: u64) -> Option<Region<B>> {
        let alloc = self.arena.lock().allocate(self.reserved(byte_size) as u32)?;
        self.granted_total.fetch_add(1, Ordering::Relaxed);
        log::trace!(
            "staging grant of {} bytes at offset {}",
            byte_size,
            alloc.offset
        );
        Some(Region {
            ring: self.clone(),
            alloc,
            size: byte_size,
        })
    }
}

/// Staging arena over one host-visible pool block.
pub struct StagingRing<B: Backend> {
    shared: Arc<RingShared<B>>,
}

impl<B: Backend> Clone for StagingRing<B> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<B: Backend> StagingRing<B> {
    /// Creates a staging pool of `byte_size` bytes and takes all of it.
    pub fn new(allocator: &Allocator<B>, byte_size: u64) -> Result<Self> {
        Self::with_granularity(allocator, byte_size, 1)
    }

    /// Like [`StagingRing::new`], but every [`Region::offset`] is a multiple
    /// of `granularity`.
    pub fn with_granularity(
        allocator: &Allocator<B>,
        byte_size: u64,
        granularity: u64,
    ) -> Result<Self> {
        let pool = allocator.allocate_buffer_pool(byte_size, BufferPreset::Staging)?;
        Self::from_pool(allocator, &pool, granularity)
    }

    /// Takes the whole of `pool`, which must be host visible and empty.
    pub fn from_pool(
        allocator: &Allocator<B>,
        pool: &MemoryPool<B>,
        granularity: u64,
    ) -> Result<Self> {
        if pool.capacity() > u32::MAX as u64 {
            return Err(GPUError::invalid("staging arena larger than 4 GiB"));
        }
        if granularity == 0 {
            return Err(GPUError::invalid("staging granularity must be non-zero"));
        }
        let block = allocator
            .allocate_pool_buffer(pool, pool.capacity())
            .ok_or_else(|| GPUError::invalid("staging pool already in use"))?;
        if block.offset() % granularity != 0 {
            return Err(GPUError::invalid(format!(
                "staging block at {} is not aligned to {}",
                block.offset(),
                granularity
            )));
        }
        let base = block
            .mapped()
            .ok_or_else(|| GPUError::invalid("staging pool is not host visible"))?;

        let arena: offset_allocator::Allocator = offset_allocator::Allocator::new(block.size() as u32);
        // Sizes are bucketed, so the usable capacity can be below the block size.
        let largest = arena.storage_report().largest_free_region as u64;
        let capacity = largest / granularity * granularity;
        log::debug!(
            "staging ring over {} bytes ({} usable, granularity {})",
            block.size(),
            capacity,
            granularity
        );

        Ok(Self {
            shared: Arc::new(RingShared {
                block,
                base,
                capacity,
                granularity,
                arena: Mutex::new(arena),
                pending: Mutex::new(VecDeque::new()),
                draining: Mutex::new(()),
                releases: SegQueue::new(),
                granted_total: AtomicU64::new(0),
            }),
        })
    }

    pub fn capacity(&self) -> u64 {
        self.shared.capacity
    }

    pub fn buffer(&self) -> vk::Buffer {
        self.shared.block.buffer()
    }

    /// Requests `byte_size` contiguous bytes.
    ///
    /// Resolves immediately when nothing is queued and the space is free.
    /// Otherwise the request joins the back of the queue and resolves from a
    /// later [`StagingRing::poll_pending`]. Requests that can never fit fail
    /// with [`GPUError::InvalidArgument`].
    pub fn enqueue_allocation(&self, byte_size: u64) -> RegionFuture<B> {
        if byte_size == 0 {
            return RegionFuture::failed(GPUError::invalid("zero-sized staging request"));
        }
        if self.shared.reserved(byte_size) > self.shared.capacity {
            return RegionFuture::failed(GPUError::invalid(format!(
                "staging request of {} bytes exceeds arena capacity {}",
                byte_size, self.shared.capacity
            )));
        }

        self.shared.reclaim();

        if self.shared.pending.lock().is_empty() {
            if let Some(region) = self.shared.try_grant(byte_size) {
                return RegionFuture::ready(region);
            }
        }

        let (sender, receiver) = oneshot::channel();
        let mut pending = self.shared.pending.lock();
        pending.push_back(PendingAllocationRequest { byte_size, sender });
        log::trace!(
            "staging request of {} bytes queued behind {} others",
            byte_size,
            pending.len() - 1
        );
        RegionFuture::waiting(receiver)
    }

    /// Grants queued requests in arrival order until the front one does not
    /// fit. Returns the number of requests granted.
    pub fn poll_pending(&self) -> usize {
        let _draining = self.shared.draining.lock();
        self.shared.reclaim();

        let mut granted = 0;
        loop {
            let byte_size = {
                let mut pending = self.shared.pending.lock();
                while pending.front().is_some_and(|r| r.sender.is_canceled()) {
                    pending.pop_front();
                }
                match pending.front() {
                    Some(request) => request.byte_size,
                    None => break,
                }
            };

            let Some(region) = self.shared.try_grant(byte_size) else {
                break;
            };

            let request = self.shared.pending.lock().pop_front();
            match request.map(|r| r.sender.send(region)) {
                Some(Ok(())) => granted += 1,
                // Receiver went away after the check; the region goes back
                // through the release queue.
                Some(Err(region)) => {
                    drop(region);
                    self.shared.reclaim();
                }
                None => {}
            }
        }
        granted
    }

    pub fn pending_count(&self) -> usize {
        self.shared.pending.lock().len()
    }

    pub fn stats(&self) -> StagingStats {
        self.shared.reclaim();
        let report = self.shared.arena.lock().storage_report();
        StagingStats {
            capacity: self.shared.capacity,
            free_bytes: report.total_free_space as u64,
            largest_free: report.largest_free_region as u64,
            pending: self.pending_count(),
            granted_total: self.shared.granted_total.load(Ordering::Relaxed),
        }
    }
}

/// A granted range of the staging arena. Released when dropped.
pub struct Region<B: Backend> {
    ring: Arc<RingShared<B>>,
    alloc: offset_allocator::Allocation,
    size: u64,
}

impl<B: Backend> std::fmt::Debug for Region<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Region")
            .field("offset", &self.offset())
            .field("size", &self.size)
            .finish()
    }
}

impl<B: Backend> Region<B> {
    /// Byte offset into [`Region::buffer`].
    pub fn offset(&self) -> u64 {
        self.ring.block.offset() + u64::from(self.alloc.offset)
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn buffer(&self) -> vk::Buffer {
        self.ring.block.buffer()
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: live regions never overlap and the block stays mapped while
        // the ring is alive.
        unsafe {
            let ptr = self.ring.base.add(u64::from(self.alloc.offset));
            std::slice::from_raw_parts_mut(ptr.as_ptr(), self.size as usize)
        }
    }

    pub fn write(&mut self, offset: u64, bytes: &[u8]) -> Result<()> {
        let end = offset
            .checked_add(bytes.len() as u64)
            .filter(|end| *end <= self.size)
            .ok_or_else(|| GPUError::invalid("write past the end of the staging region"))?;
        self.as_mut_slice()[offset as usize..end as usize].copy_from_slice(bytes);
        Ok(())
    }

    pub fn flush(&self) -> Result<()> {
        self.ring
            .block
            .flush(u64::from(self.alloc.offset), self.size)
    }
}

impl<B: Backend> Drop for Region<B> {
    fn drop(&mut self) {
        self.ring.releases.push(self.alloc);
    }
}

enum RegionState<B: Backend> {
    Ready(Option<Result<Region<B>>>),
    Waiting(oneshot::Receiver<Region<B>>),
}

/// Resolves to a [`Region`] once the arena grants the request.
///
/// Dropping it before it resolves withdraws the request.
pub struct RegionFuture<B: Backend> {
    state: RegionState<B>,
}

impl<B: Backend> RegionFuture<B> {
    fn ready(region: Region<B>) -> Self {
        Self {
            state: RegionState::Ready(Some(Ok(region))),
        }
    }

    fn failed(err: GPUError) -> Self {
        Self {
            state: RegionState::Ready(Some(Err(err))),
        }
    }

    fn waiting(receiver: oneshot::Receiver<Region<B>>) -> Self {
        Self {
            state: RegionState::Waiting(receiver),
        }
    }

    /// True when the request was queued rather than granted on the spot.
    pub fn is_queued(&self) -> bool {
        matches!(self.state, RegionState::Waiting(_))
    }
}

impl<B: Backend> Future for RegionFuture<B> {
    type Output = Result<Region<B>>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match &mut this.state {
            RegionState::Ready(result) => match result.take() {
                Some(result) => Poll::Ready(result),
                None => Poll::Ready(Err(GPUError::Abandoned)),
            },
            RegionState::Waiting(receiver) => match Pin::new(receiver).poll(cx) {
                Poll::Ready(Ok(region)) => Poll::Ready(Ok(region)),
                Poll::Ready(Err(oneshot::Canceled)) => Poll::Ready(Err(GPUError::Abandoned)),
                Poll::Pending => Poll::Pending,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::NullBackend;
    use futures::FutureExt;

    fn ring(size: u64) -> StagingRing<NullBackend> {
        let allocator = Allocator::new(Arc::new(NullBackend::default()));
        StagingRing::new(&allocator, size).unwrap()
    }

    #[test]
    fn impossible_requests_fail_immediately() {
        let ring = ring(1024);
        let err = ring.enqueue_allocation(0).now_or_never().unwrap().unwrap_err();
        assert!(matches!(err, GPUError::InvalidArgument { .. }));
        let err = ring
            .enqueue_allocation(ring.capacity() + 1)
            .now_or_never()
            .unwrap()
            .unwrap_err();
        assert!(matches!(err, GPUError::InvalidArgument { .. }));
        assert_eq!(ring.pending_count(), 0);
    }

    #[test]
    fn withdrawn_requests_are_skipped() {
        let ring = ring(1024);
        let held = ring.enqueue_allocation(1024).now_or_never().unwrap().unwrap();

        let withdrawn = ring.enqueue_allocation(512);
        let mut waiting = ring.enqueue_allocation(256);
        assert!(withdrawn.is_queued() && waiting.is_queued());
        drop(withdrawn);
        drop(held);

        assert_eq!(ring.poll_pending(), 1);
        let region = (&mut waiting).now_or_never().unwrap().unwrap();
        assert_eq!(region.offset(), 0);
        assert_eq!(ring.pending_count(), 0);
    }

    #[test]
    fn granularity_keeps_offsets_aligned() {
        let allocator = Allocator::new(Arc::new(NullBackend::default()));
        let ring = StagingRing::with_granularity(&allocator, 1024, 16).unwrap();
        let a = ring.enqueue_allocation(10).now_or_never().unwrap().unwrap();
        let b = ring.enqueue_allocation(3).now_or_never().unwrap().unwrap();
        assert_eq!((a.offset(), a.size()), (0, 10));
        assert_eq!((b.offset(), b.size()), (16, 3));
        drop((a, b));

        // Rounded up, 1020 bytes still take the whole arena.
        let whole = ring.enqueue_allocation(1020).now_or_never().unwrap().unwrap();
        assert_eq!(whole.offset(), 0);
        let mut next = ring.enqueue_allocation(1);
        assert!(next.is_queued());
        drop(whole);
        assert_eq!(ring.poll_pending(), 1);
        assert_eq!((&mut next).now_or_never().unwrap().unwrap().offset(), 0);
    }

    #[test]
    fn region_writes_land_in_the_staging_buffer() {
        let allocator = Allocator::new(Arc::new(NullBackend::default()));
        let ring = StagingRing::new(&allocator, 256).unwrap();
        let mut region = ring.enqueue_allocation(4).now_or_never().unwrap().unwrap();
        region.write(1, &[5, 6]).unwrap();
        region.flush().unwrap();
        assert!(region.write(3, &[0, 0]).is_err());

        let contents = allocator.backend().buffer_contents(ring.buffer()).unwrap();
        let at = region.offset() as usize;
        assert_eq!(&contents[at..at + 4], &[0, 5, 6, 0]);
    }
}

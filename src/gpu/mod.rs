use ash::vk;

pub mod error;
pub mod memory;
pub mod null;
pub mod structs;
#[cfg(feature = "vulkan")]
pub mod vulkan;

pub use error::{GPUError, Result, VulkanError};
pub use memory::{Allocation, Allocator, AllocatorStats, MemoryPool, PoolAllocation, PoolStats};
pub use null::{NullBackend, NullConfig, NullEvent};
pub use structs::*;
#[cfg(feature = "vulkan")]
pub use vulkan::VulkanBackend;

use crate::sync::TransferStep;

/// Defines the interface that device backends must implement.
///
/// A backend owns the device and its queues and exposes exactly the
/// capabilities the allocation and transfer paths need: resource creation,
/// command recording, timeline semaphores and queue submission.
///
/// Recording goes through `&mut Self::Recorder`. The transfer paths only ever
/// hold one recorder, behind [`crate::sync::RecordingContext`], so holding its
/// guard is what grants the right to record.
///
/// # Examples
/// ```ignore
/// use stagecoach::gpu::{Backend, BufferInfo, BufferPreset};
/// fn scratch<B: Backend>(backend: &B) -> stagecoach::Result<()> {
///     let raw = backend.create_buffer(&BufferInfo {
///         debug_name: "scratch",
///         byte_size: 4096,
///         preset: BufferPreset::Staging,
///     })?;
///     backend.destroy_buffer(raw.buffer, raw.memory);
///     Ok(())
/// }
/// ```
pub trait Backend: Send + Sync + 'static {
    /// Backend specific memory descriptor attached to every resource.
    type Memory: Send + Sync;
    /// Backend specific command recording state.
    type Recorder: Send;

    fn queue_family(&self, queue: QueueType) -> u32;
    fn limits(&self) -> DeviceLimits;

    fn create_buffer(&self, info: &BufferInfo) -> Result<RawBuffer<Self::Memory>>;
    fn create_image(&self, info: &ImageInfo) -> Result<RawImage<Self::Memory>>;
    fn destroy_buffer(&self, buffer: vk::Buffer, memory: Self::Memory);
    fn destroy_image(&self, image: vk::Image, memory: Self::Memory);
    /// Makes host writes to `[offset, offset + size)` visible to the device.
    fn flush(&self, memory: &Self::Memory, offset: u64, size: u64) -> Result<()>;

    fn create_recorder(&self) -> Result<Self::Recorder>;
    /// Records `steps` into a fresh primary command buffer for `queue`.
    fn record(
        &self,
        recorder: &mut Self::Recorder,
        queue: QueueType,
        debug_name: &str,
        steps: &[TransferStep],
    ) -> Result<vk::CommandBuffer>;
    /// Returns a command buffer whose execution has completed.
    fn recycle(&self, recorder: &mut Self::Recorder, queue: QueueType, cmd: vk::CommandBuffer);
    fn destroy_recorder(&self, recorder: Self::Recorder);

    fn create_timeline(&self, initial: u64) -> Result<vk::Semaphore>;
    fn destroy_timeline(&self, semaphore: vk::Semaphore);
    fn timeline_value(&self, semaphore: vk::Semaphore) -> Result<u64>;

    fn submit(&self, queue: QueueType, submission: &NativeSubmission) -> Result<()>;
}

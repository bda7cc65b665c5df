//! GPU memory pools, a bounded staging arena and cross-queue transfer
//! batching for Vulkan renderers.
//!
//! The pieces build on each other:
//! - [`gpu::Allocator`] creates dedicated resources and fixed pools.
//! - [`staging::StagingRing`] hands out host-writable ranges and queues
//!   requests that do not fit yet.
//! - [`sync::BarrierSequenceBuilder`] builds the barrier sequence that moves a
//!   resource from a copy queue to its consumer.
//! - [`submit::SubmissionBatcher`] batches command buffers per queue and
//!   detects completion by polling timeline semaphores.
//! - [`transfer::TransferOrchestrator`] runs whole uploads on top of the above.
//!
//! Everything is generic over a [`gpu::Backend`]. [`gpu::NullBackend`] runs
//! without a device; the `vulkan` feature adds [`gpu::VulkanBackend`].

pub mod config;
pub mod gpu;
pub mod staging;
pub mod submit;
pub mod sync;
pub mod transfer;

pub use config::TransferConfig;
pub use gpu::error::{GPUError, Result};
pub use gpu::{Allocation, Allocator, Backend, MemoryPool, PoolAllocation, QueueType};
pub use staging::{Region, StagingRing};
pub use submit::{Completion, SubmissionBatcher, TimelineCounter};
pub use sync::CancelToken;
pub use transfer::{FrameReport, TransferOrchestrator, Upload, UploadOptions, UploadTarget};

use ash::vk;
#[cfg(feature = "vulkan")]
use smallvec::SmallVec;

use crate::gpu::error::{GPUError, Result};
use crate::gpu::QueueType;
use crate::sync::state::{ImageLayout, ResState};

/// A queue together with the family index it belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct QueueEndpoint {
    pub queue: QueueType,
    pub family: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransferTarget {
    Buffer {
        buffer: vk::Buffer,
        offset: u64,
    },
    Image {
        image: vk::Image,
        extent: [u32; 3],
        mip_level: u32,
        base_layer: u32,
        layer_count: u32,
        aspect: vk::ImageAspectFlags,
    },
}

/// One copy out of a staging range into a destination resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransferDescriptor {
    pub src: vk::Buffer,
    pub src_offset: u64,
    pub size: u64,
    pub dst: TransferTarget,
    /// How the destination is used once the transfer finished.
    pub consumer: ResState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BarrierTarget {
    Buffer {
        buffer: vk::Buffer,
        offset: u64,
        size: u64,
    },
    Image {
        image: vk::Image,
        aspect: vk::ImageAspectFlags,
        mip_level: u32,
        base_layer: u32,
        layer_count: u32,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BarrierStep {
    pub target: BarrierTarget,
    pub src: ResState,
    pub dst: ResState,
    pub src_family: u32,
    pub dst_family: u32,
}

impl BarrierStep {
    pub fn is_ownership_transfer(&self) -> bool {
        self.src_family != self.dst_family
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransferStep {
    Barrier(BarrierStep),
    CopyBuffer {
        src: vk::Buffer,
        src_offset: u64,
        dst: vk::Buffer,
        dst_offset: u64,
        size: u64,
    },
    CopyBufferToImage {
        src: vk::Buffer,
        src_offset: u64,
        image: vk::Image,
        extent: [u32; 3],
        mip_level: u32,
        base_layer: u32,
        layer_count: u32,
        aspect: vk::ImageAspectFlags,
    },
}

/// A step tagged with the queue whose command stream must record it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ScheduledStep {
    pub queue: QueueType,
    pub step: TransferStep,
}

/// The four steps that move a freshly copied resource from one queue family
/// to another: pre-copy barrier, copy, release, acquire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OwnershipTransfer {
    pub steps: [ScheduledStep; 4],
}

impl OwnershipTransfer {
    /// Steps recorded on the producing queue, in order.
    pub fn producer(&self) -> &[ScheduledStep] {
        &self.steps[..3]
    }

    /// The acquire barrier recorded on the consuming queue.
    pub fn consumer(&self) -> &ScheduledStep {
        &self.steps[3]
    }
}

pub struct BarrierSequenceBuilder;

impl BarrierSequenceBuilder {
    /// Builds the release/acquire sequence handing the destination of `desc`
    /// from `src` to `dst`.
    ///
    /// Fails with [`GPUError::ProtocolViolation`] when both endpoints share a
    /// family; use [`BarrierSequenceBuilder::same_queue`] for that case.
    pub fn ownership_transfer(
        src: QueueEndpoint,
        dst: QueueEndpoint,
        desc: &TransferDescriptor,
    ) -> Result<OwnershipTransfer> {
        if src.family == dst.family {
            return Err(GPUError::ProtocolViolation { family: src.family });
        }

        let target = barrier_target(desc);
        let consumer = consumer_state(desc.consumer);

        let pre = ScheduledStep {
            queue: src.queue,
            step: TransferStep::Barrier(BarrierStep {
                target,
                src: ResState::undefined(),
                dst: ResState::transfer_dst(),
                src_family: vk::QUEUE_FAMILY_IGNORED,
                dst_family: vk::QUEUE_FAMILY_IGNORED,
            }),
        };
        let copy = ScheduledStep {
            queue: src.queue,
            step: copy_step(desc),
        };
        let release = ScheduledStep {
            queue: src.queue,
            step: TransferStep::Barrier(BarrierStep {
                target,
                src: ResState::transfer_dst(),
                dst: ResState::handoff(consumer.layout),
                src_family: src.family,
                dst_family: dst.family,
            }),
        };
        let acquire = ScheduledStep {
            queue: dst.queue,
            step: TransferStep::Barrier(BarrierStep {
                target,
                src: ResState::handoff(ImageLayout::TRANSFER_DST),
                dst: consumer,
                src_family: src.family,
                dst_family: dst.family,
            }),
        };

        Ok(OwnershipTransfer {
            steps: [pre, copy, release, acquire],
        })
    }

    /// Pre-barrier, copy and post-barrier on a single queue, no ownership change.
    pub fn same_queue(queue: QueueType, desc: &TransferDescriptor) -> [ScheduledStep; 3] {
        let target = barrier_target(desc);
        let barrier = |src: ResState, dst: ResState| ScheduledStep {
            queue,
            step: TransferStep::Barrier(BarrierStep {
                target,
                src,
                dst,
                src_family: vk::QUEUE_FAMILY_IGNORED,
                dst_family: vk::QUEUE_FAMILY_IGNORED,
            }),
        };

        [
            barrier(ResState::undefined(), ResState::transfer_dst()),
            ScheduledStep {
                queue,
                step: copy_step(desc),
            },
            barrier(ResState::transfer_dst(), consumer_state(desc.consumer)),
        ]
    }
}

fn consumer_state(consumer: ResState) -> ResState {
    ResState {
        layout: ImageLayout::SHADER_READ_ONLY,
        ..consumer
    }
}

fn barrier_target(desc: &TransferDescriptor) -> BarrierTarget {
    match desc.dst {
        TransferTarget::Buffer { buffer, offset } => BarrierTarget::Buffer {
            buffer,
            offset,
            size: desc.size,
        },
        TransferTarget::Image {
            image,
            mip_level,
            base_layer,
            layer_count,
            aspect,
            ..
        } => BarrierTarget::Image {
            image,
            aspect,
            mip_level,
            base_layer,
            layer_count,
        },
    }
}

fn copy_step(desc: &TransferDescriptor) -> TransferStep {
    match desc.dst {
        TransferTarget::Buffer { buffer, offset } => TransferStep::CopyBuffer {
            src: desc.src,
            src_offset: desc.src_offset,
            dst: buffer,
            dst_offset: offset,
            size: desc.size,
        },
        TransferTarget::Image {
            image,
            extent,
            mip_level,
            base_layer,
            layer_count,
            aspect,
        } => TransferStep::CopyBufferToImage {
            src: desc.src,
            src_offset: desc.src_offset,
            image,
            extent,
            mip_level,
            base_layer,
            layer_count,
            aspect,
        },
    }
}

/// Collects barriers and flushes them with one `vkCmdPipelineBarrier2`.
#[cfg(feature = "vulkan")]
pub struct BarrierBuilder {
    images: SmallVec<[vk::ImageMemoryBarrier2; 4]>,
    buffers: SmallVec<[vk::BufferMemoryBarrier2; 4]>,
}

#[cfg(feature = "vulkan")]
impl BarrierBuilder {
    pub fn new() -> Self {
        Self {
            images: SmallVec::new(),
            buffers: SmallVec::new(),
        }
    }

    pub fn push(&mut self, step: &BarrierStep) {
        if step.src == step.dst && !step.is_ownership_transfer() {
            return;
        }
        match step.target {
            BarrierTarget::Image {
                image,
                aspect,
                mip_level,
                base_layer,
                layer_count,
            } => self.images.push(vk::ImageMemoryBarrier2 {
                src_stage_mask: step.src.stages.into(),
                src_access_mask: step.src.access.into(),
                dst_stage_mask: step.dst.stages.into(),
                dst_access_mask: step.dst.access.into(),
                old_layout: step.src.layout.into(),
                new_layout: step.dst.layout.into(),
                src_queue_family_index: step.src_family,
                dst_queue_family_index: step.dst_family,
                image,
                subresource_range: vk::ImageSubresourceRange {
                    aspect_mask: aspect,
                    base_mip_level: mip_level,
                    level_count: 1,
                    base_array_layer: base_layer,
                    layer_count,
                },
                ..Default::default()
            }),
            BarrierTarget::Buffer {
                buffer,
                offset,
                size,
            } => self.buffers.push(vk::BufferMemoryBarrier2 {
                src_stage_mask: step.src.stages.into(),
                src_access_mask: step.src.access.into(),
                dst_stage_mask: step.dst.stages.into(),
                dst_access_mask: step.dst.access.into(),
                src_queue_family_index: step.src_family,
                dst_queue_family_index: step.dst_family,
                buffer,
                offset,
                size,
                ..Default::default()
            }),
        }
    }

    pub unsafe fn emit(&mut self, device: &ash::Device, cmd: vk::CommandBuffer) {
        if self.images.is_empty() && self.buffers.is_empty() {
            return;
        }
        let deps = vk::DependencyInfo::builder()
            .image_memory_barriers(&self.images)
            .buffer_memory_barriers(&self.buffers)
            .build();
        device.cmd_pipeline_barrier2(cmd, &deps);
        self.images.clear();
        self.buffers.clear();
    }
}

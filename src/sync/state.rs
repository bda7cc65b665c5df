use ash::vk;
use bitflags::bitflags;
use bytemuck::{Pod, Zeroable};

use crate::gpu::QueueType;

bitflags! {
    #[repr(transparent)]
    #[derive(Default, Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Access: u64 {
        const NONE = 0;
        const INDIRECT_COMMAND_READ = vk::AccessFlags2::INDIRECT_COMMAND_READ.as_raw();
        const INDEX_READ = vk::AccessFlags2::INDEX_READ.as_raw();
        const VERTEX_ATTRIBUTE_READ = vk::AccessFlags2::VERTEX_ATTRIBUTE_READ.as_raw();
        const UNIFORM_READ = vk::AccessFlags2::UNIFORM_READ.as_raw();
        const SHADER_READ = vk::AccessFlags2::SHADER_READ.as_raw();
        const SHADER_WRITE = vk::AccessFlags2::SHADER_WRITE.as_raw();
        const TRANSFER_READ = vk::AccessFlags2::TRANSFER_READ.as_raw();
        const TRANSFER_WRITE = vk::AccessFlags2::TRANSFER_WRITE.as_raw();
        const HOST_READ = vk::AccessFlags2::HOST_READ.as_raw();
        const HOST_WRITE = vk::AccessFlags2::HOST_WRITE.as_raw();
    }
}
unsafe impl Zeroable for Access {}
unsafe impl Pod for Access {}

bitflags! {
    #[repr(transparent)]
    #[derive(Default, Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Stage: u64 {
        const NONE = 0;
        const TOP_OF_PIPE = vk::PipelineStageFlags2::TOP_OF_PIPE.as_raw();
        const DRAW_INDIRECT = vk::PipelineStageFlags2::DRAW_INDIRECT.as_raw();
        const VERTEX_INPUT = vk::PipelineStageFlags2::VERTEX_INPUT.as_raw();
        const VERTEX_SHADER = vk::PipelineStageFlags2::VERTEX_SHADER.as_raw();
        const FRAGMENT_SHADER = vk::PipelineStageFlags2::FRAGMENT_SHADER.as_raw();
        const COMPUTE_SHADER = vk::PipelineStageFlags2::COMPUTE_SHADER.as_raw();
        const TRANSFER = vk::PipelineStageFlags2::TRANSFER.as_raw();
        const BOTTOM_OF_PIPE = vk::PipelineStageFlags2::BOTTOM_OF_PIPE.as_raw();
        const ALL_COMMANDS = vk::PipelineStageFlags2::ALL_COMMANDS.as_raw();
    }
}
unsafe impl Zeroable for Stage {}
unsafe impl Pod for Stage {}

#[repr(transparent)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Pod, Zeroable, Default)]
pub struct ImageLayout(pub i32);

impl ImageLayout {
    pub const UNDEFINED: Self = Self(vk::ImageLayout::UNDEFINED.as_raw());
    pub const TRANSFER_DST: Self = Self(vk::ImageLayout::TRANSFER_DST_OPTIMAL.as_raw());
    pub const SHADER_READ_ONLY: Self = Self(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL.as_raw());
}

impl From<ImageLayout> for vk::ImageLayout {
    fn from(layout: ImageLayout) -> Self {
        vk::ImageLayout::from_raw(layout.0)
    }
}

impl From<vk::ImageLayout> for ImageLayout {
    fn from(layout: vk::ImageLayout) -> Self {
        Self(layout.as_raw())
    }
}

impl From<Access> for vk::AccessFlags2 {
    fn from(acc: Access) -> Self {
        vk::AccessFlags2::from_raw(acc.bits())
    }
}

impl From<Stage> for vk::PipelineStageFlags2 {
    fn from(stage: Stage) -> Self {
        vk::PipelineStageFlags2::from_raw(stage.bits())
    }
}

/// Access, stage and layout of a resource at one side of a barrier.
#[repr(C)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default, Pod, Zeroable)]
pub struct ResState {
    pub access: Access,
    pub stages: Stage,
    pub layout: ImageLayout,
    pub _pad: u32,
}

impl ResState {
    pub const fn new(access: Access, stages: Stage, layout: ImageLayout) -> Self {
        Self {
            access,
            stages,
            layout,
            _pad: 0,
        }
    }

    /// Contents are discarded; nothing has to be waited on.
    pub const fn undefined() -> Self {
        Self::new(Access::NONE, Stage::TOP_OF_PIPE, ImageLayout::UNDEFINED)
    }

    pub const fn transfer_dst() -> Self {
        Self::new(
            Access::TRANSFER_WRITE,
            Stage::TRANSFER,
            ImageLayout::TRANSFER_DST,
        )
    }

    /// Sampled or read from any shader stage.
    pub fn shader_read() -> Self {
        Self::new(
            Access::SHADER_READ,
            Stage::VERTEX_SHADER | Stage::FRAGMENT_SHADER | Stage::COMPUTE_SHADER,
            ImageLayout::SHADER_READ_ONLY,
        )
    }

    /// Read as vertex, index, uniform or storage data.
    pub fn buffer_read() -> Self {
        Self::new(
            Access::VERTEX_ATTRIBUTE_READ
                | Access::INDEX_READ
                | Access::UNIFORM_READ
                | Access::SHADER_READ,
            Stage::VERTEX_INPUT
                | Stage::VERTEX_SHADER
                | Stage::FRAGMENT_SHADER
                | Stage::COMPUTE_SHADER,
            ImageLayout::SHADER_READ_ONLY,
        )
    }

    /// [`ResState::shader_read`] limited to stages `queue` can run.
    pub fn shader_read_on(queue: QueueType) -> Self {
        match queue {
            QueueType::Graphics => Self::shader_read(),
            QueueType::Compute => Self::new(
                Access::SHADER_READ,
                Stage::COMPUTE_SHADER,
                ImageLayout::SHADER_READ_ONLY,
            ),
            QueueType::Transfer => Self::new(
                Access::TRANSFER_READ,
                Stage::TRANSFER,
                ImageLayout::SHADER_READ_ONLY,
            ),
        }
    }

    /// [`ResState::buffer_read`] limited to stages `queue` can run.
    pub fn buffer_read_on(queue: QueueType) -> Self {
        match queue {
            QueueType::Graphics => Self::buffer_read(),
            QueueType::Compute => Self::new(
                Access::UNIFORM_READ | Access::SHADER_READ,
                Stage::COMPUTE_SHADER,
                ImageLayout::SHADER_READ_ONLY,
            ),
            QueueType::Transfer => Self::new(
                Access::TRANSFER_READ,
                Stage::TRANSFER,
                ImageLayout::SHADER_READ_ONLY,
            ),
        }
    }

    /// Same layout, no stage or access: the half of a queue ownership barrier
    /// that the other queue performs.
    pub const fn handoff(layout: ImageLayout) -> Self {
        Self::new(Access::NONE, Stage::NONE, layout)
    }
}

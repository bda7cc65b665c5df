use std::ptr::NonNull;

use ash::vk;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::sync::Stage;

#[repr(C)]
#[derive(Hash, Clone, Copy, Debug, PartialEq, Eq, Default, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum QueueType {
    #[default]
    Graphics,
    Compute,
    Transfer,
}

impl QueueType {
    pub const ALL: [QueueType; 3] = [QueueType::Transfer, QueueType::Compute, QueueType::Graphics];

    pub(crate) fn index(self) -> usize {
        match self {
            QueueType::Graphics => 0,
            QueueType::Compute => 1,
            QueueType::Transfer => 2,
        }
    }
}

/// Named usage/memory combinations buffers are created from.
#[repr(C)]
#[derive(Default, Hash, Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum BufferPreset {
    /// Device-local storage, vertex, index or uniform data. Copy destination.
    #[default]
    DeviceLocal,
    /// Host-visible, sequentially written, used as a copy source.
    Staging,
    /// Host-visible data rewritten every frame and read directly by shaders.
    Dynamic,
    /// Host-visible and cached, used as a copy destination for readback.
    Readback,
}

impl BufferPreset {
    pub fn host_visible(self) -> bool {
        !matches!(self, BufferPreset::DeviceLocal)
    }

    pub fn usage(self) -> vk::BufferUsageFlags {
        match self {
            BufferPreset::DeviceLocal => {
                vk::BufferUsageFlags::STORAGE_BUFFER
                    | vk::BufferUsageFlags::VERTEX_BUFFER
                    | vk::BufferUsageFlags::INDEX_BUFFER
                    | vk::BufferUsageFlags::UNIFORM_BUFFER
                    | vk::BufferUsageFlags::INDIRECT_BUFFER
                    | vk::BufferUsageFlags::TRANSFER_DST
                    | vk::BufferUsageFlags::TRANSFER_SRC
            }
            BufferPreset::Staging => vk::BufferUsageFlags::TRANSFER_SRC,
            BufferPreset::Dynamic => {
                vk::BufferUsageFlags::UNIFORM_BUFFER
                    | vk::BufferUsageFlags::STORAGE_BUFFER
                    | vk::BufferUsageFlags::VERTEX_BUFFER
                    | vk::BufferUsageFlags::INDEX_BUFFER
            }
            BufferPreset::Readback => vk::BufferUsageFlags::TRANSFER_DST,
        }
    }
}

#[repr(C)]
#[derive(Default, Hash, Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum ImagePreset {
    /// Sampled texture filled by copies.
    #[default]
    Sampled,
    /// Sampled and written from compute.
    Storage,
}

impl ImagePreset {
    pub fn usage(self) -> vk::ImageUsageFlags {
        let base = vk::ImageUsageFlags::TRANSFER_DST
            | vk::ImageUsageFlags::TRANSFER_SRC
            | vk::ImageUsageFlags::SAMPLED;
        match self {
            ImagePreset::Sampled => base,
            ImagePreset::Storage => base | vk::ImageUsageFlags::STORAGE,
        }
    }
}

#[repr(C)]
#[derive(Hash, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum Format {
    R8Unorm,
    R8Uint,
    RG8Unorm,
    #[default]
    RGBA8Unorm,
    RGBA8Srgb,
    BGRA8Unorm,
    R32Float,
    RGBA16Float,
    RGBA32Float,
}

impl Format {
    pub fn bytes_per_texel(self) -> u64 {
        match self {
            Format::R8Unorm | Format::R8Uint => 1,
            Format::RG8Unorm => 2,
            Format::RGBA8Unorm | Format::RGBA8Srgb | Format::BGRA8Unorm | Format::R32Float => 4,
            Format::RGBA16Float => 8,
            Format::RGBA32Float => 16,
        }
    }
}

impl From<Format> for vk::Format {
    fn from(format: Format) -> Self {
        match format {
            Format::R8Unorm => vk::Format::R8_UNORM,
            Format::R8Uint => vk::Format::R8_UINT,
            Format::RG8Unorm => vk::Format::R8G8_UNORM,
            Format::RGBA8Unorm => vk::Format::R8G8B8A8_UNORM,
            Format::RGBA8Srgb => vk::Format::R8G8B8A8_SRGB,
            Format::BGRA8Unorm => vk::Format::B8G8R8A8_UNORM,
            Format::R32Float => vk::Format::R32_SFLOAT,
            Format::RGBA16Float => vk::Format::R16G16B16A16_SFLOAT,
            Format::RGBA32Float => vk::Format::R32G32B32A32_SFLOAT,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferInfo<'a> {
    pub debug_name: &'a str,
    pub byte_size: u64,
    pub preset: BufferPreset,
}

impl<'a> Default for BufferInfo<'a> {
    fn default() -> Self {
        Self {
            debug_name: "",
            byte_size: 1024,
            preset: BufferPreset::DeviceLocal,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageInfo<'a> {
    pub debug_name: &'a str,
    pub dim: [u32; 3],
    pub layers: u32,
    pub format: Format,
    pub mip_levels: u32,
    pub preset: ImagePreset,
}

impl<'a> Default for ImageInfo<'a> {
    fn default() -> Self {
        Self {
            debug_name: "",
            dim: [1280, 1024, 1],
            layers: 1,
            format: Format::RGBA8Unorm,
            mip_levels: 1,
            preset: ImagePreset::Sampled,
        }
    }
}

impl<'a> ImageInfo<'a> {
    /// Bytes needed to hold every texel of every mip and layer, tightly packed.
    pub fn byte_size(&self) -> u64 {
        let texel = self.format.bytes_per_texel();
        let mut total = 0u64;
        for mip in 0..self.mip_levels.max(1) {
            let w = (self.dim[0] >> mip).max(1) as u64;
            let h = (self.dim[1] >> mip).max(1) as u64;
            let d = (self.dim[2] >> mip).max(1) as u64;
            total += w * h * d * texel;
        }
        total * self.layers.max(1) as u64
    }
}

/// Device properties the allocation paths check requests against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceLimits {
    /// Largest single allocation the device accepts.
    pub max_allocation_size: u64,
    /// Alignment applied to every range carved out of a pool block.
    pub min_pool_alignment: u64,
    /// Offset alignment required for buffer-to-image copy sources.
    pub optimal_copy_offset_alignment: u64,
}

impl Default for DeviceLimits {
    fn default() -> Self {
        Self {
            max_allocation_size: 1 << 32,
            min_pool_alignment: 256,
            optimal_copy_offset_alignment: 16,
        }
    }
}

/// Host address of mapped device memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MappedPtr(NonNull<u8>);

// Mapped memory stays valid for the lifetime of the allocation that owns it
// and may be written from any thread.
unsafe impl Send for MappedPtr {}
unsafe impl Sync for MappedPtr {}

impl MappedPtr {
    pub fn new(ptr: *mut u8) -> Option<Self> {
        NonNull::new(ptr).map(Self)
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.0.as_ptr()
    }

    /// # Safety
    /// `offset` must stay inside the mapped allocation.
    pub unsafe fn add(&self, offset: u64) -> Self {
        Self(NonNull::new_unchecked(self.0.as_ptr().add(offset as usize)))
    }
}

/// A buffer freshly created by a backend, before the allocator takes ownership.
#[derive(Debug)]
pub struct RawBuffer<M> {
    pub buffer: vk::Buffer,
    pub memory: M,
    pub mapped: Option<MappedPtr>,
}

#[derive(Debug)]
pub struct RawImage<M> {
    pub image: vk::Image,
    pub memory: M,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Resource {
    Buffer(vk::Buffer),
    Image(vk::Image),
}

/// Wait on a timeline semaphore reaching `value` before `stages` execute.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitEntry {
    pub semaphore: vk::Semaphore,
    pub value: u64,
    pub stages: Stage,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SignalEntry {
    pub semaphore: vk::Semaphore,
    pub value: u64,
}

/// Everything handed to one native queue submission.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NativeSubmission {
    pub command_buffers: Vec<vk::CommandBuffer>,
    pub waits: Vec<WaitEntry>,
    pub signals: Vec<SignalEntry>,
}

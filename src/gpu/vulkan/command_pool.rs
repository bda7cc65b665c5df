use ash::{vk, Device};

use crate::gpu::error::Result;

/// Thin wrapper around a Vulkan command pool.
///
/// Handles allocation and recycling of primary command buffers. Access is
/// serialized by whoever owns the `&mut`; in this crate that is the
/// recording context's token.
pub struct CommandPool {
    device: Device,
    raw: vk::CommandPool,
    free: Vec<vk::CommandBuffer>,
}

impl CommandPool {
    /// Create a new command pool for the given queue family.
    pub(super) fn new(device: Device, family: u32) -> Result<Self> {
        let ci = vk::CommandPoolCreateInfo::builder()
            .queue_family_index(family)
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER)
            .build();
        let raw = unsafe { device.create_command_pool(&ci, None)? };
        Ok(Self {
            device,
            raw,
            free: Vec::new(),
        })
    }

    fn alloc(&mut self) -> Result<vk::CommandBuffer> {
        if let Some(buf) = self.free.pop() {
            unsafe {
                self.device
                    .reset_command_buffer(buf, vk::CommandBufferResetFlags::empty())?;
            }
            return Ok(buf);
        }
        let cmd = unsafe {
            self.device.allocate_command_buffers(
                &vk::CommandBufferAllocateInfo::builder()
                    .command_pool(self.raw)
                    .level(vk::CommandBufferLevel::PRIMARY)
                    .command_buffer_count(1)
                    .build(),
            )?
        };
        Ok(cmd[0])
    }

    /// Begin a one-time-submit command buffer from this pool.
    pub fn begin(&mut self) -> Result<vk::CommandBuffer> {
        let cmd = self.alloc()?;
        unsafe {
            self.device.begin_command_buffer(
                cmd,
                &vk::CommandBufferBeginInfo::builder()
                    .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT)
                    .build(),
            )?;
        }
        Ok(cmd)
    }

    /// Return a command buffer after GPU completion.
    pub fn recycle(&mut self, cmd: vk::CommandBuffer) {
        self.free.push(cmd);
    }

    /// Destroy the underlying Vulkan command pool. Command buffers allocated
    /// from this pool become invalid after this call.
    pub fn destroy(&mut self) {
        unsafe {
            self.device.destroy_command_pool(self.raw, None);
        }
        self.raw = vk::CommandPool::null();
        self.free.clear();
    }
}

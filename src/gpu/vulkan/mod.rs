use std::ffi::CString;
use std::mem::ManuallyDrop;

use ash::extensions::ext::DebugUtils;
use ash::vk;
use parking_lot::Mutex;
use vk_mem::Alloc;

pub mod command_pool;

pub use command_pool::CommandPool;

use super::error::{GPUError, Result};
use super::{
    Backend, BufferInfo, BufferPreset, DeviceLimits, ImageInfo, MappedPtr, NativeSubmission,
    QueueType, RawBuffer, RawImage,
};
use crate::sync::{BarrierBuilder, TransferStep};

/// A queue handed over by whoever created the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueInfo {
    pub family: u32,
    pub queue: vk::Queue,
}

/// Queues the backend submits to. Missing compute or transfer queues fall
/// back to the graphics queue.
#[derive(Debug, Clone, Copy)]
pub struct VulkanQueues {
    pub graphics: QueueInfo,
    pub compute: Option<QueueInfo>,
    pub transfer: Option<QueueInfo>,
}

pub struct VkMemory {
    alloc: vk_mem::Allocation,
}

// VMA allocations are opaque handles; the allocator synchronizes access.
unsafe impl Send for VkMemory {}
unsafe impl Sync for VkMemory {}

#[derive(Default)]
pub struct VulkanRecorder {
    pools: [Option<CommandPool>; 3],
}

/// [`Backend`] over an externally created device.
///
/// The device must have `timelineSemaphore` and `synchronization2` enabled.
/// The backend never destroys the device or its queues.
pub struct VulkanBackend {
    device: ash::Device,
    allocator: ManuallyDrop<vk_mem::Allocator>,
    debug_utils: Option<DebugUtils>,
    families: [u32; 3],
    // distinct queues, each externally synchronized
    queues: Vec<Mutex<vk::Queue>>,
    queue_slots: [usize; 3],
    limits: DeviceLimits,
}

unsafe impl Send for VulkanBackend {}
unsafe impl Sync for VulkanBackend {}

impl VulkanBackend {
    pub fn new(
        instance: &ash::Instance,
        device: ash::Device,
        pdevice: vk::PhysicalDevice,
        queues: VulkanQueues,
    ) -> Result<Self> {
        let allocator =
            vk_mem::Allocator::new(vk_mem::AllocatorCreateInfo::new(instance, &device, pdevice))?;

        let mut maintenance3 = vk::PhysicalDeviceMaintenance3Properties::default();
        let mut props2 = vk::PhysicalDeviceProperties2::builder()
            .push_next(&mut maintenance3)
            .build();
        unsafe { instance.get_physical_device_properties2(pdevice, &mut props2) };
        let device_limits = props2.properties.limits;
        let limits = DeviceLimits {
            max_allocation_size: maintenance3.max_memory_allocation_size,
            min_pool_alignment: device_limits
                .min_storage_buffer_offset_alignment
                .max(device_limits.min_uniform_buffer_offset_alignment)
                .max(device_limits.non_coherent_atom_size),
            optimal_copy_offset_alignment: device_limits.optimal_buffer_copy_offset_alignment,
        };

        let by_type = [
            queues.graphics,
            queues.compute.unwrap_or(queues.graphics),
            queues.transfer.unwrap_or(queues.graphics),
        ];
        let mut distinct: Vec<vk::Queue> = Vec::new();
        let mut queue_slots = [0usize; 3];
        for (slot, info) in queue_slots.iter_mut().zip(by_type.iter()) {
            *slot = match distinct.iter().position(|q| *q == info.queue) {
                Some(i) => i,
                None => {
                    distinct.push(info.queue);
                    distinct.len() - 1
                }
            };
        }

        log::debug!(
            "vulkan backend: families {:?}, max allocation {} bytes",
            by_type.map(|q| q.family),
            limits.max_allocation_size
        );

        Ok(Self {
            device,
            allocator: ManuallyDrop::new(allocator),
            debug_utils: None,
            families: by_type.map(|q| q.family),
            queues: distinct.into_iter().map(Mutex::new).collect(),
            queue_slots,
            limits,
        })
    }

    /// Names recorded command buffers and created resources.
    pub fn with_debug_utils(mut self, debug_utils: DebugUtils) -> Self {
        self.debug_utils = Some(debug_utils);
        self
    }

    pub fn device(&self) -> &ash::Device {
        &self.device
    }

    fn set_name<T>(&self, obj: T, name: &str, t: vk::ObjectType)
    where
        T: vk::Handle,
    {
        let (Some(utils), false) = (&self.debug_utils, name.is_empty()) else {
            return;
        };
        let Ok(name) = CString::new(name) else {
            return;
        };
        unsafe {
            let _ = utils.set_debug_utils_object_name(
                self.device.handle(),
                &vk::DebugUtilsObjectNameInfoEXT::builder()
                    .object_name(&name)
                    .object_type(t)
                    .object_handle(obj.as_raw())
                    .build(),
            );
        }
    }

    fn record_steps(&self, cmd: vk::CommandBuffer, steps: &[TransferStep]) {
        let mut barriers = BarrierBuilder::new();
        for step in steps {
            match *step {
                TransferStep::Barrier(ref barrier) => barriers.push(barrier),
                TransferStep::CopyBuffer {
                    src,
                    src_offset,
                    dst,
                    dst_offset,
                    size,
                } => unsafe {
                    barriers.emit(&self.device, cmd);
                    self.device.cmd_copy_buffer(
                        cmd,
                        src,
                        dst,
                        &[vk::BufferCopy {
                            src_offset,
                            dst_offset,
                            size,
                        }],
                    );
                },
                TransferStep::CopyBufferToImage {
                    src,
                    src_offset,
                    image,
                    extent,
                    mip_level,
                    base_layer,
                    layer_count,
                    aspect,
                } => unsafe {
                    barriers.emit(&self.device, cmd);
                    self.device.cmd_copy_buffer_to_image(
                        cmd,
                        src,
                        image,
                        vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                        &[vk::BufferImageCopy {
                            buffer_offset: src_offset,
                            buffer_row_length: 0,
                            buffer_image_height: 0,
                            image_subresource: vk::ImageSubresourceLayers {
                                aspect_mask: aspect,
                                mip_level,
                                base_array_layer: base_layer,
                                layer_count,
                            },
                            image_offset: vk::Offset3D::default(),
                            image_extent: vk::Extent3D {
                                width: extent[0],
                                height: extent[1],
                                depth: extent[2],
                            },
                        }],
                    );
                },
            }
        }
        unsafe { barriers.emit(&self.device, cmd) };
    }
}

impl Drop for VulkanBackend {
    fn drop(&mut self) {
        unsafe { ManuallyDrop::drop(&mut self.allocator) };
    }
}

impl Backend for VulkanBackend {
    type Memory = VkMemory;
    type Recorder = VulkanRecorder;

    fn queue_family(&self, queue: QueueType) -> u32 {
        self.families[queue.index()]
    }

    fn limits(&self) -> DeviceLimits {
        self.limits
    }

    fn create_buffer(&self, info: &BufferInfo) -> Result<RawBuffer<VkMemory>> {
        let create_info = vk_mem::AllocationCreateInfo {
            usage: if info.preset.host_visible() {
                vk_mem::MemoryUsage::AutoPreferHost
            } else {
                vk_mem::MemoryUsage::Auto
            },
            flags: match info.preset {
                BufferPreset::DeviceLocal => vk_mem::AllocationCreateFlags::empty(),
                BufferPreset::Staging | BufferPreset::Dynamic => {
                    vk_mem::AllocationCreateFlags::MAPPED
                        | vk_mem::AllocationCreateFlags::HOST_ACCESS_SEQUENTIAL_WRITE
                }
                BufferPreset::Readback => {
                    vk_mem::AllocationCreateFlags::MAPPED
                        | vk_mem::AllocationCreateFlags::HOST_ACCESS_RANDOM
                }
            },
            ..Default::default()
        };

        let (buffer, alloc) = unsafe {
            self.allocator.create_buffer(
                &vk::BufferCreateInfo::builder()
                    .size(info.byte_size)
                    .usage(info.preset.usage())
                    .sharing_mode(vk::SharingMode::EXCLUSIVE)
                    .build(),
                &create_info,
            )?
        };
        self.set_name(buffer, info.debug_name, vk::ObjectType::BUFFER);

        let mapped = if info.preset.host_visible() {
            MappedPtr::new(self.allocator.get_allocation_info(&alloc).mapped_data as *mut u8)
        } else {
            None
        };
        Ok(RawBuffer {
            buffer,
            memory: VkMemory { alloc },
            mapped,
        })
    }

    fn create_image(&self, info: &ImageInfo) -> Result<RawImage<VkMemory>> {
        let image_type = if info.dim[2] > 1 {
            vk::ImageType::TYPE_3D
        } else {
            vk::ImageType::TYPE_2D
        };
        let (image, alloc) = unsafe {
            self.allocator.create_image(
                &vk::ImageCreateInfo::builder()
                    .extent(vk::Extent3D {
                        width: info.dim[0],
                        height: info.dim[1],
                        depth: info.dim[2].max(1),
                    })
                    .array_layers(info.layers.max(1))
                    .format(info.format.into())
                    .mip_levels(info.mip_levels.max(1))
                    .initial_layout(vk::ImageLayout::UNDEFINED)
                    .usage(info.preset.usage())
                    .image_type(image_type)
                    .samples(vk::SampleCountFlags::TYPE_1)
                    .tiling(vk::ImageTiling::OPTIMAL)
                    .sharing_mode(vk::SharingMode::EXCLUSIVE)
                    .build(),
                &vk_mem::AllocationCreateInfo {
                    usage: vk_mem::MemoryUsage::Auto,
                    ..Default::default()
                },
            )?
        };
        self.set_name(image, info.debug_name, vk::ObjectType::IMAGE);
        Ok(RawImage {
            image,
            memory: VkMemory { alloc },
        })
    }

    fn destroy_buffer(&self, buffer: vk::Buffer, mut memory: VkMemory) {
        unsafe { self.allocator.destroy_buffer(buffer, &mut memory.alloc) };
    }

    fn destroy_image(&self, image: vk::Image, mut memory: VkMemory) {
        unsafe { self.allocator.destroy_image(image, &mut memory.alloc) };
    }

    fn flush(&self, memory: &VkMemory, offset: u64, size: u64) -> Result<()> {
        self.allocator
            .flush_allocation(&memory.alloc, offset as usize, size as usize)?;
        Ok(())
    }

    fn create_recorder(&self) -> Result<VulkanRecorder> {
        Ok(VulkanRecorder::default())
    }

    fn record(
        &self,
        recorder: &mut VulkanRecorder,
        queue: QueueType,
        debug_name: &str,
        steps: &[TransferStep],
    ) -> Result<vk::CommandBuffer> {
        let slot = &mut recorder.pools[queue.index()];
        let pool = match slot {
            Some(pool) => pool,
            None => slot.insert(CommandPool::new(
                self.device.clone(),
                self.queue_family(queue),
            )?),
        };
        let cmd = pool.begin()?;
        self.set_name(cmd, debug_name, vk::ObjectType::COMMAND_BUFFER);
        self.record_steps(cmd, steps);
        unsafe { self.device.end_command_buffer(cmd)? };
        Ok(cmd)
    }

    fn recycle(&self, recorder: &mut VulkanRecorder, queue: QueueType, cmd: vk::CommandBuffer) {
        if let Some(pool) = recorder.pools[queue.index()].as_mut() {
            pool.recycle(cmd);
        }
    }

    fn destroy_recorder(&self, mut recorder: VulkanRecorder) {
        for pool in recorder.pools.iter_mut().flatten() {
            pool.destroy();
        }
    }

    fn create_timeline(&self, initial: u64) -> Result<vk::Semaphore> {
        let mut type_info = vk::SemaphoreTypeCreateInfo::builder()
            .semaphore_type(vk::SemaphoreType::TIMELINE)
            .initial_value(initial);
        let info = vk::SemaphoreCreateInfo::builder()
            .push_next(&mut type_info)
            .build();
        Ok(unsafe { self.device.create_semaphore(&info, None)? })
    }

    fn destroy_timeline(&self, semaphore: vk::Semaphore) {
        unsafe { self.device.destroy_semaphore(semaphore, None) };
    }

    fn timeline_value(&self, semaphore: vk::Semaphore) -> Result<u64> {
        Ok(unsafe { self.device.get_semaphore_counter_value(semaphore)? })
    }

    fn submit(&self, queue: QueueType, submission: &NativeSubmission) -> Result<()> {
        let cmds: Vec<vk::CommandBufferSubmitInfo> = submission
            .command_buffers
            .iter()
            .map(|cmd| {
                vk::CommandBufferSubmitInfo::builder()
                    .command_buffer(*cmd)
                    .build()
            })
            .collect();
        let waits: Vec<vk::SemaphoreSubmitInfo> = submission
            .waits
            .iter()
            .map(|w| {
                vk::SemaphoreSubmitInfo::builder()
                    .semaphore(w.semaphore)
                    .value(w.value)
                    .stage_mask(w.stages.into())
                    .build()
            })
            .collect();
        let signals: Vec<vk::SemaphoreSubmitInfo> = submission
            .signals
            .iter()
            .map(|s| {
                vk::SemaphoreSubmitInfo::builder()
                    .semaphore(s.semaphore)
                    .value(s.value)
                    .stage_mask(vk::PipelineStageFlags2::ALL_COMMANDS)
                    .build()
            })
            .collect();

        let info = vk::SubmitInfo2::builder()
            .command_buffer_infos(&cmds)
            .wait_semaphore_infos(&waits)
            .signal_semaphore_infos(&signals)
            .build();

        let raw = self.queues[self.queue_slots[queue.index()]].lock();
        unsafe {
            self.device
                .queue_submit2(*raw, &[info], vk::Fence::null())
                .map_err(GPUError::from)
        }
    }
}

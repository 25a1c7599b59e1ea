use ash::vk;
use itertools::Itertools;

use crate::backend::{GfxBufferCopy, QueueKind};
use crate::commands::barrier::{BarrierBatch, GfxBufferBarrier, GfxGlobalBarrier, GfxTextureBarrier};
use crate::error::GfxResult;
use crate::vulkan::state::{VkResourceState, aspect_flags};

/// 独占一个 command pool 的 command buffer
///
/// command list 会在每一帧 reset 后重新录制，独占 pool 可以让 reset 不影响其他 command buffer
///
/// # Destroy
/// 需要通过 [`VkCommandBuffer::destroy`] 手动销毁
pub struct VkCommandBuffer {
    handle: vk::CommandBuffer,
    pool: vk::CommandPool,
    queue: QueueKind,
    debug_name: String,
}
// new & init
impl VkCommandBuffer {
    pub fn new(device: &ash::Device, queue: QueueKind, family_index: u32, debug_name: &str) -> GfxResult<Self> {
        let pool = unsafe {
            device.create_command_pool(
                &vk::CommandPoolCreateInfo::default()
                    .queue_family_index(family_index)
                    .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER),
                None,
            )?
        };

        let info = vk::CommandBufferAllocateInfo::default()
            .command_pool(pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        let handle = match unsafe { device.allocate_command_buffers(&info) } {
            Ok(buffers) => buffers[0],
            Err(e) => {
                unsafe { device.destroy_command_pool(pool, None) };
                return Err(e.into());
            }
        };

        Ok(Self {
            handle,
            pool,
            queue,
            debug_name: debug_name.to_string(),
        })
    }
}
// destroy
impl VkCommandBuffer {
    pub fn destroy(self, device: &ash::Device) {
        unsafe {
            device.free_command_buffers(self.pool, &[self.handle]);
            device.destroy_command_pool(self.pool, None);
        }
        log::debug!("destroy command buffer: {}", self.debug_name);
    }
}
// getters
impl VkCommandBuffer {
    #[inline]
    pub fn vk_handle(&self) -> vk::CommandBuffer {
        self.handle
    }

    #[inline]
    pub fn queue(&self) -> QueueKind {
        self.queue
    }
}
// 录制
impl VkCommandBuffer {
    /// begin 之前 reset，此前录制的命令全部丢弃
    pub fn begin(&mut self, device: &ash::Device) -> GfxResult<()> {
        unsafe {
            device.reset_command_buffer(self.handle, vk::CommandBufferResetFlags::RELEASE_RESOURCES)?;
            device.begin_command_buffer(
                self.handle,
                &vk::CommandBufferBeginInfo::default().flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT),
            )?;
        }
        Ok(())
    }

    #[inline]
    pub fn end(&mut self, device: &ash::Device) -> GfxResult<()> {
        unsafe { device.end_command_buffer(self.handle)? };
        Ok(())
    }

    /// 一次 `vkCmdPipelineBarrier2` 提交整个批次
    ///
    /// - supported queue types: graphics, compute, transfer
    pub fn barriers(&mut self, device: &ash::Device, batch: BarrierBatch<'_>) {
        match batch {
            BarrierBatch::Global(barriers) => {
                let barriers = barriers.iter().map(Self::memory_barrier).collect_vec();
                let dependency_info = vk::DependencyInfo::default().memory_barriers(&barriers);
                unsafe { device.cmd_pipeline_barrier2(self.handle, &dependency_info) };
            }
            BarrierBatch::Texture(barriers) => {
                let barriers = barriers.iter().map(Self::image_barrier).collect_vec();
                let dependency_info = vk::DependencyInfo::default().image_memory_barriers(&barriers);
                unsafe { device.cmd_pipeline_barrier2(self.handle, &dependency_info) };
            }
            BarrierBatch::Buffer(barriers) => {
                let barriers = barriers.iter().map(Self::buffer_barrier).collect_vec();
                let dependency_info = vk::DependencyInfo::default().buffer_memory_barriers(&barriers);
                unsafe { device.cmd_pipeline_barrier2(self.handle, &dependency_info) };
            }
        }
    }

    pub fn copy_buffer(&mut self, device: &ash::Device, copy: &GfxBufferCopy) {
        use ash::vk::Handle;

        let region = vk::BufferCopy {
            src_offset: copy.src_offset,
            dst_offset: copy.dst_offset,
            size: copy.size,
        };
        unsafe {
            device.cmd_copy_buffer(
                self.handle,
                vk::Buffer::from_raw(copy.src.0),
                vk::Buffer::from_raw(copy.dst.0),
                std::slice::from_ref(&region),
            );
        }
    }

    fn memory_barrier(barrier: &GfxGlobalBarrier) -> vk::MemoryBarrier2<'static> {
        let src = VkResourceState::from_state(barrier.before);
        let dst = VkResourceState::from_state(barrier.after);
        vk::MemoryBarrier2::default()
            .src_stage_mask(src.stage)
            .src_access_mask(src.access)
            .dst_stage_mask(dst.stage)
            .dst_access_mask(dst.access)
    }

    fn image_barrier(barrier: &GfxTextureBarrier) -> vk::ImageMemoryBarrier2<'static> {
        use ash::vk::Handle;

        let src = VkResourceState::from_state(barrier.before);
        let dst = VkResourceState::from_state(barrier.after);
        vk::ImageMemoryBarrier2::default()
            .src_stage_mask(src.stage)
            .src_access_mask(src.access)
            .dst_stage_mask(dst.stage)
            .dst_access_mask(dst.access)
            .old_layout(src.layout)
            .new_layout(dst.layout)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .image(vk::Image::from_raw(barrier.texture.0))
            .subresource_range(vk::ImageSubresourceRange {
                aspect_mask: aspect_flags(barrier.aspect),
                base_mip_level: barrier.base_mip_level,
                level_count: barrier.mip_level_count,
                base_array_layer: barrier.base_array_layer,
                layer_count: barrier.array_layer_count,
            })
    }

    fn buffer_barrier(barrier: &GfxBufferBarrier) -> vk::BufferMemoryBarrier2<'static> {
        use ash::vk::Handle;

        let src = VkResourceState::from_state(barrier.before);
        let dst = VkResourceState::from_state(barrier.after);
        let size = if barrier.size == GfxBufferBarrier::WHOLE_SIZE { vk::WHOLE_SIZE } else { barrier.size };
        vk::BufferMemoryBarrier2::default()
            .src_stage_mask(src.stage)
            .src_access_mask(src.access)
            .dst_stage_mask(dst.stage)
            .dst_access_mask(dst.access)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .buffer(vk::Buffer::from_raw(barrier.buffer.0))
            .offset(barrier.offset)
            .size(size)
    }
}

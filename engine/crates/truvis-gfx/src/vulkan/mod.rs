//! 基于 ash + vk-mem 的 [`GfxBackend`] 实现
//!
//! - 每种 [`QueueKind`] 一个 timeline semaphore，作为该队列的单调计数器
//! - 设备没有独立的 compute / transfer 队列时回退到 graphics 队列，
//!   共享同一个 `vk::Queue` 的提交通过同一把锁串行化

pub mod buffer;
pub mod command_buffer;
pub mod descriptor_heap;
pub mod semaphore;
pub mod state;

use std::ptr::NonNull;
use std::sync::{Arc, Mutex, PoisonError};

use ash::vk;
use itertools::Itertools;

use crate::backend::{GfxBackend, GfxBufferCopy, GfxBufferDesc, QueueKind, RawHandle};
use crate::commands::barrier::BarrierBatch;
use crate::descriptors::descriptor_kind::DescriptorHeapDesc;
use crate::error::GfxResult;
use crate::vulkan::buffer::VkBuffer;
use crate::vulkan::command_buffer::VkCommandBuffer;
use crate::vulkan::descriptor_heap::VkDescriptorHeap;
use crate::vulkan::semaphore::TimelineSemaphore;

#[derive(Debug, Clone, Copy)]
pub struct VulkanQueueInfo {
    pub queue: vk::Queue,
    pub family_index: u32,
}

/// 由外部创建好的 Vulkan 对象
///
/// instance 与 device 的生命周期需要长于 [`VulkanBackend`]
pub struct VulkanBackendCreateInfo<'a> {
    pub instance: &'a ash::Instance,
    pub physical_device: vk::PhysicalDevice,
    pub device: &'a ash::Device,
    pub graphics: VulkanQueueInfo,
    /// None 表示回退到 graphics 队列
    pub compute: Option<VulkanQueueInfo>,
    /// None 表示回退到 graphics 队列
    pub transfer: Option<VulkanQueueInfo>,
}

struct VulkanQueue {
    info: VulkanQueueInfo,
    /// 同一个 vk::Queue 的不同 QueueKind 共享这把锁
    submit_lock: Arc<Mutex<()>>,
}

/// 每个 QueueKind 使用的提交锁下标，相同的 `vk::Queue` 得到相同的下标
fn submit_lock_groups(queues: &[vk::Queue; QueueKind::COUNT]) -> [usize; QueueKind::COUNT] {
    std::array::from_fn(|i| queues[..i].iter().position(|queue| *queue == queues[i]).unwrap_or(i))
}

pub struct VulkanBackend {
    device: ash::Device,
    allocator: vk_mem::Allocator,

    queues: [VulkanQueue; QueueKind::COUNT],
    /// 下标为 `QueueKind::index()`
    timelines: Vec<TimelineSemaphore>,
}
// new & init
impl VulkanBackend {
    /// # Safety
    /// `ci` 中的对象必须有效，并且 device 需要开启 timeline semaphore、synchronization2
    /// 以及 descriptor indexing 的 update-after-bind 特性
    pub unsafe fn new(ci: &VulkanBackendCreateInfo<'_>) -> GfxResult<Self> {
        let mut vma_ci = vk_mem::AllocatorCreateInfo::new(ci.instance, ci.device, ci.physical_device);
        vma_ci.vulkan_api_version = vk::API_VERSION_1_3;
        let allocator = unsafe { vk_mem::Allocator::new(vma_ci)? };

        if ci.compute.is_none() {
            log::info!("{} queue falls back to graphics queue", QueueKind::Compute);
        }
        if ci.transfer.is_none() {
            log::info!("{} queue falls back to graphics queue", QueueKind::Copy);
        }
        let infos = [
            ci.graphics,
            ci.compute.unwrap_or(ci.graphics),
            ci.transfer.unwrap_or(ci.graphics),
        ];
        let lock_groups = submit_lock_groups(&infos.map(|info| info.queue));
        let locks: [Arc<Mutex<()>>; QueueKind::COUNT] = std::array::from_fn(|_| Arc::new(Mutex::new(())));
        let queues = std::array::from_fn(|i| VulkanQueue {
            info: infos[i],
            submit_lock: locks[lock_groups[i]].clone(),
        });

        let mut timelines = Vec::with_capacity(QueueKind::COUNT);
        for _ in QueueKind::ALL {
            match TimelineSemaphore::new(ci.device, 0) {
                Ok(semaphore) => timelines.push(semaphore),
                Err(e) => {
                    timelines.into_iter().for_each(|s| s.destroy(ci.device));
                    return Err(e);
                }
            }
        }

        log::info!("create vulkan backend");
        Ok(Self {
            device: ci.device.clone(),
            allocator,
            queues,
            timelines,
        })
    }
}
impl Drop for VulkanBackend {
    fn drop(&mut self) {
        log::info!("drop vulkan backend");
        for semaphore in std::mem::take(&mut self.timelines) {
            semaphore.destroy(&self.device);
        }
    }
}
// getters
impl VulkanBackend {
    #[inline]
    pub fn device(&self) -> &ash::Device {
        &self.device
    }

    #[inline]
    pub fn allocator(&self) -> &vk_mem::Allocator {
        &self.allocator
    }

    #[inline]
    pub fn queue_info(&self, queue: QueueKind) -> VulkanQueueInfo {
        self.queues[queue.index()].info
    }

    /// 队列计数器对应的 timeline semaphore，用于和外部的提交（例如 present）同步
    #[inline]
    pub fn timeline_semaphore(&self, queue: QueueKind) -> vk::Semaphore {
        self.timelines[queue.index()].handle()
    }
}
// tools
impl VulkanBackend {
    fn submit_internal(
        &self,
        queue: QueueKind,
        command_buffers: &[vk::CommandBufferSubmitInfo<'_>],
        signal_value: u64,
    ) -> GfxResult<()> {
        let signal_infos = [vk::SemaphoreSubmitInfo::default()
            .semaphore(self.timeline_semaphore(queue))
            .stage_mask(vk::PipelineStageFlags2::ALL_COMMANDS)
            .value(signal_value)];
        let submit_info =
            vk::SubmitInfo2::default().command_buffer_infos(command_buffers).signal_semaphore_infos(&signal_infos);

        let vk_queue = &self.queues[queue.index()];
        let _guard = vk_queue.submit_lock.lock().unwrap_or_else(PoisonError::into_inner);
        unsafe {
            self.device.queue_submit2(vk_queue.info.queue, std::slice::from_ref(&submit_info), vk::Fence::null())?;
        }
        Ok(())
    }
}

impl GfxBackend for VulkanBackend {
    type Buffer = VkBuffer;
    type CommandBuffer = VkCommandBuffer;
    type DescriptorHeap = VkDescriptorHeap;

    fn name(&self) -> &'static str {
        "vulkan"
    }

    fn create_buffer(&self, desc: &GfxBufferDesc<'_>) -> GfxResult<Self::Buffer> {
        VkBuffer::new(&self.allocator, desc)
    }

    fn mapped_ptr(&self, buffer: &Self::Buffer) -> Option<NonNull<u8>> {
        buffer.mapped_ptr()
    }

    fn buffer_handle(&self, buffer: &Self::Buffer) -> RawHandle {
        use ash::vk::Handle;
        RawHandle(buffer.vk_buffer().as_raw())
    }

    fn buffer_size(&self, buffer: &Self::Buffer) -> u64 {
        buffer.size()
    }

    fn destroy_buffer(&self, buffer: Self::Buffer) {
        buffer.destroy(&self.allocator);
    }

    fn create_descriptor_heap(&self, desc: &DescriptorHeapDesc) -> GfxResult<Self::DescriptorHeap> {
        VkDescriptorHeap::new(&self.device, desc)
    }

    fn destroy_descriptor_heap(&self, heap: Self::DescriptorHeap) {
        heap.destroy(&self.device);
    }

    fn create_command_buffer(&self, queue: QueueKind, debug_name: &str) -> GfxResult<Self::CommandBuffer> {
        VkCommandBuffer::new(&self.device, queue, self.queue_info(queue).family_index, debug_name)
    }

    fn destroy_command_buffer(&self, command_buffer: Self::CommandBuffer) {
        command_buffer.destroy(&self.device);
    }

    fn begin_command_buffer(&self, command_buffer: &mut Self::CommandBuffer) -> GfxResult<()> {
        command_buffer.begin(&self.device)
    }

    fn end_command_buffer(&self, command_buffer: &mut Self::CommandBuffer) -> GfxResult<()> {
        command_buffer.end(&self.device)
    }

    fn issue_barriers(&self, command_buffer: &mut Self::CommandBuffer, batch: BarrierBatch<'_>) {
        command_buffer.barriers(&self.device, batch);
    }

    fn copy_buffer(&self, command_buffer: &mut Self::CommandBuffer, copy: &GfxBufferCopy) {
        command_buffer.copy_buffer(&self.device, copy);
    }

    fn submit(&self, queue: QueueKind, command_buffers: &[&Self::CommandBuffer], signal_value: u64) -> GfxResult<()> {
        let command_buffer_infos = command_buffers
            .iter()
            .map(|cmd| vk::CommandBufferSubmitInfo::default().command_buffer(cmd.vk_handle()))
            .collect_vec();
        self.submit_internal(queue, &command_buffer_infos, signal_value)
    }

    /// 通过一次空提交来 signal，保证和队列中之前的工作有序
    fn signal(&self, queue: QueueKind, value: u64) -> GfxResult<()> {
        self.submit_internal(queue, &[], value)
    }

    fn query_counter(&self, queue: QueueKind) -> GfxResult<u64> {
        self.timelines[queue.index()].counter_value(&self.device)
    }

    fn wait_counter(&self, queue: QueueKind, value: u64) -> GfxResult<()> {
        self.timelines[queue.index()].wait(&self.device, value, u64::MAX)
    }

    fn wait_idle(&self) -> GfxResult<()> {
        unsafe { self.device.device_wait_idle()? };
        Ok(())
    }
}

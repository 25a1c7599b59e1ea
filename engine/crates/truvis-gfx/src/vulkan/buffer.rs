use std::ptr::NonNull;

use ash::vk;
use vk_mem::Alloc;

use crate::backend::{GfxBufferDesc, GfxBufferUsage};
use crate::error::{GfxError, GfxResult};

/// vk-mem 分配的 buffer
///
/// # Destroy
/// 需要通过 [`VkBuffer::destroy`] 手动销毁
pub struct VkBuffer {
    handle: vk::Buffer,
    allocation: vk_mem::Allocation,
    size: vk::DeviceSize,

    /// 在初始化阶段写死
    map_ptr: Option<NonNull<u8>>,

    debug_name: String,
}
// SAFETY: allocation 只会在 destroy 时被可变访问，映射指针的写入由上层保证不重叠
unsafe impl Send for VkBuffer {}
unsafe impl Sync for VkBuffer {}

// new & init
impl VkBuffer {
    /// - alignment: buffer 位于一个大的 memory block 中时，起始 offset 的对齐
    /// - host visible 的 buffer 会被持久映射
    pub fn new(allocator: &vk_mem::Allocator, desc: &GfxBufferDesc<'_>) -> GfxResult<Self> {
        let buffer_ci = vk::BufferCreateInfo::default().size(desc.size).usage(Self::vk_usage(desc.usage));
        let alloc_ci = vk_mem::AllocationCreateInfo {
            usage: if desc.host_visible {
                vk_mem::MemoryUsage::AutoPreferHost
            } else {
                vk_mem::MemoryUsage::AutoPreferDevice
            },
            flags: if desc.host_visible {
                vk_mem::AllocationCreateFlags::HOST_ACCESS_SEQUENTIAL_WRITE
            } else {
                vk_mem::AllocationCreateFlags::empty()
            },
            ..Default::default()
        };

        let (handle, mut allocation) =
            unsafe { allocator.create_buffer_with_alignment(&buffer_ci, &alloc_ci, desc.alignment)? };

        let mut map_ptr = None;
        if desc.host_visible {
            match unsafe { allocator.map_memory(&mut allocation) } {
                Ok(ptr) => map_ptr = NonNull::new(ptr),
                Err(e) => {
                    unsafe { allocator.destroy_buffer(handle, &mut allocation) };
                    return Err(e.into());
                }
            }
            if map_ptr.is_none() {
                unsafe { allocator.destroy_buffer(handle, &mut allocation) };
                return Err(GfxError::Backend(format!("buffer `{}` mapped to null", desc.debug_name)));
            }
        }

        Ok(Self {
            handle,
            allocation,
            size: desc.size,
            map_ptr,
            debug_name: desc.debug_name.to_string(),
        })
    }

    fn vk_usage(usage: GfxBufferUsage) -> vk::BufferUsageFlags {
        let mut flags = vk::BufferUsageFlags::empty();
        if usage.contains(GfxBufferUsage::CONSTANT) {
            flags |= vk::BufferUsageFlags::UNIFORM_BUFFER;
        }
        if usage.contains(GfxBufferUsage::STRUCTURED) {
            flags |= vk::BufferUsageFlags::STORAGE_BUFFER;
        }
        if usage.contains(GfxBufferUsage::VERTEX) {
            flags |= vk::BufferUsageFlags::VERTEX_BUFFER;
        }
        if usage.contains(GfxBufferUsage::INDEX) {
            flags |= vk::BufferUsageFlags::INDEX_BUFFER;
        }
        if usage.contains(GfxBufferUsage::INDIRECT) {
            flags |= vk::BufferUsageFlags::INDIRECT_BUFFER;
        }
        if usage.contains(GfxBufferUsage::TRANSFER_SRC) {
            flags |= vk::BufferUsageFlags::TRANSFER_SRC;
        }
        if usage.contains(GfxBufferUsage::TRANSFER_DST) {
            flags |= vk::BufferUsageFlags::TRANSFER_DST;
        }
        flags
    }
}
// destroy
impl VkBuffer {
    pub fn destroy(mut self, allocator: &vk_mem::Allocator) {
        unsafe {
            if self.map_ptr.is_some() {
                allocator.unmap_memory(&mut self.allocation);
            }
            allocator.destroy_buffer(self.handle, &mut self.allocation);
        }
        log::debug!("destroy buffer: {}", self.debug_name);
    }
}
// getters
impl VkBuffer {
    #[inline]
    pub fn vk_buffer(&self) -> vk::Buffer {
        self.handle
    }

    #[inline]
    pub fn size(&self) -> vk::DeviceSize {
        self.size
    }

    #[inline]
    pub fn mapped_ptr(&self) -> Option<NonNull<u8>> {
        self.map_ptr
    }
}

//! 每帧的临时 buffer 分配器
//!
//! 每个 frame slot 有一组在加载时创建的常驻 page，分配时在当前 page 上线性推进游标：
//! - 当前 page 放不下、但请求不超过标准 page 大小：切换到 slot 的下一个常驻 page，
//!   没有的话创建一个标准大小的溢出 page，游标从新 page 的起点开始
//! - 请求超过标准 page 大小：创建一个大小正好等于请求的大 page，游标不变
//!
//! slot 被重新使用时（[`TempBufferAllocator::next_frame`]），溢出 page 与大 page 被释放，游标归零。
//! 常驻 page 只会在 [`TempBufferAllocator::destroy`] 时释放。

use std::ptr::NonNull;
use std::sync::Arc;

use slotmap::SlotMap;
use truvis_gfx::backend::{GfxBackend, GfxBufferDesc, RawHandle};
use truvis_gfx::error::{GfxError, GfxResult};

slotmap::new_key_type! {
    pub struct PageHandle;
}

/// page 的起始地址对齐
const PAGE_ALIGNMENT: u64 = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageKind {
    /// 加载时创建，常驻
    Persistent,
    /// 标准大小，slot 重置时释放
    Overflow,
    /// 大小等于单个请求，slot 重置时释放
    Large,
}

struct Page<B: GfxBackend> {
    buffer: B::Buffer,
    handle: RawHandle,
    cpu_ptr: NonNull<u8>,
    size: u64,
    kind: PageKind,
}
// SAFETY: cpu_ptr 指向 buffer 自己的映射内存，随 buffer 一起移动到其他线程；
// 写入只通过 `&mut TempBufferAllocator` 进行
unsafe impl<B: GfxBackend> Send for Page<B> {}

/// 一个 frame slot 的分配状态
#[derive(Default)]
struct FrameSlot {
    persistent_pages: Vec<PageHandle>,
    /// 溢出 page 与大 page
    temp_pages: Vec<PageHandle>,

    /// 正在线性分配的标准 page
    active_page: Option<PageHandle>,
    /// 下一个可以切换过去的常驻 page
    next_persistent: usize,
    cursor: u64,

    /// 每次重置 +1，用于识别过期的 TempBuffer
    epoch: u64,
}
impl FrameSlot {
    fn reset_cursor(&mut self) {
        self.active_page = self.persistent_pages.first().copied();
        self.next_persistent = self.persistent_pages.len().min(1);
        self.cursor = 0;
    }
}

/// page 中的一段临时内存
///
/// 最多在一个帧环周期内有效，slot 重置之后变为过期，过期的 TempBuffer 不能再写入
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TempBuffer {
    /// 在 page 中的偏移
    pub offset: u64,
    pub size: u64,
    /// 指向 `offset` 处的 CPU 映射地址
    pub cpu_ptr: NonNull<u8>,
    /// 所在 page 的原生 buffer
    pub buffer: RawHandle,
    pub page: PageHandle,
    pub frame_slot: usize,
    pub epoch: u64,
}

pub struct TempBufferAllocator<B: GfxBackend> {
    backend: Arc<B>,
    page_size: u64,

    pages: SlotMap<PageHandle, Page<B>>,
    slots: Vec<FrameSlot>,
    frame_index: usize,
}
// new & init
impl<B: GfxBackend> TempBufferAllocator<B> {
    /// 为每个 frame slot 创建 `persistent_pages_per_frame` 个常驻 page
    pub fn new(
        backend: Arc<B>,
        page_size: u64,
        persistent_pages_per_frame: usize,
        frames_in_flight: usize,
    ) -> GfxResult<Self> {
        if page_size == 0 {
            return Err(GfxError::InvalidUsage("temp buffer page size is zero".to_string()));
        }

        let mut allocator = Self {
            backend,
            page_size,
            pages: SlotMap::with_key(),
            slots: (0..frames_in_flight.max(1)).map(|_| FrameSlot::default()).collect(),
            frame_index: 0,
        };

        // 失败时已经创建的 page 由 Drop 释放
        for slot in 0..allocator.slots.len() {
            for i in 0..persistent_pages_per_frame {
                let name = format!("temp-page-persistent-{}-{}", slot, i);
                let page = allocator.create_page(page_size, PAGE_ALIGNMENT, PageKind::Persistent, &name)?;
                allocator.slots[slot].persistent_pages.push(page);
            }
            allocator.slots[slot].reset_cursor();
        }

        log::info!(
            "create temp buffer allocator: {} slot(s) x {} persistent page(s) of {} bytes",
            allocator.slots.len(),
            persistent_pages_per_frame,
            page_size
        );
        Ok(allocator)
    }

    fn create_page(&mut self, size: u64, alignment: u64, kind: PageKind, name: &str) -> GfxResult<PageHandle> {
        let buffer = self.backend.create_buffer(&GfxBufferDesc::scratch(size, alignment, name))?;
        let Some(cpu_ptr) = self.backend.mapped_ptr(&buffer) else {
            self.backend.destroy_buffer(buffer);
            return Err(GfxError::Backend(format!("temp page `{}` is not host visible", name)));
        };
        let handle = self.backend.buffer_handle(&buffer);
        // 后端可能向上取整
        let buffer_size = self.backend.buffer_size(&buffer);
        debug_assert!(buffer_size >= size);
        Ok(self.pages.insert(Page {
            buffer,
            handle,
            cpu_ptr,
            size: buffer_size,
            kind,
        }))
    }

    fn release_page(&mut self, page: PageHandle) {
        if let Some(page) = self.pages.remove(page) {
            self.backend.destroy_buffer(page.buffer);
        }
    }
}
impl<B: GfxBackend> Drop for TempBufferAllocator<B> {
    fn drop(&mut self) {
        log::info!("Dropping TempBufferAllocator");
        for (_, page) in self.pages.drain() {
            self.backend.destroy_buffer(page.buffer);
        }
    }
}
// destroy
impl<B: GfxBackend> TempBufferAllocator<B> {
    /// 释放所有 page，调用者需要保证 GPU 已经不再使用它们
    #[inline]
    pub fn destroy(self) {
        drop(self)
    }
}
// getters
impl<B: GfxBackend> TempBufferAllocator<B> {
    #[inline]
    pub fn page_size(&self) -> u64 {
        self.page_size
    }

    #[inline]
    pub fn frame_index(&self) -> usize {
        self.frame_index
    }

    /// 当前 slot 在活动 page 上的游标
    #[inline]
    pub fn cursor(&self) -> u64 {
        self.slots[self.frame_index].cursor
    }

    /// 所有 slot 的 page 总数
    #[inline]
    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    pub fn large_page_count(&self) -> usize {
        self.pages.values().filter(|page| page.kind == PageKind::Large).count()
    }

    pub fn overflow_page_count(&self) -> usize {
        self.pages.values().filter(|page| page.kind == PageKind::Overflow).count()
    }

    pub fn page_kind(&self, page: PageHandle) -> Option<PageKind> {
        self.pages.get(page).map(|page| page.kind)
    }

    pub fn page_len(&self, page: PageHandle) -> Option<u64> {
        self.pages.get(page).map(|page| page.size)
    }

    /// TempBuffer 所在的 slot 还没有被重置
    pub fn is_live(&self, temp: &TempBuffer) -> bool {
        self.slots.get(temp.frame_slot).is_some_and(|slot| slot.epoch == temp.epoch)
            && self.pages.contains_key(temp.page)
    }
}
// 分配
impl<B: GfxBackend> TempBufferAllocator<B> {
    /// 分配至少 `size` 字节、偏移按 `alignment` 对齐的临时内存
    ///
    /// `size` 为 0 或者 `alignment` 不是 2 的幂时拒绝；原生分配失败时返回 None。两种情况都不会改变状态
    pub fn allocate(&mut self, size: u64, alignment: u64) -> Option<TempBuffer> {
        if size == 0 || !alignment.is_power_of_two() {
            log::error!("invalid temp buffer request: size {}, alignment {}", size, alignment);
            return None;
        }

        if size > self.page_size {
            return self.allocate_large(size, alignment);
        }

        let frame_index = self.frame_index;
        if let Some(page) = self.slots[frame_index].active_page {
            let offset = self.slots[frame_index]
                .cursor
                .checked_next_multiple_of(alignment)
                .filter(|offset| offset.checked_add(size).is_some_and(|end| end <= self.page_size));
            if let Some(offset) = offset {
                self.slots[frame_index].cursor = offset + size;
                return Some(self.view(page, offset, size));
            }
        }

        // 切换到下一个标准 page
        let slot = &self.slots[frame_index];
        let page = if slot.next_persistent < slot.persistent_pages.len() {
            let page = slot.persistent_pages[slot.next_persistent];
            self.slots[frame_index].next_persistent += 1;
            page
        } else {
            let name = format!("temp-page-overflow-{}-{}", frame_index, slot.temp_pages.len());
            match self.create_page(self.page_size, PAGE_ALIGNMENT, PageKind::Overflow, &name) {
                Ok(page) => {
                    self.slots[frame_index].temp_pages.push(page);
                    page
                }
                Err(e) => {
                    log::error!("failed to create temp overflow page: {}", e);
                    return None;
                }
            }
        };

        let slot = &mut self.slots[frame_index];
        slot.active_page = Some(page);
        slot.cursor = size;
        Some(self.view(page, 0, size))
    }

    fn allocate_large(&mut self, size: u64, alignment: u64) -> Option<TempBuffer> {
        let frame_index = self.frame_index;
        let name = format!("temp-page-large-{}-{}", frame_index, self.slots[frame_index].temp_pages.len());
        match self.create_page(size, alignment.max(PAGE_ALIGNMENT), PageKind::Large, &name) {
            Ok(page) => {
                log::debug!("temp buffer request of {} bytes uses a large page", size);
                self.slots[frame_index].temp_pages.push(page);
                Some(self.view(page, 0, size))
            }
            Err(e) => {
                log::error!("failed to create temp large page of {} bytes: {}", size, e);
                None
            }
        }
    }

    fn view(&self, page_handle: PageHandle, offset: u64, size: u64) -> TempBuffer {
        let page = &self.pages[page_handle];
        debug_assert!(offset + size <= page.size);
        // SAFETY: offset 在 page 范围内
        let cpu_ptr = unsafe { NonNull::new_unchecked(page.cpu_ptr.as_ptr().add(offset as usize)) };
        TempBuffer {
            offset,
            size,
            cpu_ptr,
            buffer: page.handle,
            page: page_handle,
            frame_slot: self.frame_index,
            epoch: self.slots[self.frame_index].epoch,
        }
    }

    /// 写入 `temp` 的 `[offset, offset + data.len())`，越界或过期时拒绝并返回 false
    pub fn write(&mut self, temp: &TempBuffer, offset: u64, data: &[u8]) -> bool {
        if !self.is_live(temp) {
            log::error!("write to a stale temp buffer (slot {}, epoch {})", temp.frame_slot, temp.epoch);
            return false;
        }
        if offset.checked_add(data.len() as u64).is_none_or(|end| end > temp.size) {
            log::error!("write of {} bytes at {} overflows temp buffer of {} bytes", data.len(), offset, temp.size);
            return false;
        }
        // SAFETY: 范围已经检查，page 仍然存活；`&mut self` 保证没有并发写入
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), temp.cpu_ptr.as_ptr().add(offset as usize), data.len());
        }
        true
    }

    #[inline]
    pub fn write_pod<T: bytemuck::Pod>(&mut self, temp: &TempBuffer, offset: u64, value: &T) -> bool {
        self.write(temp, offset, bytemuck::bytes_of(value))
    }

    /// 分配并写入 `data`
    pub fn allocate_with_data(&mut self, data: &[u8], alignment: u64) -> Option<TempBuffer> {
        let temp = self.allocate(data.len() as u64, alignment)?;
        self.write(&temp, 0, data).then_some(temp)
    }
}
// 帧轮转
impl<B: GfxBackend> TempBufferAllocator<B> {
    /// 前进到下一个 slot 并重置它
    ///
    /// 调用者需要保证该 slot 之前提交的工作已经完成
    pub fn next_frame(&mut self) {
        self.frame_index = (self.frame_index + 1) % self.slots.len();
        self.reset_slot(self.frame_index);
    }

    /// 重置所有 slot，在 GPU 空闲时调用
    pub fn free_all_temp_pages(&mut self) {
        for slot in 0..self.slots.len() {
            self.reset_slot(slot);
        }
    }

    fn reset_slot(&mut self, slot: usize) {
        let temp_pages = std::mem::take(&mut self.slots[slot].temp_pages);
        if !temp_pages.is_empty() {
            log::trace!("temp buffer slot {}: release {} page(s)", slot, temp_pages.len());
        }
        for page in temp_pages {
            self.release_page(page);
        }

        let slot = &mut self.slots[slot];
        slot.reset_cursor();
        slot.epoch += 1;
    }
}

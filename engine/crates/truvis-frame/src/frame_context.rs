//! 帧环
//!
//! 每帧开始时前进到下一个 frame slot：等待该 slot 上一轮留下的 receipt，
//! 执行该 slot 延迟释放的资源，然后重置该 slot 的临时描述符与临时 page。

use std::sync::Arc;

use truvis_gfx::backend::{GfxBackend, QueueKind};
use truvis_gfx::error::GfxError;

use crate::command_list::CommandList;
use crate::command_queue::CommandQueueManager;
use crate::descriptor_heap::{Descriptor, DescriptorHeapManager};
use crate::frame_counter::FrameCounter;
use crate::frame_settings::{FrameSettings, SettingsError};
use crate::receipt::Receipt;
use crate::temp_buffer::TempBufferAllocator;

#[derive(thiserror::Error, Debug)]
pub enum FrameError {
    #[error(transparent)]
    Settings(#[from] SettingsError),

    #[error("failed to create frame resources: {0}")]
    Gfx(#[from] GfxError),
}

/// 等到 slot 的工作完成之后再释放的资源
pub enum DeferredRelease<B: GfxBackend> {
    Descriptor(Descriptor),
    Buffer(B::Buffer),
    Callback(Box<dyn FnOnce() + Send>),
}

pub struct FrameContext<B: GfxBackend> {
    backend: Arc<B>,
    settings: FrameSettings,
    frame_counter: FrameCounter,

    queues: CommandQueueManager<B>,
    descriptors: DescriptorHeapManager<B>,
    temp_buffers: TempBufferAllocator<B>,

    /// 每个 slot 在三条队列上需要等待的 receipt
    slot_receipts: Vec<[Receipt; QueueKind::COUNT]>,
    deferred: Vec<Vec<DeferredRelease<B>>>,
}
// new & init
impl<B: GfxBackend> FrameContext<B> {
    pub fn new(backend: Arc<B>, settings: FrameSettings) -> Result<Self, FrameError> {
        settings.validate()?;
        let fif = settings.frames_in_flight;

        let descriptors = DescriptorHeapManager::new(backend.clone(), &settings.descriptors, fif)?;
        let temp_buffers =
            TempBufferAllocator::new(backend.clone(), settings.page_size, settings.persistent_pages_per_frame, fif)?;
        let queues = CommandQueueManager::new(backend.clone());

        log::info!("create frame context: {} frame(s) in flight on {} backend", fif, backend.name());
        Ok(Self {
            backend,
            frame_counter: FrameCounter::new(0, fif),
            queues,
            descriptors,
            temp_buffers,
            slot_receipts: vec![QueueKind::ALL.map(Receipt::null); fif],
            deferred: (0..fif).map(|_| Vec::new()).collect(),
            settings,
        })
    }
}
impl<B: GfxBackend> Drop for FrameContext<B> {
    fn drop(&mut self) {
        log::info!("Dropping FrameContext");
        self.queues.wait_for_idle();
        for slot in 0..self.deferred.len() {
            self.run_deferred(slot);
        }
    }
}
// destroy
impl<B: GfxBackend> FrameContext<B> {
    /// 等待 GPU 空闲，执行所有延迟释放，然后释放临时 page 与描述符堆
    #[inline]
    pub fn destroy(self) {
        drop(self)
    }
}
// getters
impl<B: GfxBackend> FrameContext<B> {
    #[inline]
    pub fn backend(&self) -> &Arc<B> {
        &self.backend
    }

    #[inline]
    pub fn settings(&self) -> &FrameSettings {
        &self.settings
    }

    #[inline]
    pub fn frame_counter(&self) -> &FrameCounter {
        &self.frame_counter
    }

    /// 当前帧使用的 slot
    #[inline]
    pub fn current_slot(&self) -> usize {
        *self.frame_counter.frame_label()
    }

    #[inline]
    pub fn queues(&self) -> &CommandQueueManager<B> {
        &self.queues
    }

    #[inline]
    pub fn descriptors(&self) -> &DescriptorHeapManager<B> {
        &self.descriptors
    }

    #[inline]
    pub fn descriptors_mut(&mut self) -> &mut DescriptorHeapManager<B> {
        &mut self.descriptors
    }

    #[inline]
    pub fn temp_buffers(&self) -> &TempBufferAllocator<B> {
        &self.temp_buffers
    }

    #[inline]
    pub fn temp_buffers_mut(&mut self) -> &mut TempBufferAllocator<B> {
        &mut self.temp_buffers
    }

    #[inline]
    pub fn slot_receipts(&self, slot: usize) -> &[Receipt; QueueKind::COUNT] {
        &self.slot_receipts[slot]
    }

    /// 某个 slot 上等待释放的资源数量
    #[inline]
    pub fn deferred_count(&self, slot: usize) -> usize {
        self.deferred[slot].len()
    }
}
// 帧轮转
impl<B: GfxBackend> FrameContext<B> {
    /// 开始新的一帧
    ///
    /// 新 slot 上一轮提交的工作没有完成时会阻塞
    pub fn begin_frame(&mut self) {
        #[cfg(feature = "tracy")]
        let _span = tracy_client::span!("FrameContext::begin_frame");

        self.seal_slot(self.current_slot());
        self.frame_counter.next_frame();
        let slot = self.current_slot();

        for receipt in self.slot_receipts[slot] {
            self.queues.wait_for_completion(receipt);
        }
        self.run_deferred(slot);

        self.descriptors.next_frame();
        self.temp_buffers.next_frame();
        debug_assert_eq!(self.descriptors.frame_index(), slot);
        debug_assert_eq!(self.temp_buffers.frame_index(), slot);

        log::trace!("{} begin", self.frame_counter.frame_name());
    }

    /// 离开 slot 时，用每条队列最后一次提交覆盖该 slot 的 receipt
    ///
    /// 通过 `queues()` 直接提交的工作不会经过 [`Self::submit`]，也需要被该 slot 等待
    fn seal_slot(&mut self, slot: usize) {
        for kind in QueueKind::ALL {
            let last = self.queues.last_issued(kind);
            let receipt = &mut self.slot_receipts[slot][kind.index()];
            if !last.is_null() && (receipt.is_null() || last.value() > receipt.value()) {
                *receipt = last;
            }
        }
    }

    fn run_deferred(&mut self, slot: usize) {
        let releases = std::mem::take(&mut self.deferred[slot]);
        if !releases.is_empty() {
            log::trace!("slot {}: run {} deferred release(s)", slot, releases.len());
        }
        for release in releases {
            match release {
                DeferredRelease::Descriptor(descriptor) => self.descriptors.free_persistent(descriptor),
                DeferredRelease::Buffer(buffer) => self.backend.destroy_buffer(buffer),
                DeferredRelease::Callback(callback) => callback(),
            }
        }
    }
}
// 提交
impl<B: GfxBackend> FrameContext<B> {
    /// 提交到 `kind` 队列，并把 receipt 记录到当前 slot
    pub fn submit(&mut self, lists: &mut [&mut CommandList<B>], kind: QueueKind) -> Receipt {
        let receipt = self.queues.submit_commands(lists, kind);
        if !receipt.is_null() {
            let slot = self.current_slot();
            self.slot_receipts[slot][kind.index()] = receipt;
        }
        receipt
    }
}
// 延迟释放
impl<B: GfxBackend> FrameContext<B> {
    /// 当前 slot 的工作完成之后释放持久描述符
    pub fn defer_free_descriptor(&mut self, descriptor: Descriptor) {
        if descriptor.is_null() {
            log::warn!("defer free of a null {} descriptor", descriptor.kind());
            return;
        }
        let slot = self.current_slot();
        self.deferred[slot].push(DeferredRelease::Descriptor(descriptor));
    }

    pub fn defer_destroy_buffer(&mut self, buffer: B::Buffer) {
        let slot = self.current_slot();
        self.deferred[slot].push(DeferredRelease::Buffer(buffer));
    }

    pub fn defer_release(&mut self, release: impl FnOnce() + Send + 'static) {
        let slot = self.current_slot();
        self.deferred[slot].push(DeferredRelease::Callback(Box::new(release)));
    }
}
// 全局同步
impl<B: GfxBackend> FrameContext<B> {
    #[inline]
    pub fn wait_for_idle(&self) {
        self.queues.wait_for_idle();
    }

    /// 交换链重建之后调用
    ///
    /// 新的 image 数量不合法时返回错误，状态不变；否则等待 GPU 空闲，释放所有临时资源与延迟释放的资源
    pub fn resize(&mut self, swapchain_image_count: usize) -> Result<(), FrameError> {
        let settings = FrameSettings {
            swapchain_image_count,
            ..self.settings.clone()
        };
        settings.validate()?;

        self.wait_for_idle();
        for slot in 0..self.deferred.len() {
            self.run_deferred(slot);
        }
        self.descriptors.free_all_temp();
        self.temp_buffers.free_all_temp_pages();

        log::info!("resize frame context: {} swapchain image(s)", swapchain_image_count);
        self.settings = settings;
        Ok(())
    }
}

use std::sync::Arc;

use truvis_gfx::backend::{GfxBackend, GfxBufferCopy, QueueKind};
use truvis_gfx::commands::barrier::{BarrierBatch, GfxBufferBarrier, GfxGlobalBarrier, GfxTextureBarrier};

use crate::command_queue::CommandQueueManager;
use crate::receipt::Receipt;

/// 每种 barrier 的批次容量，批次满时会先隐式 flush
pub const MAX_BATCHED_BARRIERS: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandListState {
    /// 可以 begin
    Initial,
    Recording,
    /// 已经 end，等待提交
    Executable,
}

/// 录制 GPU 命令的 command list
///
/// 每个 frame slot 一个原生 command buffer，按环形轮转使用。
/// `begin` 时如果当前 slot 的 command buffer 上一次提交的工作还没有完成，会先等待。
///
/// # Barrier 批处理
/// global / texture / buffer 三类 barrier 各有一个容量为 [`MAX_BATCHED_BARRIERS`] 的批次，
/// `flush_barriers` 时每个非空批次只调用一次后端。依赖这些状态转换的命令录制之前需要手动 flush。
pub struct CommandList<B: GfxBackend> {
    backend: Arc<B>,
    kind: QueueKind,
    name: String,

    /// 下标是 frame slot
    command_buffers: Vec<B::CommandBuffer>,
    /// 每个 command buffer 最后一次提交的 receipt
    receipts: Vec<Receipt>,

    /// 下一次 begin 使用的 slot，end 时前进
    frame_index: usize,
    /// 正在录制或者等待提交的 slot
    recorded_slot: usize,
    state: CommandListState,

    global_barriers: Vec<GfxGlobalBarrier>,
    texture_barriers: Vec<GfxTextureBarrier>,
    buffer_barriers: Vec<GfxBufferBarrier>,

    /// 本次录制中 flush 的次数
    flush_count: usize,
    /// 本次录制中交给后端的 barrier 总数
    issued_barrier_count: usize,
}
// new & init
impl<B: GfxBackend> CommandList<B> {
    pub fn new(
        backend: Arc<B>,
        kind: QueueKind,
        frames_in_flight: usize,
        name: impl AsRef<str>,
    ) -> truvis_gfx::error::GfxResult<Self> {
        let name = name.as_ref().to_string();
        let mut list = Self {
            backend,
            kind,
            name,
            command_buffers: Vec::with_capacity(frames_in_flight),
            receipts: vec![Receipt::null(kind); frames_in_flight],
            frame_index: 0,
            recorded_slot: 0,
            state: CommandListState::Initial,
            global_barriers: Vec::with_capacity(MAX_BATCHED_BARRIERS),
            texture_barriers: Vec::with_capacity(MAX_BATCHED_BARRIERS),
            buffer_barriers: Vec::with_capacity(MAX_BATCHED_BARRIERS),
            flush_count: 0,
            issued_barrier_count: 0,
        };

        // 失败时已经创建的 command buffer 由 Drop 释放
        for slot in 0..frames_in_flight.max(1) {
            let command_buffer = list.backend.create_command_buffer(kind, &format!("[{}]{}", slot, list.name))?;
            list.command_buffers.push(command_buffer);
        }
        list.receipts.resize(list.command_buffers.len(), Receipt::null(kind));
        Ok(list)
    }
}
impl<B: GfxBackend> Drop for CommandList<B> {
    fn drop(&mut self) {
        log::info!("Dropping CommandList: {}", self.name);
        for command_buffer in self.command_buffers.drain(..) {
            self.backend.destroy_command_buffer(command_buffer);
        }
    }
}
// destroy
impl<B: GfxBackend> CommandList<B> {
    /// 调用者需要保证提交过的工作已经完成
    #[inline]
    pub fn destroy(self) {
        drop(self)
    }
}
// getters
impl<B: GfxBackend> CommandList<B> {
    #[inline]
    pub fn kind(&self) -> QueueKind {
        self.kind
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn state(&self) -> CommandListState {
        self.state
    }

    /// 下一次 begin 使用的 slot
    #[inline]
    pub fn frame_index(&self) -> usize {
        self.frame_index
    }

    #[inline]
    pub fn frames_in_flight(&self) -> usize {
        self.command_buffers.len()
    }

    /// slot 上一次提交的 receipt
    #[inline]
    pub fn slot_receipt(&self, slot: usize) -> Receipt {
        self.receipts[slot]
    }

    /// 还没有 flush 的 barrier 数量
    #[inline]
    pub fn pending_barrier_count(&self) -> usize {
        self.global_barriers.len() + self.texture_barriers.len() + self.buffer_barriers.len()
    }

    #[inline]
    pub fn flush_count(&self) -> usize {
        self.flush_count
    }

    #[inline]
    pub fn issued_barrier_count(&self) -> usize {
        self.issued_barrier_count
    }

    /// 正在录制的原生 command buffer，用于录制本模块之外的命令
    ///
    /// 录制之前需要先 [`CommandList::flush_barriers`]
    pub fn native_mut(&mut self) -> Option<&mut B::CommandBuffer> {
        if self.state != CommandListState::Recording {
            return None;
        }
        Some(&mut self.command_buffers[self.recorded_slot])
    }
}
// 录制
impl<B: GfxBackend> CommandList<B> {
    /// 选择当前 slot 的 command buffer 并开始录制
    ///
    /// 该 command buffer 上一次提交的工作还没有完成时会阻塞等待。返回是否成功进入录制状态。
    pub fn begin(&mut self, queues: &CommandQueueManager<B>) -> bool {
        if self.state != CommandListState::Initial {
            log::warn!("command list `{}`: begin in {:?} state", self.name, self.state);
            return false;
        }

        let slot = self.frame_index;
        let previous = self.receipts[slot];
        if !queues.is_complete(previous) {
            log::trace!("command list `{}`: slot {} still in flight, wait {}", self.name, slot, previous);
            queues.wait_for_completion(previous);
        }

        self.global_barriers.clear();
        self.texture_barriers.clear();
        self.buffer_barriers.clear();
        self.flush_count = 0;
        self.issued_barrier_count = 0;

        if let Err(e) = self.backend.begin_command_buffer(&mut self.command_buffers[slot]) {
            log::error!("command list `{}`: begin failed: {}", self.name, e);
            return false;
        }
        self.recorded_slot = slot;
        self.state = CommandListState::Recording;
        true
    }

    /// 结束录制，并将 frame index 前进到下一个 slot
    ///
    /// 还有没 flush 的 barrier 时给出警告，然后 flush，保证它们不会被丢弃
    pub fn end(&mut self) -> bool {
        if self.state != CommandListState::Recording {
            log::warn!("command list `{}`: end in {:?} state", self.name, self.state);
            return false;
        }

        let pending = self.pending_barrier_count();
        if pending > 0 {
            log::warn!(
                "command list `{}`: {} barrier(s) not flushed before end, commands recorded after them did not observe the transitions",
                self.name,
                pending
            );
            self.flush_barriers();
        }

        let result = self.backend.end_command_buffer(&mut self.command_buffers[self.recorded_slot]);
        self.frame_index = (self.frame_index + 1) % self.command_buffers.len();
        match result {
            Ok(()) => {
                self.state = CommandListState::Executable;
                true
            }
            Err(e) => {
                log::error!("command list `{}`: end failed: {}", self.name, e);
                self.state = CommandListState::Initial;
                false
            }
        }
    }

    pub fn add_global_barrier(&mut self, barrier: GfxGlobalBarrier) {
        if !self.check_recording("add global barrier") {
            return;
        }
        if self.global_barriers.len() == MAX_BATCHED_BARRIERS {
            self.flush_barriers();
        }
        self.global_barriers.push(barrier);
    }

    pub fn add_texture_barrier(&mut self, barrier: GfxTextureBarrier) {
        if !self.check_recording("add texture barrier") {
            return;
        }
        if self.texture_barriers.len() == MAX_BATCHED_BARRIERS {
            self.flush_barriers();
        }
        self.texture_barriers.push(barrier);
    }

    pub fn add_buffer_barrier(&mut self, barrier: GfxBufferBarrier) {
        if !self.check_recording("add buffer barrier") {
            return;
        }
        if self.buffer_barriers.len() == MAX_BATCHED_BARRIERS {
            self.flush_barriers();
        }
        self.buffer_barriers.push(barrier);
    }

    /// 每个非空批次调用一次后端，然后清空批次
    pub fn flush_barriers(&mut self) {
        if self.pending_barrier_count() == 0 || !self.check_recording("flush barriers") {
            return;
        }

        let command_buffer = &mut self.command_buffers[self.recorded_slot];
        let batches = [
            BarrierBatch::Global(&self.global_barriers),
            BarrierBatch::Texture(&self.texture_barriers),
            BarrierBatch::Buffer(&self.buffer_barriers),
        ];
        for batch in batches.into_iter().filter(|batch| !batch.is_empty()) {
            self.issued_barrier_count += batch.len();
            self.backend.issue_barriers(command_buffer, batch);
        }

        self.global_barriers.clear();
        self.texture_barriers.clear();
        self.buffer_barriers.clear();
        self.flush_count += 1;
    }

    /// buffer 之间的拷贝，常用于把临时 buffer 中的数据上传到 GPU 资源
    pub fn copy_buffer(&mut self, copy: &GfxBufferCopy) {
        if !self.check_recording("copy buffer") {
            return;
        }
        self.backend.copy_buffer(&mut self.command_buffers[self.recorded_slot], copy);
    }

    fn check_recording(&self, what: &str) -> bool {
        if self.state == CommandListState::Recording {
            true
        } else {
            log::warn!("command list `{}`: {} outside begin/end", self.name, what);
            false
        }
    }
}
// 提交
impl<B: GfxBackend> CommandList<B> {
    #[inline]
    pub(crate) fn submit_target(&self) -> &B::CommandBuffer {
        &self.command_buffers[self.recorded_slot]
    }

    pub(crate) fn mark_submitted(&mut self, receipt: Receipt) {
        self.receipts[self.recorded_slot] = receipt;
        self.state = CommandListState::Initial;
    }
}

#[cfg(test)]
mod tests {
    use truvis_gfx::backend::RawHandle;
    use truvis_gfx::commands::barrier::{BarrierClass, ResourceState};
    use truvis_gfx::headless::{HeadlessBackend, HeadlessCommand};

    use super::*;

    fn texture_barrier(i: u64) -> GfxTextureBarrier {
        GfxTextureBarrier::new(RawHandle(i + 1)).transition(ResourceState::COPY_DEST, ResourceState::SHADER_RESOURCE)
    }

    fn setup() -> (Arc<HeadlessBackend>, CommandQueueManager<HeadlessBackend>) {
        let backend = Arc::new(HeadlessBackend::deferred());
        let queues = CommandQueueManager::new(backend.clone());
        (backend, queues)
    }

    #[test]
    fn test_batch_overflow_flushes_once() {
        let (backend, queues) = setup();
        let mut list = CommandList::new(backend.clone(), QueueKind::Graphics, 3, "overflow").unwrap();
        assert!(list.begin(&queues));

        for i in 0..MAX_BATCHED_BARRIERS as u64 {
            list.add_texture_barrier(texture_barrier(i));
        }
        assert_eq!(list.flush_count(), 0);

        list.add_texture_barrier(texture_barrier(100));
        assert_eq!(list.flush_count(), 1);
        assert_eq!(list.pending_barrier_count(), 1);

        list.flush_barriers();
        assert_eq!(list.flush_count(), 2);
        assert_eq!(list.issued_barrier_count(), MAX_BATCHED_BARRIERS + 1);
        assert!(list.end());

        let receipt = queues.submit_commands(&mut [&mut list], QueueKind::Graphics);
        assert!(!receipt.is_null());
        let submissions = backend.submissions();
        assert_eq!(
            submissions[0].commands,
            vec![
                HeadlessCommand::Barriers {
                    class: BarrierClass::Texture,
                    count: MAX_BATCHED_BARRIERS
                },
                HeadlessCommand::Barriers {
                    class: BarrierClass::Texture,
                    count: 1
                },
            ]
        );
    }

    #[test]
    fn test_flush_issues_one_call_per_class() {
        let (backend, queues) = setup();
        let mut list = CommandList::new(backend.clone(), QueueKind::Compute, 2, "classes").unwrap();
        assert!(list.begin(&queues));

        let uav = ResourceState::UNORDERED_ACCESS;
        list.add_global_barrier(GfxGlobalBarrier::new(uav, uav));
        for i in 1..=2 {
            list.add_buffer_barrier(
                GfxBufferBarrier::new(RawHandle(i)).transition(ResourceState::COPY_DEST, ResourceState::SHADER_RESOURCE),
            );
        }
        list.flush_barriers();
        // 空的 flush 不计数
        list.flush_barriers();
        assert_eq!(list.flush_count(), 1);
        assert!(list.end());

        queues.submit_commands(&mut [&mut list], QueueKind::Compute);
        let commands = &backend.submissions()[0].commands;
        assert_eq!(commands.len(), 2);
        assert_eq!(
            commands[1],
            HeadlessCommand::Barriers {
                class: BarrierClass::Buffer,
                count: 2
            }
        );
    }

    #[test]
    fn test_end_flushes_pending_barriers() {
        let (backend, queues) = setup();
        let mut list = CommandList::new(backend.clone(), QueueKind::Graphics, 2, "pending").unwrap();
        assert!(list.begin(&queues));
        list.add_texture_barrier(texture_barrier(0));
        assert!(list.end());

        assert_eq!(list.pending_barrier_count(), 0);
        assert_eq!(list.issued_barrier_count(), 1);
        assert_eq!(list.frame_index(), 1);
    }

    #[test]
    fn test_recording_outside_begin_is_ignored() {
        let (backend, queues) = setup();
        let mut list = CommandList::new(backend, QueueKind::Copy, 2, "idle").unwrap();
        list.add_texture_barrier(texture_barrier(0));
        assert_eq!(list.pending_barrier_count(), 0);
        assert!(list.native_mut().is_none());
        assert!(!list.end());

        assert!(list.begin(&queues));
        assert!(!list.begin(&queues));
        assert!(list.native_mut().is_some());
    }

    #[test]
    fn test_begin_waits_for_ring_slot() {
        let (backend, queues) = setup();
        let mut list = CommandList::new(backend.clone(), QueueKind::Graphics, 2, "ring").unwrap();

        let mut receipts = Vec::new();
        for _ in 0..2 {
            assert!(list.begin(&queues));
            assert!(list.end());
            receipts.push(queues.submit_commands(&mut [&mut list], QueueKind::Graphics));
        }
        assert!(!queues.is_complete(receipts[0]));

        // slot 0 被再次使用，需要等待第一次提交
        assert_eq!(list.frame_index(), 0);
        assert!(list.begin(&queues));
        assert!(queues.is_complete(receipts[0]));
        assert!(!queues.is_complete(receipts[1]));
        assert_eq!(list.slot_receipt(1), receipts[1]);
    }

    #[test]
    fn test_copy_buffer_is_recorded() {
        let (backend, queues) = setup();
        let mut list = CommandList::new(backend.clone(), QueueKind::Copy, 1, "copy").unwrap();
        let copy = GfxBufferCopy {
            src: RawHandle(1),
            src_offset: 0,
            dst: RawHandle(2),
            dst_offset: 64,
            size: 16,
        };
        assert!(list.begin(&queues));
        list.copy_buffer(&copy);
        assert!(list.end());
        queues.submit_commands(&mut [&mut list], QueueKind::Copy);
        assert_eq!(backend.submissions()[0].commands, vec![HeadlessCommand::CopyBuffer(copy)]);
    }
}

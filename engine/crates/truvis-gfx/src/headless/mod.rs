//! Headless 后端
//!
//! 在 CPU 上模拟一个异步执行的 GPU：
//! - buffer 是堆内存，创建时即"持久映射"
//! - command buffer 只记录命令日志，提交后可以在 [`HeadlessBackend::submissions`] 中查看
//! - 每个队列维护 submitted / completed 两个计数器，`completed` 只会在"GPU 执行"时推进
//!
//! 两种完成模式：
//! - [`CompletionMode::Immediate`]：提交即完成
//! - [`CompletionMode::Deferred`]：提交后保持 pending，直到被等待，或者测试代码显式调用
//!   [`HeadlessBackend::complete_up_to`] / [`HeadlessBackend::complete_all`]

mod buffer;
mod command_buffer;

use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

pub use buffer::HeadlessBuffer;
pub use command_buffer::{HeadlessCommand, HeadlessCommandBuffer};

use crate::backend::{GfxBackend, GfxBufferCopy, GfxBufferDesc, QueueKind, RawHandle};
use crate::commands::barrier::BarrierBatch;
use crate::descriptors::descriptor_kind::{DescriptorHeapDesc, DescriptorKindMap};
use crate::error::{GfxError, GfxResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionMode {
    Immediate,
    Deferred,
}

/// 一次提交的记录
#[derive(Debug, Clone)]
pub struct HeadlessSubmission {
    pub queue: QueueKind,
    pub signal_value: u64,
    /// 按提交顺序展开后的全部命令
    pub commands: Vec<HeadlessCommand>,
}

/// buffer 被销毁时交给 release hook 的信息
#[derive(Debug, Clone, Copy)]
pub struct HeadlessRelease {
    pub buffer: RawHandle,
    pub size: u64,
    /// 销毁时刻各个队列已经完成的计数器
    pub completed: [u64; QueueKind::COUNT],
    /// 销毁时刻各个队列已经提交的计数器
    pub submitted: [u64; QueueKind::COUNT],
}

pub type HeadlessReleaseHook = Box<dyn Fn(&HeadlessRelease) + Send + Sync>;

pub struct HeadlessDescriptorHeap {
    capacities: DescriptorKindMap<u32>,
}
impl HeadlessDescriptorHeap {
    #[inline]
    pub fn capacities(&self) -> &DescriptorKindMap<u32> {
        &self.capacities
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct HeadlessTimeline {
    submitted: u64,
    completed: u64,
}

#[derive(Default)]
struct HeadlessState {
    timelines: [HeadlessTimeline; QueueKind::COUNT],
    submissions: Vec<HeadlessSubmission>,

    live_buffers: usize,
    live_bytes: u64,
    memory_budget: Option<u64>,
    failing_allocations: u32,

    device_lost: bool,
}

pub struct HeadlessBackend {
    mode: CompletionMode,
    next_id: AtomicU64,
    state: Mutex<HeadlessState>,
    release_hook: Mutex<Option<HeadlessReleaseHook>>,
}
// new & init
impl HeadlessBackend {
    pub fn new(mode: CompletionMode) -> Self {
        log::info!("create headless backend, completion mode: {:?}", mode);
        Self {
            mode,
            next_id: AtomicU64::new(1),
            state: Mutex::new(HeadlessState::default()),
            release_hook: Mutex::new(None),
        }
    }

    /// 提交即完成
    #[inline]
    pub fn immediate() -> Self {
        Self::new(CompletionMode::Immediate)
    }

    /// 提交后保持 pending，直到被等待
    #[inline]
    pub fn deferred() -> Self {
        Self::new(CompletionMode::Deferred)
    }
}
// 测试与调试用的控制接口
impl HeadlessBackend {
    #[inline]
    pub fn mode(&self) -> CompletionMode {
        self.mode
    }

    /// 接下来的 `count` 次 buffer 创建都会失败
    pub fn fail_next_allocations(&self, count: u32) {
        self.state().failing_allocations = count;
    }

    /// 限制所有存活 buffer 的总字节数
    pub fn set_memory_budget(&self, budget: Option<u64>) {
        self.state().memory_budget = budget;
    }

    /// 模拟设备丢失，之后所有的提交与等待都会返回 [`GfxError::DeviceLost`]
    pub fn lose_device(&self) {
        log::warn!("headless backend: simulate device lost");
        self.state().device_lost = true;
    }

    pub fn set_release_hook(&self, hook: impl Fn(&HeadlessRelease) + Send + Sync + 'static) {
        *self.release_hook.lock().unwrap_or_else(PoisonError::into_inner) = Some(Box::new(hook));
    }

    /// "GPU" 执行到 `value`，不会超过已经提交的值
    pub fn complete_up_to(&self, queue: QueueKind, value: u64) {
        let mut state = self.state();
        let timeline = &mut state.timelines[queue.index()];
        timeline.completed = timeline.completed.max(value.min(timeline.submitted));
    }

    /// 所有队列执行完所有已提交的工作
    pub fn complete_all(&self) {
        let mut state = self.state();
        for timeline in &mut state.timelines {
            timeline.completed = timeline.submitted;
        }
    }

    #[inline]
    pub fn completed(&self, queue: QueueKind) -> u64 {
        self.state().timelines[queue.index()].completed
    }

    #[inline]
    pub fn submitted(&self, queue: QueueKind) -> u64 {
        self.state().timelines[queue.index()].submitted
    }

    pub fn submissions(&self) -> Vec<HeadlessSubmission> {
        self.state().submissions.clone()
    }

    #[inline]
    pub fn live_buffer_count(&self) -> usize {
        self.state().live_buffers
    }

    #[inline]
    pub fn live_bytes(&self) -> u64 {
        self.state().live_bytes
    }

    #[inline]
    fn state(&self) -> MutexGuard<'_, HeadlessState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[inline]
    fn alloc_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn check_device(state: &HeadlessState) -> GfxResult<()> {
        if state.device_lost { Err(GfxError::DeviceLost) } else { Ok(()) }
    }

    /// 记录一次 signal，并根据完成模式推进 completed
    fn push_signal(&self, state: &mut HeadlessState, queue: QueueKind, value: u64) -> GfxResult<()> {
        let timeline = &mut state.timelines[queue.index()];
        if value <= timeline.submitted {
            return Err(GfxError::InvalidUsage(format!(
                "{} queue counter must increase: signal {} after {}",
                queue, value, timeline.submitted
            )));
        }
        timeline.submitted = value;
        if self.mode == CompletionMode::Immediate {
            timeline.completed = value;
        }
        Ok(())
    }
}
impl Default for HeadlessBackend {
    fn default() -> Self {
        Self::immediate()
    }
}

impl GfxBackend for HeadlessBackend {
    type Buffer = HeadlessBuffer;
    type CommandBuffer = HeadlessCommandBuffer;
    type DescriptorHeap = HeadlessDescriptorHeap;

    fn name(&self) -> &'static str {
        "headless"
    }

    fn create_buffer(&self, desc: &GfxBufferDesc<'_>) -> GfxResult<Self::Buffer> {
        if desc.size == 0 {
            return Err(GfxError::InvalidUsage(format!("buffer `{}` has zero size", desc.debug_name)));
        }
        if !desc.alignment.is_power_of_two() {
            return Err(GfxError::InvalidUsage(format!(
                "buffer `{}` alignment {} is not a power of two",
                desc.debug_name, desc.alignment
            )));
        }

        let mut state = self.state();
        if state.failing_allocations > 0 {
            state.failing_allocations -= 1;
            return Err(GfxError::OutOfMemory);
        }
        // 超过 isize::MAX 的分配一定失败
        let size = usize::try_from(desc.size)
            .ok()
            .filter(|size| isize::try_from(*size).is_ok())
            .ok_or(GfxError::OutOfMemory)?;
        let live_bytes = state.live_bytes.checked_add(desc.size).ok_or(GfxError::OutOfMemory)?;
        if state.memory_budget.is_some_and(|budget| live_bytes > budget) {
            return Err(GfxError::OutOfMemory);
        }

        let buffer = HeadlessBuffer::new(self.alloc_id(), size)?;
        state.live_buffers += 1;
        state.live_bytes = live_bytes;
        Ok(buffer)
    }

    fn mapped_ptr(&self, buffer: &Self::Buffer) -> Option<NonNull<u8>> {
        Some(buffer.ptr())
    }

    fn buffer_handle(&self, buffer: &Self::Buffer) -> RawHandle {
        RawHandle(buffer.id())
    }

    fn buffer_size(&self, buffer: &Self::Buffer) -> u64 {
        buffer.size()
    }

    fn destroy_buffer(&self, buffer: Self::Buffer) {
        let release = {
            let mut state = self.state();
            state.live_buffers -= 1;
            state.live_bytes -= buffer.size();
            HeadlessRelease {
                buffer: RawHandle(buffer.id()),
                size: buffer.size(),
                completed: state.timelines.map(|t| t.completed),
                submitted: state.timelines.map(|t| t.submitted),
            }
        };

        // hook 中可能会再次访问 backend，不能持有 state 锁
        if let Some(hook) = self.release_hook.lock().unwrap_or_else(PoisonError::into_inner).as_ref() {
            hook(&release);
        }
        drop(buffer);
    }

    fn create_descriptor_heap(&self, desc: &DescriptorHeapDesc) -> GfxResult<Self::DescriptorHeap> {
        log::info!("headless: create descriptor heap `{}`: {:?}", desc.debug_name, desc.capacities);
        Ok(HeadlessDescriptorHeap {
            capacities: desc.capacities,
        })
    }

    fn destroy_descriptor_heap(&self, _heap: Self::DescriptorHeap) {}

    fn create_command_buffer(&self, queue: QueueKind, debug_name: &str) -> GfxResult<Self::CommandBuffer> {
        Ok(HeadlessCommandBuffer::new(self.alloc_id(), queue, debug_name))
    }

    fn destroy_command_buffer(&self, _command_buffer: Self::CommandBuffer) {}

    fn begin_command_buffer(&self, command_buffer: &mut Self::CommandBuffer) -> GfxResult<()> {
        command_buffer.begin()
    }

    fn end_command_buffer(&self, command_buffer: &mut Self::CommandBuffer) -> GfxResult<()> {
        command_buffer.end()
    }

    fn issue_barriers(&self, command_buffer: &mut Self::CommandBuffer, batch: BarrierBatch<'_>) {
        command_buffer.record(HeadlessCommand::Barriers {
            class: batch.class(),
            count: batch.len(),
        });
    }

    fn copy_buffer(&self, command_buffer: &mut Self::CommandBuffer, copy: &GfxBufferCopy) {
        command_buffer.record(HeadlessCommand::CopyBuffer(*copy));
    }

    fn submit(&self, queue: QueueKind, command_buffers: &[&Self::CommandBuffer], signal_value: u64) -> GfxResult<()> {
        let mut state = self.state();
        Self::check_device(&state)?;

        if let Some(cmd) = command_buffers.iter().find(|cmd| cmd.is_recording()) {
            return Err(GfxError::InvalidUsage(format!("command buffer `{}` is still recording", cmd.name())));
        }
        if let Some(cmd) = command_buffers.iter().find(|cmd| cmd.queue() != queue) {
            return Err(GfxError::InvalidUsage(format!(
                "command buffer `{}` of {} queue submitted to {} queue",
                cmd.name(),
                cmd.queue(),
                queue
            )));
        }

        self.push_signal(&mut state, queue, signal_value)?;
        let commands = command_buffers.iter().flat_map(|cmd| cmd.commands().iter().copied()).collect();
        state.submissions.push(HeadlessSubmission {
            queue,
            signal_value,
            commands,
        });
        Ok(())
    }

    fn signal(&self, queue: QueueKind, value: u64) -> GfxResult<()> {
        let mut state = self.state();
        Self::check_device(&state)?;
        self.push_signal(&mut state, queue, value)
    }

    fn query_counter(&self, queue: QueueKind) -> GfxResult<u64> {
        let state = self.state();
        Self::check_device(&state)?;
        Ok(state.timelines[queue.index()].completed)
    }

    fn wait_counter(&self, queue: QueueKind, value: u64) -> GfxResult<()> {
        let mut state = self.state();
        Self::check_device(&state)?;

        let timeline = &mut state.timelines[queue.index()];
        if value > timeline.submitted {
            // 真实的 GPU 上这里会永远阻塞
            return Err(GfxError::InvalidUsage(format!(
                "wait on {} queue value {} which is never signalled (submitted {})",
                queue, value, timeline.submitted
            )));
        }
        timeline.completed = timeline.completed.max(value);
        Ok(())
    }

    fn wait_idle(&self) -> GfxResult<()> {
        let mut state = self.state();
        Self::check_device(&state)?;
        for timeline in &mut state.timelines {
            timeline.completed = timeline.submitted;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::commands::barrier::{BarrierClass, GfxTextureBarrier, ResourceState};

    fn record_one_barrier(backend: &HeadlessBackend, queue: QueueKind) -> HeadlessCommandBuffer {
        let mut cmd = backend.create_command_buffer(queue, "test").unwrap();
        backend.begin_command_buffer(&mut cmd).unwrap();
        let barriers = [GfxTextureBarrier::new(RawHandle(7))
            .transition(ResourceState::UNDEFINED, ResourceState::COPY_DEST)];
        backend.issue_barriers(&mut cmd, BarrierBatch::Texture(&barriers));
        backend.end_command_buffer(&mut cmd).unwrap();
        cmd
    }

    #[test]
    fn test_immediate_completion() {
        let backend = HeadlessBackend::immediate();
        let cmd = record_one_barrier(&backend, QueueKind::Graphics);
        assert_eq!(cmd.barrier_call_count(), 1);

        backend.submit(QueueKind::Graphics, &[&cmd], 1).unwrap();
        assert_eq!(backend.query_counter(QueueKind::Graphics).unwrap(), 1);
        assert_eq!(backend.query_counter(QueueKind::Compute).unwrap(), 0);

        let submissions = backend.submissions();
        assert_eq!(submissions.len(), 1);
        assert_eq!(
            submissions[0].commands,
            vec![HeadlessCommand::Barriers {
                class: BarrierClass::Texture,
                count: 1
            }]
        );
    }

    #[test]
    fn test_deferred_completion_by_wait() {
        let backend = HeadlessBackend::deferred();
        let cmd = record_one_barrier(&backend, QueueKind::Copy);

        backend.submit(QueueKind::Copy, &[&cmd], 1).unwrap();
        backend.submit(QueueKind::Copy, &[&cmd], 2).unwrap();
        assert_eq!(backend.query_counter(QueueKind::Copy).unwrap(), 0);

        backend.wait_counter(QueueKind::Copy, 1).unwrap();
        assert_eq!(backend.query_counter(QueueKind::Copy).unwrap(), 1);

        backend.complete_up_to(QueueKind::Copy, 100);
        assert_eq!(backend.completed(QueueKind::Copy), 2);

        assert!(backend.wait_counter(QueueKind::Copy, 3).is_err());
    }

    #[test]
    fn test_submit_rejects_recording_and_mismatched_buffers() {
        let backend = HeadlessBackend::immediate();
        let mut recording = backend.create_command_buffer(QueueKind::Graphics, "recording").unwrap();
        backend.begin_command_buffer(&mut recording).unwrap();
        assert!(matches!(
            backend.submit(QueueKind::Graphics, &[&recording], 1),
            Err(GfxError::InvalidUsage(_))
        ));

        let compute = record_one_barrier(&backend, QueueKind::Compute);
        assert!(matches!(
            backend.submit(QueueKind::Graphics, &[&compute], 1),
            Err(GfxError::InvalidUsage(_))
        ));
        assert_eq!(backend.submitted(QueueKind::Graphics), 0);
    }

    #[test]
    fn test_counter_must_increase() {
        let backend = HeadlessBackend::immediate();
        backend.signal(QueueKind::Compute, 3).unwrap();
        assert!(backend.signal(QueueKind::Compute, 3).is_err());
        assert!(backend.signal(QueueKind::Compute, 2).is_err());
        backend.signal(QueueKind::Compute, 4).unwrap();
    }

    #[test]
    fn test_allocation_failures() {
        let backend = HeadlessBackend::immediate();
        backend.fail_next_allocations(1);
        assert_eq!(
            backend.create_buffer(&GfxBufferDesc::scratch(64, 16, "a")).err(),
            Some(GfxError::OutOfMemory)
        );
        let buffer = backend.create_buffer(&GfxBufferDesc::scratch(64, 16, "b")).unwrap();
        assert_eq!(backend.live_buffer_count(), 1);

        backend.set_memory_budget(Some(100));
        assert_eq!(
            backend.create_buffer(&GfxBufferDesc::scratch(64, 16, "c")).err(),
            Some(GfxError::OutOfMemory)
        );
        backend.destroy_buffer(buffer);
        assert_eq!(backend.live_bytes(), 0);
    }

    #[test]
    fn test_huge_buffer_is_out_of_memory() {
        let backend = HeadlessBackend::immediate();
        for size in [u64::MAX, u64::MAX - 4096, isize::MAX as u64 + 1] {
            assert_eq!(
                backend.create_buffer(&GfxBufferDesc::scratch(size, 16, "huge")).err(),
                Some(GfxError::OutOfMemory)
            );
        }
        assert_eq!(backend.live_buffer_count(), 0);
        assert_eq!(backend.live_bytes(), 0);

        // 设置了预算时同样不会溢出
        let buffer = backend.create_buffer(&GfxBufferDesc::scratch(64, 16, "small")).unwrap();
        backend.set_memory_budget(Some(u64::MAX));
        assert_eq!(
            backend.create_buffer(&GfxBufferDesc::scratch(u64::MAX - 32, 16, "huge")).err(),
            Some(GfxError::OutOfMemory)
        );
        assert_eq!(backend.live_bytes(), 64);
        backend.destroy_buffer(buffer);
    }

    #[test]
    fn test_mapped_memory_round_trip() {
        let backend = HeadlessBackend::immediate();
        let buffer = backend.create_buffer(&GfxBufferDesc::scratch(64, 16, "mapped")).unwrap();
        let ptr = backend.mapped_ptr(&buffer).unwrap();
        // SAFETY: buffer 有 64 字节，此时没有其他访问
        unsafe { std::ptr::copy_nonoverlapping([1u8, 2, 3, 4].as_ptr(), ptr.as_ptr().add(8), 4) };
        assert_eq!(buffer.read(6, 8), vec![0, 0, 1, 2, 3, 4, 0, 0]);
        assert_eq!(backend.buffer_size(&buffer), 64);
        backend.destroy_buffer(buffer);
    }

    #[test]
    fn test_device_lost() {
        let backend = HeadlessBackend::immediate();
        backend.lose_device();
        assert_eq!(backend.signal(QueueKind::Graphics, 1), Err(GfxError::DeviceLost));
        assert_eq!(backend.query_counter(QueueKind::Graphics), Err(GfxError::DeviceLost));
        assert_eq!(backend.wait_idle(), Err(GfxError::DeviceLost));
    }

    #[test]
    fn test_release_hook_sees_counters() {
        let backend = Arc::new(HeadlessBackend::deferred());
        let releases = Arc::new(Mutex::new(Vec::new()));
        {
            let releases = releases.clone();
            backend.set_release_hook(move |release| releases.lock().unwrap().push(*release));
        }

        let buffer = backend.create_buffer(&GfxBufferDesc::scratch(32, 4, "hooked")).unwrap();
        let handle = backend.buffer_handle(&buffer);
        backend.signal(QueueKind::Graphics, 5).unwrap();
        backend.destroy_buffer(buffer);

        let releases = releases.lock().unwrap();
        assert_eq!(releases.len(), 1);
        assert_eq!(releases[0].buffer, handle);
        assert_eq!(releases[0].submitted[QueueKind::Graphics.index()], 5);
        assert_eq!(releases[0].completed[QueueKind::Graphics.index()], 0);
    }
}

//! 三条硬件队列的提交与完成跟踪
//!
//! 每条队列维护一个单调递增的计数器：
//! - 提交时在 submit 锁内 `+1` 并交给后端 signal，返回携带新值的 [`Receipt`]
//! - `observed` 缓存最近一次观察到的 GPU 计数器，`is_complete` 优先用它判断，避免每次都查询后端
//! - 等待不持有任何锁，与提交以及其他线程的等待互不阻塞

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use itertools::Itertools;
use truvis_gfx::backend::{GfxBackend, QueueKind};
use truvis_gfx::error::GfxError;

use crate::command_list::{CommandList, CommandListState};
use crate::receipt::Receipt;

pub type DeviceLostCallback = Box<dyn FnOnce() + Send>;

struct QueueSlot {
    /// 最后一次 signal 的值，锁同时串行化提交
    last_issued: Mutex<u64>,
    /// 已经观察到的 GPU 计数器，只增不减
    observed: AtomicU64,
}
impl QueueSlot {
    fn new() -> Self {
        Self {
            last_issued: Mutex::new(0),
            observed: AtomicU64::new(0),
        }
    }
}

pub struct CommandQueueManager<B: GfxBackend> {
    backend: Arc<B>,
    queues: [QueueSlot; QueueKind::COUNT],

    device_lost: AtomicBool,
    device_lost_callback: Mutex<Option<DeviceLostCallback>>,
}
// new & init
impl<B: GfxBackend> CommandQueueManager<B> {
    pub fn new(backend: Arc<B>) -> Self {
        log::info!("create command queue manager on {} backend", backend.name());
        Self {
            backend,
            queues: QueueKind::ALL.map(|_| QueueSlot::new()),
            device_lost: AtomicBool::new(false),
            device_lost_callback: Mutex::new(None),
        }
    }

    /// 设备丢失时调用，只会被调用一次
    pub fn set_device_lost_callback(&self, callback: impl FnOnce() + Send + 'static) {
        *self.device_lost_callback.lock().unwrap_or_else(PoisonError::into_inner) = Some(Box::new(callback));
    }
}
// getters
impl<B: GfxBackend> CommandQueueManager<B> {
    #[inline]
    pub fn backend(&self) -> &Arc<B> {
        &self.backend
    }

    #[inline]
    pub fn is_device_lost(&self) -> bool {
        self.device_lost.load(Ordering::Acquire)
    }

    /// 该队列最后一次提交的 receipt，没有提交过时返回空 receipt
    pub fn last_issued(&self, kind: QueueKind) -> Receipt {
        let last = *self.queue(kind).last_issued.lock().unwrap_or_else(PoisonError::into_inner);
        if last == 0 { Receipt::null(kind) } else { Receipt::new(kind, last) }
    }

    /// 最近一次观察到的 GPU 计数器
    #[inline]
    pub fn observed(&self, kind: QueueKind) -> u64 {
        self.queue(kind).observed.load(Ordering::Acquire)
    }

    #[inline]
    fn queue(&self, kind: QueueKind) -> &QueueSlot {
        &self.queues[kind.index()]
    }
}
// 提交
impl<B: GfxBackend> CommandQueueManager<B> {
    /// 按顺序执行 `lists`，然后 signal 该队列的计数器
    ///
    /// 以下情况返回空 receipt，并且不会触碰队列：
    /// - `lists` 为空
    /// - 存在类型不是 `kind` 的 list
    /// - 存在没有 end 的 list
    /// - 设备已经丢失
    pub fn submit_commands(&self, lists: &mut [&mut CommandList<B>], kind: QueueKind) -> Receipt {
        #[cfg(feature = "tracy")]
        let _span = tracy_client::span!("CommandQueueManager::submit_commands");

        if self.is_device_lost() {
            log::error!("submit to {} queue after device lost", kind);
            return Receipt::null(kind);
        }
        if lists.is_empty() {
            log::error!("submit zero command lists to {} queue", kind);
            return Receipt::null(kind);
        }
        if let Some(list) = lists.iter().find(|list| list.kind() != kind) {
            log::error!("command list `{}` of {} type submitted to {} queue", list.name(), list.kind(), kind);
            return Receipt::null(kind);
        }
        if let Some(list) = lists.iter().find(|list| list.state() != CommandListState::Executable) {
            log::error!("command list `{}` submitted in {:?} state", list.name(), list.state());
            return Receipt::null(kind);
        }

        let queue = self.queue(kind);
        let receipt = {
            let mut last_issued = queue.last_issued.lock().unwrap_or_else(PoisonError::into_inner);
            let value = *last_issued + 1;
            let command_buffers = lists.iter().map(|list| list.submit_target()).collect_vec();
            if let Err(e) = self.backend.submit(kind, &command_buffers, value) {
                drop(last_issued);
                self.report_error(e, kind, "submit");
                return Receipt::null(kind);
            }
            *last_issued = value;
            Receipt::new(kind, value)
        };

        for list in lists.iter_mut() {
            list.mark_submitted(receipt);
        }
        log::trace!("submit {} command list(s): {}", lists.len(), receipt);
        receipt
    }

    /// 不带 command list 的 signal，receipt 在队列中之前的工作全部完成后完成
    pub fn signal(&self, kind: QueueKind) -> Receipt {
        if self.is_device_lost() {
            log::error!("signal {} queue after device lost", kind);
            return Receipt::null(kind);
        }

        let queue = self.queue(kind);
        let mut last_issued = queue.last_issued.lock().unwrap_or_else(PoisonError::into_inner);
        let value = *last_issued + 1;
        if let Err(e) = self.backend.signal(kind, value) {
            drop(last_issued);
            self.report_error(e, kind, "signal");
            return Receipt::null(kind);
        }
        *last_issued = value;
        Receipt::new(kind, value)
    }
}
// 完成查询与等待
impl<B: GfxBackend> CommandQueueManager<B> {
    /// 非阻塞地判断 receipt 是否完成，空 receipt 总是完成
    ///
    /// 设备丢失之后所有 receipt 都视为完成
    pub fn is_complete(&self, receipt: Receipt) -> bool {
        if receipt.is_null() || receipt.value() <= self.observed(receipt.queue()) {
            return true;
        }
        if self.is_device_lost() {
            return true;
        }

        match self.backend.query_counter(receipt.queue()) {
            Ok(value) => {
                let observed = self.observe(receipt.queue(), value);
                receipt.value() <= observed
            }
            Err(e) => {
                self.report_error(e, receipt.queue(), "query counter");
                self.is_device_lost()
            }
        }
    }

    /// 只有在 receipt 没有完成时才会阻塞
    ///
    /// 多个线程可以同时等待同一条队列上的不同值，较小的值不会被较大的值挡住
    pub fn wait_for_completion(&self, receipt: Receipt) {
        if self.is_complete(receipt) {
            return;
        }

        log::trace!("wait for {}", receipt);
        match self.backend.wait_counter(receipt.queue(), receipt.value()) {
            Ok(()) => {
                self.observe(receipt.queue(), receipt.value());
            }
            Err(e) => self.report_error(e, receipt.queue(), "wait counter"),
        }
    }

    /// 等待三条队列最后一次提交的工作全部完成
    pub fn wait_for_idle(&self) {
        for kind in QueueKind::ALL {
            self.wait_for_completion(self.last_issued(kind));
        }
    }

    pub fn is_idle(&self) -> bool {
        QueueKind::ALL.into_iter().all(|kind| self.is_complete(self.last_issued(kind)))
    }

    /// 返回更新之后的 observed
    #[inline]
    fn observe(&self, kind: QueueKind, value: u64) -> u64 {
        let previous = self.queue(kind).observed.fetch_max(value, Ordering::AcqRel);
        previous.max(value)
    }
}
// 错误处理
impl<B: GfxBackend> CommandQueueManager<B> {
    fn report_error(&self, error: GfxError, kind: QueueKind, what: &str) {
        if error.is_device_lost() {
            self.mark_device_lost();
        } else {
            log::error!("{} queue: {} failed: {}", kind, what, error);
        }
    }

    fn mark_device_lost(&self) {
        if self.device_lost.swap(true, Ordering::AcqRel) {
            return;
        }
        log::error!("device lost, the frame subsystem must be torn down");

        let callback = self.device_lost_callback.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(callback) = callback {
            callback();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::ptr::NonNull;
    use std::sync::Condvar;
    use std::sync::atomic::AtomicUsize;

    use truvis_gfx::backend::{GfxBufferCopy, GfxBufferDesc, RawHandle};
    use truvis_gfx::commands::barrier::BarrierBatch;
    use truvis_gfx::descriptors::descriptor_kind::DescriptorHeapDesc;
    use truvis_gfx::error::GfxResult;
    use truvis_gfx::headless::{HeadlessBackend, HeadlessBuffer, HeadlessCommandBuffer, HeadlessDescriptorHeap};

    use super::*;

    fn executable_list(
        backend: &Arc<HeadlessBackend>,
        queues: &CommandQueueManager<HeadlessBackend>,
        kind: QueueKind,
    ) -> CommandList<HeadlessBackend> {
        let mut list = CommandList::new(backend.clone(), kind, 2, "test").unwrap();
        assert!(list.begin(queues));
        assert!(list.end());
        list
    }

    #[test]
    fn test_submit_returns_increasing_receipts() {
        let backend = Arc::new(HeadlessBackend::immediate());
        let queues = CommandQueueManager::new(backend.clone());

        let mut list = executable_list(&backend, &queues, QueueKind::Graphics);
        let r1 = queues.submit_commands(&mut [&mut list], QueueKind::Graphics);
        assert_eq!(r1.value(), 1);
        assert_eq!(list.state(), CommandListState::Initial);

        let r2 = queues.signal(QueueKind::Graphics);
        assert_eq!(r2.value(), 2);
        assert_eq!(queues.last_issued(QueueKind::Graphics), r2);
        assert!(queues.last_issued(QueueKind::Copy).is_null());
        assert!(queues.is_complete(r2));
        assert_eq!(queues.observed(QueueKind::Graphics), 2);
    }

    #[test]
    fn test_rejected_submissions_leave_queue_untouched() {
        let backend = Arc::new(HeadlessBackend::immediate());
        let queues = CommandQueueManager::new(backend.clone());

        assert!(queues.submit_commands(&mut [], QueueKind::Graphics).is_null());

        let mut graphics = executable_list(&backend, &queues, QueueKind::Graphics);
        let mut compute = executable_list(&backend, &queues, QueueKind::Compute);
        assert!(
            queues
                .submit_commands(&mut [&mut graphics, &mut compute], QueueKind::Graphics)
                .is_null()
        );

        let mut not_ended = CommandList::new(backend.clone(), QueueKind::Graphics, 2, "open").unwrap();
        assert!(not_ended.begin(&queues));
        assert!(queues.submit_commands(&mut [&mut not_ended], QueueKind::Graphics).is_null());

        assert!(queues.last_issued(QueueKind::Graphics).is_null());
        assert!(backend.submissions().is_empty());
        assert_eq!(graphics.state(), CommandListState::Executable);
    }

    #[test]
    fn test_completion_monotonicity() {
        let backend = Arc::new(HeadlessBackend::deferred());
        let queues = CommandQueueManager::new(backend.clone());

        let receipts = (0..5).map(|_| queues.signal(QueueKind::Compute)).collect_vec();
        backend.complete_up_to(QueueKind::Compute, 3);

        for receipt in &receipts {
            assert_eq!(queues.is_complete(*receipt), receipt.value() <= 3, "{}", receipt);
        }
        assert!(!queues.is_idle());

        queues.wait_for_completion(receipts[4]);
        assert!(receipts.iter().all(|r| queues.is_complete(*r)));
        assert!(queues.is_idle());
    }

    #[test]
    fn test_null_receipt_is_complete() {
        let backend = Arc::new(HeadlessBackend::deferred());
        let queues = CommandQueueManager::new(backend);
        assert!(queues.is_complete(Receipt::null(QueueKind::Copy)));
        queues.wait_for_completion(Receipt::null(QueueKind::Copy));
        queues.wait_for_idle();
    }

    #[test]
    fn test_device_lost_reported_once() {
        let backend = Arc::new(HeadlessBackend::deferred());
        let queues = CommandQueueManager::new(backend.clone());
        let calls = Arc::new(AtomicUsize::new(0));
        {
            let calls = calls.clone();
            queues.set_device_lost_callback(move || {
                calls.fetch_add(1, Ordering::SeqCst);
            });
        }

        let pending = queues.signal(QueueKind::Graphics);
        backend.lose_device();

        assert!(queues.signal(QueueKind::Graphics).is_null());
        assert!(queues.signal(QueueKind::Copy).is_null());
        assert!(queues.is_complete(pending));
        queues.wait_for_completion(pending);

        assert!(queues.is_device_lost());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    /// `wait_counter` 在 `gate` 打开之前阻塞大于 1 的值
    struct GatedBackend {
        inner: HeadlessBackend,
        entered: Mutex<bool>,
        entered_cond: Condvar,
        gate: Mutex<bool>,
        gate_cond: Condvar,
    }
    impl GatedBackend {
        fn wait_entered(&self) {
            let mut entered = self.entered.lock().unwrap();
            while !*entered {
                entered = self.entered_cond.wait(entered).unwrap();
            }
        }

        fn open(&self) {
            *self.gate.lock().unwrap() = true;
            self.gate_cond.notify_all();
        }
    }
    impl GfxBackend for GatedBackend {
        type Buffer = HeadlessBuffer;
        type CommandBuffer = HeadlessCommandBuffer;
        type DescriptorHeap = HeadlessDescriptorHeap;

        fn name(&self) -> &'static str {
            "gated"
        }
        fn create_buffer(&self, desc: &GfxBufferDesc<'_>) -> GfxResult<Self::Buffer> {
            self.inner.create_buffer(desc)
        }
        fn mapped_ptr(&self, buffer: &Self::Buffer) -> Option<NonNull<u8>> {
            self.inner.mapped_ptr(buffer)
        }
        fn buffer_handle(&self, buffer: &Self::Buffer) -> RawHandle {
            self.inner.buffer_handle(buffer)
        }
        fn buffer_size(&self, buffer: &Self::Buffer) -> u64 {
            self.inner.buffer_size(buffer)
        }
        fn destroy_buffer(&self, buffer: Self::Buffer) {
            self.inner.destroy_buffer(buffer)
        }
        fn create_descriptor_heap(&self, desc: &DescriptorHeapDesc) -> GfxResult<Self::DescriptorHeap> {
            self.inner.create_descriptor_heap(desc)
        }
        fn destroy_descriptor_heap(&self, heap: Self::DescriptorHeap) {
            self.inner.destroy_descriptor_heap(heap)
        }
        fn create_command_buffer(&self, queue: QueueKind, debug_name: &str) -> GfxResult<Self::CommandBuffer> {
            self.inner.create_command_buffer(queue, debug_name)
        }
        fn destroy_command_buffer(&self, command_buffer: Self::CommandBuffer) {
            self.inner.destroy_command_buffer(command_buffer)
        }
        fn begin_command_buffer(&self, command_buffer: &mut Self::CommandBuffer) -> GfxResult<()> {
            self.inner.begin_command_buffer(command_buffer)
        }
        fn end_command_buffer(&self, command_buffer: &mut Self::CommandBuffer) -> GfxResult<()> {
            self.inner.end_command_buffer(command_buffer)
        }
        fn issue_barriers(&self, command_buffer: &mut Self::CommandBuffer, batch: BarrierBatch<'_>) {
            self.inner.issue_barriers(command_buffer, batch)
        }
        fn copy_buffer(&self, command_buffer: &mut Self::CommandBuffer, copy: &GfxBufferCopy) {
            self.inner.copy_buffer(command_buffer, copy)
        }
        fn submit(&self, queue: QueueKind, command_buffers: &[&Self::CommandBuffer], signal_value: u64) -> GfxResult<()> {
            self.inner.submit(queue, command_buffers, signal_value)
        }
        fn signal(&self, queue: QueueKind, value: u64) -> GfxResult<()> {
            self.inner.signal(queue, value)
        }
        fn query_counter(&self, queue: QueueKind) -> GfxResult<u64> {
            self.inner.query_counter(queue)
        }
        fn wait_counter(&self, queue: QueueKind, value: u64) -> GfxResult<()> {
            if value > 1 {
                *self.entered.lock().unwrap() = true;
                self.entered_cond.notify_all();
                let mut gate = self.gate.lock().unwrap();
                while !*gate {
                    gate = self.gate_cond.wait(gate).unwrap();
                }
            }
            self.inner.wait_counter(queue, value)
        }
        fn wait_idle(&self) -> GfxResult<()> {
            self.inner.wait_idle()
        }
    }

    #[test]
    fn test_wait_not_blocked_by_later_wait() {
        let backend = Arc::new(GatedBackend {
            inner: HeadlessBackend::deferred(),
            entered: Mutex::new(false),
            entered_cond: Condvar::new(),
            gate: Mutex::new(false),
            gate_cond: Condvar::new(),
        });
        let queues = Arc::new(CommandQueueManager::new(backend.clone()));
        let first = queues.signal(QueueKind::Graphics);
        let second = queues.signal(QueueKind::Graphics);

        let waiter = {
            let queues = queues.clone();
            std::thread::spawn(move || queues.wait_for_completion(second))
        };
        backend.wait_entered();

        // 另一个线程阻塞在 second 上时，first 仍然可以等到
        queues.wait_for_completion(first);
        assert!(queues.is_complete(first));
        assert!(!queues.is_complete(second));

        backend.open();
        waiter.join().unwrap();
        assert!(queues.is_complete(second));
    }

    #[test]
    fn test_concurrent_wait_and_submit() {
        let backend = Arc::new(HeadlessBackend::deferred());
        let queues = Arc::new(CommandQueueManager::new(backend.clone()));

        let receipts = (0..64).map(|_| queues.signal(QueueKind::Copy)).collect_vec();
        let waiter = {
            let queues = queues.clone();
            let receipts = receipts.clone();
            std::thread::spawn(move || {
                for receipt in receipts {
                    queues.wait_for_completion(receipt);
                    assert!(queues.is_complete(receipt));
                }
            })
        };
        for _ in 0..64 {
            queues.signal(QueueKind::Copy);
        }
        waiter.join().unwrap();
        assert_eq!(queues.last_issued(QueueKind::Copy).value(), 128);
    }
}

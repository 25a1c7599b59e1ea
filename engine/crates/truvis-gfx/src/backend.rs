//! GPU 后端能力接口
//!
//! 上层子系统只通过 [`GfxBackend`] 与原生图形 API 交互：创建 / 销毁 / 映射 buffer，
//! 录制与提交 command buffer，以及基于单调递增计数器（timeline）的完成度查询与等待。
//! 每种目标 API 实现一次该 trait，上层代码不会再根据后端类型做分支。

use std::fmt::Display;
use std::ptr::NonNull;

use crate::commands::barrier::BarrierBatch;
use crate::descriptors::descriptor_kind::DescriptorHeapDesc;
use crate::error::GfxResult;

/// 三种硬件队列，同时也是 command list 的类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum QueueKind {
    Graphics,
    Compute,
    Copy,
}
impl QueueKind {
    pub const COUNT: usize = 3;
    pub const ALL: [Self; Self::COUNT] = [Self::Graphics, Self::Compute, Self::Copy];

    #[inline]
    pub const fn index(self) -> usize {
        self as usize
    }
}
impl Display for QueueKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Graphics => write!(f, "graphics"),
            Self::Compute => write!(f, "compute"),
            Self::Copy => write!(f, "copy"),
        }
    }
}

/// 原生对象的不透明句柄
///
/// 对于 Vulkan 来说就是 `vk::Handle::as_raw()` 的结果。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct RawHandle(pub u64);
impl RawHandle {
    pub const NULL: Self = Self(0);

    #[inline]
    pub fn is_null(&self) -> bool {
        self.0 == 0
    }
}

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct GfxBufferUsage: u32 {
        const CONSTANT = 1 << 0;
        const STRUCTURED = 1 << 1;
        const VERTEX = 1 << 2;
        const INDEX = 1 << 3;
        const INDIRECT = 1 << 4;
        const TRANSFER_SRC = 1 << 5;
        const TRANSFER_DST = 1 << 6;
    }
}
impl GfxBufferUsage {
    /// 临时 page 会被用作上传源、常量、顶点、索引以及 structured / raw buffer
    pub const SCRATCH: Self = Self::CONSTANT
        .union(Self::STRUCTURED)
        .union(Self::VERTEX)
        .union(Self::INDEX)
        .union(Self::INDIRECT)
        .union(Self::TRANSFER_SRC);
}

#[derive(Debug, Clone)]
pub struct GfxBufferDesc<'a> {
    pub size: u64,
    pub usage: GfxBufferUsage,
    /// 是否需要 CPU 可见，并且持久映射
    pub host_visible: bool,
    /// buffer 起始地址的对齐
    pub alignment: u64,
    pub debug_name: &'a str,
}
impl<'a> GfxBufferDesc<'a> {
    /// CPU 可写、GPU 可读的持久映射 buffer
    #[inline]
    pub fn scratch(size: u64, alignment: u64, debug_name: &'a str) -> Self {
        Self {
            size,
            usage: GfxBufferUsage::SCRATCH,
            host_visible: true,
            alignment,
            debug_name,
        }
    }
}

/// buffer 之间的拷贝区域
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GfxBufferCopy {
    pub src: RawHandle,
    pub src_offset: u64,
    pub dst: RawHandle,
    pub dst_offset: u64,
    pub size: u64,
}

/// GPU 后端能力接口
///
/// # 计数器语义
/// 每个 [`QueueKind`] 有一个单调递增的计数器。`submit` 在按顺序执行完给定的 command buffer 之后
/// 将计数器 signal 到 `signal_value`；`query_counter` 非阻塞地返回 GPU 已经到达的值；
/// `wait_counter` 阻塞调用线程直到计数器到达目标值。
///
/// # 线程
/// 同一个 command buffer 只会被一个线程录制；`submit` 会被上层串行化；`query_counter` 与
/// `wait_counter` 可以与 `submit` 并发调用，多个线程也可以同时 `wait_counter`。
pub trait GfxBackend: Send + Sync + 'static {
    /// 一块原生 GPU 内存分配
    type Buffer: Send + Sync;
    type CommandBuffer: Send;
    type DescriptorHeap: Send + Sync;

    fn name(&self) -> &'static str;

    // buffer
    fn create_buffer(&self, desc: &GfxBufferDesc<'_>) -> GfxResult<Self::Buffer>;
    /// 持久映射的 CPU 指针，非 host visible 的 buffer 返回 None
    fn mapped_ptr(&self, buffer: &Self::Buffer) -> Option<NonNull<u8>>;
    fn buffer_handle(&self, buffer: &Self::Buffer) -> RawHandle;
    fn buffer_size(&self, buffer: &Self::Buffer) -> u64;
    fn destroy_buffer(&self, buffer: Self::Buffer);

    // descriptor heap
    fn create_descriptor_heap(&self, desc: &DescriptorHeapDesc) -> GfxResult<Self::DescriptorHeap>;
    fn destroy_descriptor_heap(&self, heap: Self::DescriptorHeap);

    // command buffer
    fn create_command_buffer(&self, queue: QueueKind, debug_name: &str) -> GfxResult<Self::CommandBuffer>;
    fn destroy_command_buffer(&self, command_buffer: Self::CommandBuffer);
    fn begin_command_buffer(&self, command_buffer: &mut Self::CommandBuffer) -> GfxResult<()>;
    fn end_command_buffer(&self, command_buffer: &mut Self::CommandBuffer) -> GfxResult<()>;
    /// 一次调用提交同一类别的全部 barrier
    fn issue_barriers(&self, command_buffer: &mut Self::CommandBuffer, batch: BarrierBatch<'_>);
    fn copy_buffer(&self, command_buffer: &mut Self::CommandBuffer, copy: &GfxBufferCopy);

    // queue
    fn submit(&self, queue: QueueKind, command_buffers: &[&Self::CommandBuffer], signal_value: u64) -> GfxResult<()>;
    /// 不带 command buffer 的 signal
    fn signal(&self, queue: QueueKind, value: u64) -> GfxResult<()>;
    fn query_counter(&self, queue: QueueKind) -> GfxResult<u64>;
    fn wait_counter(&self, queue: QueueKind, value: u64) -> GfxResult<()>;
    fn wait_idle(&self) -> GfxResult<()>;
}

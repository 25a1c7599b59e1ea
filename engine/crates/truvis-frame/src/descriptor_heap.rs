//! 描述符索引分配
//!
//! 每种 [`DescriptorKind`] 一个定长的索引空间：
//!
//! ```text
//! [0, P)                    持久区：显式 allocate / free，freed 列表 LIFO 复用
//! [P + i*T, P + (i+1)*T)    frame slot i 的临时区：bump 分配，slot 轮转时整体失效
//! ```
//!
//! 不同 slot 的临时区互不重叠，所以同时在 GPU 上执行的多个帧不会看到同一个临时索引。

use std::fmt::Display;
use std::sync::Arc;

use truvis_gfx::backend::GfxBackend;
use truvis_gfx::descriptors::descriptor_kind::{DescriptorHeapDesc, DescriptorKind, DescriptorKindMap};
use truvis_gfx::error::GfxResult;

use crate::frame_settings::DescriptorBudget;

/// 着色器可见的描述符槽位
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Descriptor {
    index: u32,
    kind: DescriptorKind,
}
impl Descriptor {
    const NULL_INDEX: u32 = u32::MAX;

    #[inline]
    pub const fn null(kind: DescriptorKind) -> Self {
        Self {
            index: Self::NULL_INDEX,
            kind,
        }
    }

    #[inline]
    pub fn is_null(&self) -> bool {
        self.index == Self::NULL_INDEX
    }

    #[inline]
    pub fn index(&self) -> u32 {
        self.index
    }

    #[inline]
    pub fn kind(&self) -> DescriptorKind {
        self.kind
    }
}
impl Display for Descriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_null() {
            write!(f, "{}#null", self.kind)
        } else {
            write!(f, "{}#{}", self.kind, self.index)
        }
    }
}

/// 一种描述符类型的索引池
struct DescriptorPool {
    kind: DescriptorKind,
    max_persistent: u32,
    max_temp_per_frame: u32,

    /// 从未分配过的最小索引
    next_unused: u32,
    /// 释放的索引，LIFO
    freed: Vec<u32>,
    /// 持久区的存活位图，用于检测 double free
    live: Vec<u64>,
    persistent_count: u32,

    /// 每个 frame slot 的临时区游标
    temp_cursors: Vec<u32>,
}
impl DescriptorPool {
    fn new(kind: DescriptorKind, max_persistent: u32, max_temp_per_frame: u32, frames_in_flight: usize) -> Self {
        Self {
            kind,
            max_persistent,
            max_temp_per_frame,
            next_unused: 0,
            freed: Vec::new(),
            live: vec![0; (max_persistent as usize).div_ceil(64)],
            persistent_count: 0,
            temp_cursors: vec![0; frames_in_flight],
        }
    }

    #[inline]
    fn is_disabled(&self) -> bool {
        self.max_persistent == 0 && self.max_temp_per_frame == 0
    }

    #[inline]
    fn is_live(&self, index: u32) -> bool {
        self.live[(index / 64) as usize] & (1 << (index % 64)) != 0
    }

    #[inline]
    fn set_live(&mut self, index: u32, live: bool) {
        let word = &mut self.live[(index / 64) as usize];
        if live {
            *word |= 1 << (index % 64);
        } else {
            *word &= !(1 << (index % 64));
        }
    }

    fn allocate_persistent(&mut self) -> Option<u32> {
        let index = match self.freed.pop() {
            Some(index) => index,
            None if self.next_unused < self.max_persistent => {
                self.next_unused += 1;
                self.next_unused - 1
            }
            None => return None,
        };
        debug_assert!(!self.is_live(index));
        self.set_live(index, true);
        self.persistent_count += 1;
        Some(index)
    }

    fn free_persistent(&mut self, index: u32) -> Result<(), &'static str> {
        if index >= self.max_persistent {
            return Err("index is outside the persistent range");
        }
        if !self.is_live(index) {
            return Err("double free or never allocated");
        }
        self.set_live(index, false);
        self.freed.push(index);
        self.persistent_count -= 1;
        Ok(())
    }

    fn allocate_temporary(&mut self, frame_index: usize) -> Option<u32> {
        let cursor = &mut self.temp_cursors[frame_index];
        if *cursor >= self.max_temp_per_frame {
            return None;
        }
        let index = self.max_persistent + frame_index as u32 * self.max_temp_per_frame + *cursor;
        *cursor += 1;
        Some(index)
    }
}

/// 描述符堆管理器
///
/// 持有原生描述符堆，并为 5 种描述符类型分配索引。
/// 分配失败（容量耗尽、类型未启用）时返回空描述符并记录错误日志，调用者需要跳过依赖它的 GPU 操作。
pub struct DescriptorHeapManager<B: GfxBackend> {
    backend: Arc<B>,
    heap: Option<B::DescriptorHeap>,

    pools: DescriptorKindMap<DescriptorPool>,
    frames_in_flight: usize,
    frame_index: usize,
}
// new & init
impl<B: GfxBackend> DescriptorHeapManager<B> {
    /// 根据预算创建原生描述符堆，调用者需要保证预算已经通过校验
    pub fn new(backend: Arc<B>, budget: &DescriptorBudget, frames_in_flight: usize) -> GfxResult<Self> {
        let frames_in_flight = frames_in_flight.max(1);
        let pools = DescriptorKindMap::from_fn(|kind| {
            DescriptorPool::new(
                kind,
                budget.max_persistent.get(kind),
                budget.max_temp_per_frame.get(kind),
                frames_in_flight,
            )
        });

        let heap_desc = DescriptorHeapDesc {
            capacities: DescriptorKindMap::from_fn(|kind| {
                let pool = &pools[kind];
                pool.max_persistent + frames_in_flight as u32 * pool.max_temp_per_frame
            }),
            debug_name: "frame-descriptor-heap".to_string(),
        };
        let heap = backend.create_descriptor_heap(&heap_desc)?;

        for pool in pools.0.iter().filter(|pool| pool.is_disabled()) {
            log::info!("descriptor pool {} disabled (zero capacity)", pool.kind);
        }

        Ok(Self {
            backend,
            heap: Some(heap),
            pools,
            frames_in_flight,
            frame_index: 0,
        })
    }
}
impl<B: GfxBackend> Drop for DescriptorHeapManager<B> {
    fn drop(&mut self) {
        log::info!("Dropping DescriptorHeapManager");
        if let Some(heap) = self.heap.take() {
            self.backend.destroy_descriptor_heap(heap);
        }
    }
}
// destroy
impl<B: GfxBackend> DescriptorHeapManager<B> {
    #[inline]
    pub fn destroy(self) {
        drop(self)
    }
}
// getters
impl<B: GfxBackend> DescriptorHeapManager<B> {
    #[inline]
    pub fn heap(&self) -> Option<&B::DescriptorHeap> {
        self.heap.as_ref()
    }

    #[inline]
    pub fn frame_index(&self) -> usize {
        self.frame_index
    }

    #[inline]
    pub fn frames_in_flight(&self) -> usize {
        self.frames_in_flight
    }

    /// 该类型的总槽位数：持久区 + 所有 slot 的临时区
    #[inline]
    pub fn capacity(&self, kind: DescriptorKind) -> u32 {
        let pool = &self.pools[kind];
        pool.max_persistent + self.frames_in_flight as u32 * pool.max_temp_per_frame
    }

    #[inline]
    pub fn max_persistent(&self, kind: DescriptorKind) -> u32 {
        self.pools[kind].max_persistent
    }

    #[inline]
    pub fn max_temp_per_frame(&self, kind: DescriptorKind) -> u32 {
        self.pools[kind].max_temp_per_frame
    }

    /// 存活的持久描述符数量
    #[inline]
    pub fn persistent_count(&self, kind: DescriptorKind) -> u32 {
        self.pools[kind].persistent_count
    }

    /// 当前 slot 已经分配的临时描述符数量
    #[inline]
    pub fn temp_count(&self, kind: DescriptorKind) -> u32 {
        self.pools[kind].temp_cursors[self.frame_index]
    }

    pub fn is_temporary(&self, descriptor: Descriptor) -> bool {
        !descriptor.is_null()
            && descriptor.index >= self.pools[descriptor.kind].max_persistent
            && descriptor.index < self.capacity(descriptor.kind)
    }
}
// 分配与释放
impl<B: GfxBackend> DescriptorHeapManager<B> {
    /// 优先复用最近释放的索引，否则分配下一个从未使用过的索引
    pub fn allocate_persistent(&mut self, kind: DescriptorKind) -> Descriptor {
        let pool = &mut self.pools[kind];
        if pool.is_disabled() {
            log::error!("allocate persistent {} descriptor from a disabled pool", kind);
            return Descriptor::null(kind);
        }
        match pool.allocate_persistent() {
            Some(index) => Descriptor { index, kind },
            None => {
                log::error!("persistent {} descriptors exhausted ({} in use)", kind, pool.persistent_count);
                Descriptor::null(kind)
            }
        }
    }

    /// 空描述符、临时描述符、越界以及重复释放都会被拒绝，不会改变任何状态
    pub fn free_persistent(&mut self, descriptor: Descriptor) {
        if descriptor.is_null() {
            log::error!("free null {} descriptor", descriptor.kind);
            return;
        }
        if let Err(reason) = self.pools[descriptor.kind].free_persistent(descriptor.index) {
            log::error!("free persistent descriptor {}: {}", descriptor, reason);
        }
    }

    /// 在当前 slot 的临时区中分配，下一次轮转到该 slot 时失效
    pub fn allocate_temporary(&mut self, kind: DescriptorKind) -> Descriptor {
        let frame_index = self.frame_index;
        let pool = &mut self.pools[kind];
        if pool.is_disabled() {
            log::error!("allocate temporary {} descriptor from a disabled pool", kind);
            return Descriptor::null(kind);
        }
        match pool.allocate_temporary(frame_index) {
            Some(index) => Descriptor { index, kind },
            None => {
                log::error!(
                    "temporary {} descriptors exhausted in frame slot {} ({} per frame)",
                    kind,
                    frame_index,
                    pool.max_temp_per_frame
                );
                Descriptor::null(kind)
            }
        }
    }

    /// 前进到下一个 frame slot，并重置该 slot 的临时区
    ///
    /// 调用者需要保证该 slot 之前提交的工作已经完成
    pub fn next_frame(&mut self) {
        self.frame_index = (self.frame_index + 1) % self.frames_in_flight;
        let frame_index = self.frame_index;
        for (_, pool) in self.pools.iter_mut() {
            pool.temp_cursors[frame_index] = 0;
        }
        log::trace!("descriptor heap: frame slot {}", frame_index);
    }

    /// 重置所有 slot 的临时区，在 GPU 空闲时调用
    pub fn free_all_temp(&mut self) {
        for (_, pool) in self.pools.iter_mut() {
            pool.temp_cursors.fill(0);
        }
    }
}

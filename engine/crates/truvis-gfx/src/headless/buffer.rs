use std::ptr::NonNull;

use crate::error::{GfxError, GfxResult};

/// CPU 内存模拟的持久映射 buffer
pub struct HeadlessBuffer {
    id: u64,
    size: u64,
    ptr: NonNull<u8>,
    /// `ptr` 指向这块内存，buffer 存活期间不会移动
    _memory: Box<[u8]>,
}
// SAFETY: 内存由 buffer 独占，通过 ptr 的写入由上层保证不重叠
unsafe impl Send for HeadlessBuffer {}
unsafe impl Sync for HeadlessBuffer {}

impl HeadlessBuffer {
    /// 内存不足时返回 [`GfxError::OutOfMemory`]，不会 abort
    pub(super) fn new(id: u64, size: usize) -> GfxResult<Self> {
        let mut memory = Vec::new();
        memory.try_reserve_exact(size).map_err(|_| GfxError::OutOfMemory)?;
        memory.resize(size, 0u8);
        let mut memory = memory.into_boxed_slice();
        // Box<[u8]> 非空，as_mut_ptr 不会是 null
        let ptr = NonNull::new(memory.as_mut_ptr()).unwrap_or(NonNull::dangling());
        Ok(Self {
            id,
            size: size as u64,
            ptr,
            _memory: memory,
        })
    }

    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[inline]
    pub fn size(&self) -> u64 {
        self.size
    }

    #[inline]
    pub(super) fn ptr(&self) -> NonNull<u8> {
        self.ptr
    }

    /// 拷贝出 `[offset, offset + len)` 的内容
    ///
    /// 调用者需要保证此时没有其他线程在写这段区域
    pub fn read(&self, offset: u64, len: usize) -> Vec<u8> {
        assert!(offset + len as u64 <= self.size, "read out of buffer range");
        let mut out = vec![0u8; len];
        // SAFETY: 范围已经检查
        unsafe {
            std::ptr::copy_nonoverlapping(self.ptr.as_ptr().add(offset as usize), out.as_mut_ptr(), len);
        }
        out
    }
}
impl std::fmt::Debug for HeadlessBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HeadlessBuffer").field("id", &self.id).field("size", &self.size).finish()
    }
}

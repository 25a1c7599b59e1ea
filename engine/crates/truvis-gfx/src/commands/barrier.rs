//! 与原生 API 无关的资源状态与 barrier 描述
//!
//! 上层只声明 "before -> after" 的状态转换，由各个后端翻译为自己的
//! stage / access / layout。

use crate::backend::RawHandle;

bitflags::bitflags! {
    /// 资源状态
    ///
    /// 空集合表示未定义状态（初始状态或不关心内容）。
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ResourceState: u32 {
        const VERTEX_AND_CONSTANT_BUFFER = 1 << 0;
        const INDEX_BUFFER = 1 << 1;
        const RENDER_TARGET = 1 << 2;
        const UNORDERED_ACCESS = 1 << 3;
        const DEPTH_WRITE = 1 << 4;
        const DEPTH_READ = 1 << 5;
        const SHADER_RESOURCE = 1 << 6;
        const INDIRECT_ARGUMENT = 1 << 7;
        const COPY_DEST = 1 << 8;
        const COPY_SOURCE = 1 << 9;
        const PRESENT = 1 << 10;
        /// 通用状态（可用于任何操作，但性能可能不是最优）
        const GENERAL = 1 << 11;
    }
}
impl ResourceState {
    pub const UNDEFINED: Self = Self::empty();

    /// 写操作
    const WRITE_STATES: Self = Self::RENDER_TARGET
        .union(Self::UNORDERED_ACCESS)
        .union(Self::DEPTH_WRITE)
        .union(Self::COPY_DEST)
        .union(Self::GENERAL);

    /// 检查是否为写操作
    #[inline]
    pub fn is_write(&self) -> bool {
        self.intersects(Self::WRITE_STATES)
    }

    #[inline]
    pub fn is_read_only(&self) -> bool {
        !self.is_write()
    }
}

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct TextureAspect: u8 {
        const COLOR = 1 << 0;
        const DEPTH = 1 << 1;
        const STENCIL = 1 << 2;
    }
}
impl Default for TextureAspect {
    fn default() -> Self {
        Self::COLOR
    }
}

/// barrier 的三种类别，每种类别在 command list 中有独立的批次
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BarrierClass {
    Global,
    Texture,
    Buffer,
}

/// 全局 memory barrier，不针对某个具体资源
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct GfxGlobalBarrier {
    pub before: ResourceState,
    pub after: ResourceState,
}
impl GfxGlobalBarrier {
    #[inline]
    pub fn new(before: ResourceState, after: ResourceState) -> Self {
        Self { before, after }
    }
}

/// 便捷创建 texture barrier 的结构体
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GfxTextureBarrier {
    pub texture: RawHandle,
    pub before: ResourceState,
    pub after: ResourceState,
    pub aspect: TextureAspect,
    pub base_mip_level: u32,
    pub mip_level_count: u32,
    pub base_array_layer: u32,
    pub array_layer_count: u32,
}
impl GfxTextureBarrier {
    /// 默认作用于第 0 层 mip、第 0 层 layer 的 color aspect
    pub fn new(texture: RawHandle) -> Self {
        Self {
            texture,
            before: ResourceState::UNDEFINED,
            after: ResourceState::UNDEFINED,
            aspect: TextureAspect::COLOR,
            base_mip_level: 0,
            mip_level_count: 1,
            base_array_layer: 0,
            array_layer_count: 1,
        }
    }

    /// builder
    #[inline]
    pub fn transition(mut self, before: ResourceState, after: ResourceState) -> Self {
        self.before = before;
        self.after = after;
        self
    }

    /// builder
    #[inline]
    pub fn aspect(mut self, aspect: TextureAspect) -> Self {
        self.aspect = aspect;
        self
    }

    /// builder
    #[inline]
    pub fn mip_levels(mut self, base_mip_level: u32, mip_level_count: u32) -> Self {
        self.base_mip_level = base_mip_level;
        self.mip_level_count = mip_level_count;
        self
    }

    /// builder
    #[inline]
    pub fn array_layers(mut self, base_array_layer: u32, array_layer_count: u32) -> Self {
        self.base_array_layer = base_array_layer;
        self.array_layer_count = array_layer_count;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GfxBufferBarrier {
    pub buffer: RawHandle,
    pub before: ResourceState,
    pub after: ResourceState,
    pub offset: u64,
    /// [`GfxBufferBarrier::WHOLE_SIZE`] 表示整个 buffer
    pub size: u64,
}
impl GfxBufferBarrier {
    pub const WHOLE_SIZE: u64 = u64::MAX;

    pub fn new(buffer: RawHandle) -> Self {
        Self {
            buffer,
            before: ResourceState::UNDEFINED,
            after: ResourceState::UNDEFINED,
            offset: 0,
            size: Self::WHOLE_SIZE,
        }
    }

    /// builder
    #[inline]
    pub fn transition(mut self, before: ResourceState, after: ResourceState) -> Self {
        self.before = before;
        self.after = after;
        self
    }

    /// builder
    #[inline]
    pub fn range(mut self, offset: u64, size: u64) -> Self {
        self.offset = offset;
        self.size = size;
        self
    }
}

/// 一次性交给后端的同类 barrier
#[derive(Debug, Clone, Copy)]
pub enum BarrierBatch<'a> {
    Global(&'a [GfxGlobalBarrier]),
    Texture(&'a [GfxTextureBarrier]),
    Buffer(&'a [GfxBufferBarrier]),
}
impl BarrierBatch<'_> {
    #[inline]
    pub fn class(&self) -> BarrierClass {
        match self {
            Self::Global(_) => BarrierClass::Global,
            Self::Texture(_) => BarrierClass::Texture,
            Self::Buffer(_) => BarrierClass::Buffer,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        match self {
            Self::Global(barriers) => barriers.len(),
            Self::Texture(barriers) => barriers.len(),
            Self::Buffer(barriers) => barriers.len(),
        }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_states() {
        assert!(ResourceState::COPY_DEST.is_write());
        assert!(ResourceState::UNORDERED_ACCESS.is_write());
        assert!(ResourceState::SHADER_RESOURCE.is_read_only());
        assert!(ResourceState::UNDEFINED.is_read_only());
        assert!((ResourceState::SHADER_RESOURCE | ResourceState::DEPTH_WRITE).is_write());
    }

    #[test]
    fn test_texture_barrier_builder() {
        let barrier = GfxTextureBarrier::new(RawHandle(42))
            .transition(ResourceState::RENDER_TARGET, ResourceState::SHADER_RESOURCE)
            .aspect(TextureAspect::DEPTH | TextureAspect::STENCIL)
            .mip_levels(1, 3);

        assert_eq!(barrier.texture, RawHandle(42));
        assert_eq!(barrier.before, ResourceState::RENDER_TARGET);
        assert_eq!(barrier.after, ResourceState::SHADER_RESOURCE);
        assert_eq!(barrier.mip_level_count, 3);
        assert_eq!(barrier.array_layer_count, 1);
    }

    #[test]
    fn test_batch_class() {
        let barriers = [GfxGlobalBarrier::new(ResourceState::COPY_DEST, ResourceState::SHADER_RESOURCE); 3];
        let batch = BarrierBatch::Global(&barriers);
        assert_eq!(batch.class(), BarrierClass::Global);
        assert_eq!(batch.len(), 3);
        assert!(!batch.is_empty());
    }
}

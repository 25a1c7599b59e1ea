//! GPU 后端抽象层
//!
//! 上层的帧资源、描述符与同步子系统只面向 [`backend::GfxBackend`] 编写，
//! 不关心当前使用的是哪一种原生图形 API。
//!
//! - `vulkan`：基于 ash + vk-mem 的实现（feature `vulkan`，默认开启）
//! - `headless`：纯 CPU 模拟的实现，用于测试以及没有 GPU 的环境

pub mod backend;
pub mod commands;
pub mod descriptors;
pub mod error;
pub mod headless;
#[cfg(feature = "vulkan")]
pub mod vulkan;

pub mod prelude {
    pub use crate::backend::{GfxBackend, GfxBufferCopy, GfxBufferDesc, GfxBufferUsage, QueueKind, RawHandle};
    pub use crate::commands::barrier::{
        BarrierBatch, BarrierClass, GfxBufferBarrier, GfxGlobalBarrier, GfxTextureBarrier, ResourceState, TextureAspect,
    };
    pub use crate::descriptors::descriptor_kind::{DescriptorHeapDesc, DescriptorKind, DescriptorKindMap};
    pub use crate::error::{GfxError, GfxResult};
}

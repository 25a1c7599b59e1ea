//! 帧资源、描述符与 GPU 同步子系统
//!
//! 从叶子到根：
//! - [`receipt`]：一次提交的完成凭证
//! - [`command_queue`]：三条队列的提交、完成查询与等待
//! - [`descriptor_heap`]：5 种类型的描述符索引分配（持久区 + 每帧临时区）
//! - [`temp_buffer`]：每帧的线性临时 buffer 分配器
//! - [`command_list`]：带 barrier 批处理的 command list
//! - [`frame_context`]：把上面这些串起来的帧环
//!
//! 原生图形 API 只通过 [`truvis_gfx::backend::GfxBackend`] 访问。

pub mod command_list;
pub mod command_queue;
pub mod descriptor_heap;
pub mod frame_context;
pub mod frame_counter;
pub mod frame_settings;
pub mod receipt;
pub mod temp_buffer;

pub mod prelude {
    pub use crate::command_list::{CommandList, CommandListState, MAX_BATCHED_BARRIERS};
    pub use crate::command_queue::CommandQueueManager;
    pub use crate::descriptor_heap::{Descriptor, DescriptorHeapManager};
    pub use crate::frame_context::{FrameContext, FrameError};
    pub use crate::frame_counter::{FrameCounter, FrameLabel};
    pub use crate::frame_settings::{DescriptorBudget, FrameSettings, SettingsError};
    pub use crate::receipt::Receipt;
    pub use crate::temp_buffer::{TempBuffer, TempBufferAllocator};
}

#[cfg(feature = "vulkan")]
use ash::vk;

pub type GfxResult<T> = Result<T, GfxError>;

/// 后端返回的错误
///
/// 除了 [`GfxError::DeviceLost`] 之外都是可恢复的：上层记录日志后返回空句柄，
/// 由调用者跳过依赖它的 GPU 操作。
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum GfxError {
    #[error("out of memory")]
    OutOfMemory,

    /// 设备丢失，整个子系统都需要销毁重建
    #[error("device lost")]
    DeviceLost,

    #[error("invalid usage: {0}")]
    InvalidUsage(String),

    #[error("backend: {0}")]
    Backend(String),

    #[cfg(feature = "vulkan")]
    #[error("Vulkan: {0}")]
    Vulkan(vk::Result),
}

impl GfxError {
    #[inline]
    pub fn is_device_lost(&self) -> bool {
        matches!(self, Self::DeviceLost)
    }
}

#[cfg(feature = "vulkan")]
impl From<vk::Result> for GfxError {
    fn from(result: vk::Result) -> Self {
        match result {
            vk::Result::ERROR_DEVICE_LOST => Self::DeviceLost,
            vk::Result::ERROR_OUT_OF_DEVICE_MEMORY | vk::Result::ERROR_OUT_OF_HOST_MEMORY => Self::OutOfMemory,
            other => Self::Vulkan(other),
        }
    }
}

//! 帧子系统的配置，在加载时确定，运行期间不会改变

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use truvis_gfx::descriptors::descriptor_kind::{DescriptorKind, DescriptorKindMap};

#[derive(thiserror::Error, Debug)]
pub enum SettingsError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse frame settings: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("`{0}` must be positive")]
    Zero(&'static str),

    #[error("frames in flight ({frames_in_flight}) exceeds swapchain image count ({swapchain_image_count})")]
    TooManyFramesInFlight {
        frames_in_flight: usize,
        swapchain_image_count: usize,
    },

    #[error("{kind} descriptor index space does not fit in u32")]
    DescriptorIndexOverflow { kind: DescriptorKind },
}

/// 每种描述符类型的数量
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct DescriptorCounts {
    pub constant_view: u32,
    pub raw_or_structured_view: u32,
    pub texture_read_view: u32,
    pub texture_write_view: u32,
    pub sampler: u32,
}
impl DescriptorCounts {
    /// 所有类型使用相同的数量
    #[inline]
    pub const fn uniform(count: u32) -> Self {
        Self {
            constant_view: count,
            raw_or_structured_view: count,
            texture_read_view: count,
            texture_write_view: count,
            sampler: count,
        }
    }

    pub fn get(&self, kind: DescriptorKind) -> u32 {
        match kind {
            DescriptorKind::ConstantView => self.constant_view,
            DescriptorKind::RawOrStructuredView => self.raw_or_structured_view,
            DescriptorKind::TextureReadView => self.texture_read_view,
            DescriptorKind::TextureWriteView => self.texture_write_view,
            DescriptorKind::Sampler => self.sampler,
        }
    }

    #[inline]
    pub fn to_map(&self) -> DescriptorKindMap<u32> {
        DescriptorKindMap::from_fn(|kind| self.get(kind))
    }
}

/// 描述符堆的容量配置
///
/// 对于每种类型，索引空间为：
/// `[0, max_persistent)` 持久区，之后每个 frame slot 一段长度为 `max_temp_per_frame` 的临时区
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DescriptorBudget {
    pub max_persistent: DescriptorCounts,
    pub max_temp_per_frame: DescriptorCounts,
}
impl Default for DescriptorBudget {
    fn default() -> Self {
        Self {
            max_persistent: DescriptorCounts {
                constant_view: 1024,
                raw_or_structured_view: 4096,
                texture_read_view: 4096,
                texture_write_view: 512,
                sampler: 64,
            },
            max_temp_per_frame: DescriptorCounts {
                constant_view: 1024,
                raw_or_structured_view: 1024,
                texture_read_view: 512,
                texture_write_view: 64,
                sampler: 16,
            },
        }
    }
}
impl DescriptorBudget {
    /// 持久与临时数量都为 0 的类型，这些类型的分配总是返回空描述符
    pub fn disabled_kinds(&self) -> Vec<DescriptorKind> {
        let persistent = self.max_persistent.to_map();
        let temp = self.max_temp_per_frame.to_map();
        persistent
            .iter()
            .filter(|(kind, count)| **count == 0 && temp[*kind] == 0)
            .map(|(kind, _)| kind)
            .collect()
    }

    /// 原生描述符堆中每种类型的总槽位数
    pub fn capacities(&self, frames_in_flight: usize) -> DescriptorKindMap<u64> {
        DescriptorKindMap::from_fn(|kind| {
            self.max_persistent.get(kind) as u64 + frames_in_flight as u64 * self.max_temp_per_frame.get(kind) as u64
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FrameSettings {
    /// 同时在 GPU 上执行的帧数，也是 frame slot 的数量
    pub frames_in_flight: usize,
    /// 交换链的 image 数量，不能少于 frames_in_flight
    pub swapchain_image_count: usize,
    /// 临时 buffer 的标准 page 大小（字节）
    pub page_size: u64,
    /// 每个 frame slot 在加载时创建、常驻的 page 数量
    pub persistent_pages_per_frame: usize,
    pub descriptors: DescriptorBudget,
}
impl Default for FrameSettings {
    fn default() -> Self {
        Self {
            frames_in_flight: 3,
            swapchain_image_count: 3,
            page_size: 4 * 1024 * 1024,
            persistent_pages_per_frame: 1,
            descriptors: DescriptorBudget::default(),
        }
    }
}
// load
impl FrameSettings {
    pub fn from_toml_str(text: &str) -> Result<Self, SettingsError> {
        let settings: Self = toml::from_str(text)?;
        settings.validate()?;
        for kind in settings.descriptors.disabled_kinds() {
            log::warn!("{} descriptor pool is disabled: both persistent and temp counts are 0", kind);
        }
        Ok(settings)
    }

    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self, SettingsError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| SettingsError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        log::info!("load frame settings from {}", path.display());
        Self::from_toml_str(&text)
    }
}
// tools
impl FrameSettings {
    pub fn validate(&self) -> Result<(), SettingsError> {
        if self.frames_in_flight == 0 {
            return Err(SettingsError::Zero("frames_in_flight"));
        }
        if self.swapchain_image_count == 0 {
            return Err(SettingsError::Zero("swapchain_image_count"));
        }
        if self.page_size == 0 {
            return Err(SettingsError::Zero("page_size"));
        }
        if self.persistent_pages_per_frame == 0 {
            return Err(SettingsError::Zero("persistent_pages_per_frame"));
        }
        if self.frames_in_flight > self.swapchain_image_count {
            return Err(SettingsError::TooManyFramesInFlight {
                frames_in_flight: self.frames_in_flight,
                swapchain_image_count: self.swapchain_image_count,
            });
        }

        // u32::MAX 是空描述符
        let capacities = self.descriptors.capacities(self.frames_in_flight);
        if let Some((kind, _)) = capacities.iter().find(|(_, capacity)| **capacity >= u32::MAX as u64) {
            return Err(SettingsError::DescriptorIndexOverflow { kind });
        }
        Ok(())
    }
}

use std::fmt::Display;
use std::ops::{Index, IndexMut};

/// 着色器可见的描述符类型
///
/// 每一种类型对应一个独立的索引空间（一个 bindless 数组）。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DescriptorKind {
    /// 常量缓冲视图（uniform buffer）
    ConstantView,
    /// raw / structured buffer 视图（storage buffer）
    RawOrStructuredView,
    /// 只读纹理视图（sampled image）
    TextureReadView,
    /// 可写纹理视图（storage image）
    TextureWriteView,
    Sampler,
}
impl DescriptorKind {
    pub const COUNT: usize = 5;

    pub const ALL: [Self; Self::COUNT] = [
        Self::ConstantView,
        Self::RawOrStructuredView,
        Self::TextureReadView,
        Self::TextureWriteView,
        Self::Sampler,
    ];

    #[inline]
    pub const fn index(self) -> usize {
        self as usize
    }
}
impl Display for DescriptorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::ConstantView => "cbv",
            Self::RawOrStructuredView => "srv-buffer",
            Self::TextureReadView => "srv-texture",
            Self::TextureWriteView => "uav-texture",
            Self::Sampler => "sampler",
        };
        write!(f, "{name}")
    }
}

/// 以 [`DescriptorKind`] 为下标的定长数组
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DescriptorKindMap<T>(pub [T; DescriptorKind::COUNT]);
impl<T> DescriptorKindMap<T> {
    #[inline]
    pub fn from_fn(mut f: impl FnMut(DescriptorKind) -> T) -> Self {
        Self(DescriptorKind::ALL.map(&mut f))
    }

    #[inline]
    pub fn iter(&self) -> impl Iterator<Item = (DescriptorKind, &T)> {
        DescriptorKind::ALL.into_iter().zip(self.0.iter())
    }

    #[inline]
    pub fn iter_mut(&mut self) -> impl Iterator<Item = (DescriptorKind, &mut T)> {
        DescriptorKind::ALL.into_iter().zip(self.0.iter_mut())
    }
}
impl<T> Index<DescriptorKind> for DescriptorKindMap<T> {
    type Output = T;
    #[inline]
    fn index(&self, kind: DescriptorKind) -> &Self::Output {
        &self.0[kind.index()]
    }
}
impl<T> IndexMut<DescriptorKind> for DescriptorKindMap<T> {
    #[inline]
    fn index_mut(&mut self, kind: DescriptorKind) -> &mut Self::Output {
        &mut self.0[kind.index()]
    }
}

/// 创建原生描述符堆所需的信息
///
/// `capacities[kind]` 是该类型的总槽位数：持久区 + 帧数 * 每帧临时区。
/// 容量为 0 的类型不会创建对应的原生数组。
#[derive(Debug, Clone)]
pub struct DescriptorHeapDesc {
    pub capacities: DescriptorKindMap<u32>,
    pub debug_name: String,
}

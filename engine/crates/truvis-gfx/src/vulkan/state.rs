//! [`ResourceState`] 到 Vulkan stage / access / layout 的映射

use ash::vk;

use crate::commands::barrier::{ResourceState, TextureAspect};

/// 资源状态在 Vulkan 中的表示
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct VkResourceState {
    pub stage: vk::PipelineStageFlags2,
    pub access: vk::AccessFlags2,
    pub layout: vk::ImageLayout,
}
impl Default for VkResourceState {
    fn default() -> Self {
        Self::UNDEFINED
    }
}
impl VkResourceState {
    #[inline]
    pub const fn new(stage: vk::PipelineStageFlags2, access: vk::AccessFlags2, layout: vk::ImageLayout) -> Self {
        Self { stage, access, layout }
    }

    /// 未定义状态（初始状态或不关心内容）
    pub const UNDEFINED: Self =
        Self::new(vk::PipelineStageFlags2::TOP_OF_PIPE, vk::AccessFlags2::NONE, vk::ImageLayout::UNDEFINED);

    const ALL_SHADERS: vk::PipelineStageFlags2 = vk::PipelineStageFlags2::from_raw(
        vk::PipelineStageFlags2::VERTEX_SHADER.as_raw()
            | vk::PipelineStageFlags2::FRAGMENT_SHADER.as_raw()
            | vk::PipelineStageFlags2::COMPUTE_SHADER.as_raw(),
    );

    const DEPTH_TESTS: vk::PipelineStageFlags2 = vk::PipelineStageFlags2::from_raw(
        vk::PipelineStageFlags2::EARLY_FRAGMENT_TESTS.as_raw() | vk::PipelineStageFlags2::LATE_FRAGMENT_TESTS.as_raw(),
    );

    /// 将多个状态位合并为一个 Vulkan 状态
    ///
    /// layout 只能有一个，按照"写状态优先"的顺序选择
    pub fn from_state(state: ResourceState) -> Self {
        if state.is_empty() {
            return Self::UNDEFINED;
        }

        let mut stage = vk::PipelineStageFlags2::NONE;
        let mut access = vk::AccessFlags2::NONE;
        for flag in state.iter() {
            let (s, a) = Self::stage_access(flag);
            stage |= s;
            access |= a;
        }

        Self {
            stage,
            access,
            layout: Self::layout(state),
        }
    }

    fn stage_access(flag: ResourceState) -> (vk::PipelineStageFlags2, vk::AccessFlags2) {
        match flag {
            ResourceState::VERTEX_AND_CONSTANT_BUFFER => (
                vk::PipelineStageFlags2::VERTEX_INPUT | Self::ALL_SHADERS,
                vk::AccessFlags2::VERTEX_ATTRIBUTE_READ | vk::AccessFlags2::UNIFORM_READ,
            ),
            ResourceState::INDEX_BUFFER => (vk::PipelineStageFlags2::INDEX_INPUT, vk::AccessFlags2::INDEX_READ),
            ResourceState::RENDER_TARGET => (
                vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT,
                vk::AccessFlags2::COLOR_ATTACHMENT_READ | vk::AccessFlags2::COLOR_ATTACHMENT_WRITE,
            ),
            ResourceState::UNORDERED_ACCESS => (
                Self::ALL_SHADERS,
                vk::AccessFlags2::SHADER_STORAGE_READ | vk::AccessFlags2::SHADER_STORAGE_WRITE,
            ),
            ResourceState::DEPTH_WRITE => (
                Self::DEPTH_TESTS,
                vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_READ | vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_WRITE,
            ),
            ResourceState::DEPTH_READ => (Self::DEPTH_TESTS, vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_READ),
            ResourceState::SHADER_RESOURCE => (Self::ALL_SHADERS, vk::AccessFlags2::SHADER_READ),
            ResourceState::INDIRECT_ARGUMENT => {
                (vk::PipelineStageFlags2::DRAW_INDIRECT, vk::AccessFlags2::INDIRECT_COMMAND_READ)
            }
            ResourceState::COPY_DEST => (vk::PipelineStageFlags2::TRANSFER, vk::AccessFlags2::TRANSFER_WRITE),
            ResourceState::COPY_SOURCE => (vk::PipelineStageFlags2::TRANSFER, vk::AccessFlags2::TRANSFER_READ),
            ResourceState::PRESENT => (vk::PipelineStageFlags2::BOTTOM_OF_PIPE, vk::AccessFlags2::NONE),
            _ => (
                vk::PipelineStageFlags2::ALL_COMMANDS,
                vk::AccessFlags2::MEMORY_READ | vk::AccessFlags2::MEMORY_WRITE,
            ),
        }
    }

    fn layout(state: ResourceState) -> vk::ImageLayout {
        if state.contains(ResourceState::GENERAL) || state.contains(ResourceState::UNORDERED_ACCESS) {
            vk::ImageLayout::GENERAL
        } else if state.contains(ResourceState::RENDER_TARGET) {
            vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL
        } else if state.contains(ResourceState::DEPTH_WRITE) {
            vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL
        } else if state.contains(ResourceState::COPY_DEST) {
            vk::ImageLayout::TRANSFER_DST_OPTIMAL
        } else if state.contains(ResourceState::COPY_SOURCE) {
            vk::ImageLayout::TRANSFER_SRC_OPTIMAL
        } else if state.contains(ResourceState::DEPTH_READ) {
            vk::ImageLayout::DEPTH_STENCIL_READ_ONLY_OPTIMAL
        } else if state.contains(ResourceState::SHADER_RESOURCE) {
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL
        } else if state.contains(ResourceState::PRESENT) {
            vk::ImageLayout::PRESENT_SRC_KHR
        } else {
            vk::ImageLayout::GENERAL
        }
    }
}

pub fn aspect_flags(aspect: TextureAspect) -> vk::ImageAspectFlags {
    let mut flags = vk::ImageAspectFlags::empty();
    if aspect.contains(TextureAspect::COLOR) {
        flags |= vk::ImageAspectFlags::COLOR;
    }
    if aspect.contains(TextureAspect::DEPTH) {
        flags |= vk::ImageAspectFlags::DEPTH;
    }
    if aspect.contains(TextureAspect::STENCIL) {
        flags |= vk::ImageAspectFlags::STENCIL;
    }
    flags
}

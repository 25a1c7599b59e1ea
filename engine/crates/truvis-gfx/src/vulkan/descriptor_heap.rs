//! 一个 descriptor set 承载全部 5 种描述符数组
//!
//! 每种 [`DescriptorKind`] 对应一个 binding，binding 的下标就是 `kind.index()`，
//! 描述符在数组中的位置由上层的描述符堆管理器分配。

use ash::vk;
use itertools::Itertools;

use crate::descriptors::descriptor_kind::{DescriptorHeapDesc, DescriptorKind};
use crate::error::GfxResult;

pub struct VkDescriptorHeap {
    pool: vk::DescriptorPool,
    layout: vk::DescriptorSetLayout,
    set: vk::DescriptorSet,
}
// new & init
impl VkDescriptorHeap {
    pub fn new(device: &ash::Device, desc: &DescriptorHeapDesc) -> GfxResult<Self> {
        // 容量为 0 的类型不创建 binding
        let kinds = DescriptorKind::ALL.into_iter().filter(|kind| desc.capacities[*kind] > 0).collect_vec();

        let bindings = kinds
            .iter()
            .map(|kind| {
                vk::DescriptorSetLayoutBinding::default()
                    .binding(kind.index() as u32)
                    .descriptor_type(Self::descriptor_type(*kind))
                    .descriptor_count(desc.capacities[*kind])
                    .stage_flags(vk::ShaderStageFlags::ALL)
            })
            .collect_vec();
        let binding_flags = vec![
            vk::DescriptorBindingFlags::PARTIALLY_BOUND | vk::DescriptorBindingFlags::UPDATE_AFTER_BIND;
            bindings.len()
        ];
        let mut binding_flags_ci = vk::DescriptorSetLayoutBindingFlagsCreateInfo::default().binding_flags(&binding_flags);
        let layout_ci = vk::DescriptorSetLayoutCreateInfo::default()
            .flags(vk::DescriptorSetLayoutCreateFlags::UPDATE_AFTER_BIND_POOL)
            .bindings(&bindings)
            .push_next(&mut binding_flags_ci);
        let layout = unsafe { device.create_descriptor_set_layout(&layout_ci, None)? };

        let pool_sizes = kinds
            .iter()
            .map(|kind| vk::DescriptorPoolSize {
                ty: Self::descriptor_type(*kind),
                descriptor_count: desc.capacities[*kind],
            })
            .collect_vec();
        let pool_ci = vk::DescriptorPoolCreateInfo::default()
            .flags(vk::DescriptorPoolCreateFlags::UPDATE_AFTER_BIND)
            .max_sets(1)
            .pool_sizes(&pool_sizes);
        let pool = match unsafe { device.create_descriptor_pool(&pool_ci, None) } {
            Ok(pool) => pool,
            Err(e) => {
                unsafe { device.destroy_descriptor_set_layout(layout, None) };
                return Err(e.into());
            }
        };

        let layouts = [layout];
        let alloc_info = vk::DescriptorSetAllocateInfo::default().descriptor_pool(pool).set_layouts(&layouts);
        let set = match unsafe { device.allocate_descriptor_sets(&alloc_info) } {
            Ok(sets) => sets[0],
            Err(e) => {
                unsafe {
                    device.destroy_descriptor_pool(pool, None);
                    device.destroy_descriptor_set_layout(layout, None);
                }
                return Err(e.into());
            }
        };

        log::info!("create descriptor heap `{}`: {:?}", desc.debug_name, desc.capacities.0);
        Ok(Self { pool, layout, set })
    }

    pub fn descriptor_type(kind: DescriptorKind) -> vk::DescriptorType {
        match kind {
            DescriptorKind::ConstantView => vk::DescriptorType::UNIFORM_BUFFER,
            DescriptorKind::RawOrStructuredView => vk::DescriptorType::STORAGE_BUFFER,
            DescriptorKind::TextureReadView => vk::DescriptorType::SAMPLED_IMAGE,
            DescriptorKind::TextureWriteView => vk::DescriptorType::STORAGE_IMAGE,
            DescriptorKind::Sampler => vk::DescriptorType::SAMPLER,
        }
    }
}
// destroy
impl VkDescriptorHeap {
    pub fn destroy(self, device: &ash::Device) {
        unsafe {
            // set 随 pool 一起释放
            device.destroy_descriptor_pool(self.pool, None);
            device.destroy_descriptor_set_layout(self.layout, None);
        }
    }
}
// getters
impl VkDescriptorHeap {
    #[inline]
    pub fn layout(&self) -> vk::DescriptorSetLayout {
        self.layout
    }

    #[inline]
    pub fn set(&self) -> vk::DescriptorSet {
        self.set
    }
}

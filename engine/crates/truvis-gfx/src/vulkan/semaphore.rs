use ash::vk;

use crate::error::GfxResult;

/// 每个队列一个的 timeline semaphore
///
/// # Destroy
/// 不实现 Drop，需要手动 destroy
pub struct TimelineSemaphore {
    semaphore: vk::Semaphore,
}
// new & destroy
impl TimelineSemaphore {
    pub fn new(device: &ash::Device, initial_value: u64) -> GfxResult<Self> {
        let mut timeline_type_ci = vk::SemaphoreTypeCreateInfo::default()
            .semaphore_type(vk::SemaphoreType::TIMELINE)
            .initial_value(initial_value);
        let timeline_semaphore_ci = vk::SemaphoreCreateInfo::default().push_next(&mut timeline_type_ci);
        let semaphore = unsafe { device.create_semaphore(&timeline_semaphore_ci, None)? };
        Ok(Self { semaphore })
    }

    #[inline]
    pub fn destroy(self, device: &ash::Device) {
        unsafe {
            device.destroy_semaphore(self.semaphore, None);
        }
    }
}
// getters
impl TimelineSemaphore {
    #[inline]
    pub fn handle(&self) -> vk::Semaphore {
        self.semaphore
    }
}
// tools
impl TimelineSemaphore {
    #[inline]
    pub fn counter_value(&self, device: &ash::Device) -> GfxResult<u64> {
        Ok(unsafe { device.get_semaphore_counter_value(self.semaphore)? })
    }

    pub fn wait(&self, device: &ash::Device, value: u64, timeout_ns: u64) -> GfxResult<()> {
        let wait_semaphore = [self.semaphore];
        let wait_info = vk::SemaphoreWaitInfo::default()
            .semaphores(&wait_semaphore)
            .values(std::slice::from_ref(&value));
        unsafe { device.wait_semaphores(&wait_info, timeout_ns)? };
        Ok(())
    }
}

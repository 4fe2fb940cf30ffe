// Synchronization primitives
//
// One FrameSync per in-flight slot: binary semaphores for acquire/present
// ordering, a fence gating reuse of the slot.

use anyhow::Result;
use ash::vk;
use std::sync::Arc;

use super::VulkanDevice;

/// Frame synchronization - one per frame in flight
pub struct FrameSync {
    pub image_available: vk::Semaphore,
    pub render_finished: vk::Semaphore,
    pub in_flight_fence: vk::Fence,
}

impl FrameSync {
    pub fn new(device: &Arc<VulkanDevice>) -> Result<Self> {
        let semaphore_info = vk::SemaphoreCreateInfo::builder();
        let fence_info = vk::FenceCreateInfo::builder().flags(vk::FenceCreateFlags::SIGNALED); // Start signaled

        unsafe {
            Ok(Self {
                image_available: device.device.create_semaphore(&semaphore_info, None)?,
                render_finished: device.device.create_semaphore(&semaphore_info, None)?,
                in_flight_fence: device.device.create_fence(&fence_info, None)?,
            })
        }
    }

    /// Block until the previous frame on this slot is done. Must precede
    /// any reuse of the slot's semaphores.
    pub fn wait(&self, device: &ash::Device) -> Result<()> {
        unsafe {
            device.wait_for_fences(&[self.in_flight_fence], true, u64::MAX)?;
        }
        Ok(())
    }

    /// Re-arm the fence for this frame's submission. Deferred until a
    /// submit is certain; a reset fence that never gets submitted would
    /// deadlock the slot's next wait.
    pub fn reset(&self, device: &ash::Device) -> Result<()> {
        unsafe {
            device.reset_fences(&[self.in_flight_fence])?;
        }
        Ok(())
    }

    pub fn destroy(&self, device: &ash::Device) {
        unsafe {
            device.destroy_semaphore(self.image_available, None);
            device.destroy_semaphore(self.render_finished, None);
            device.destroy_fence(self.in_flight_fence, None);
        }
    }
}

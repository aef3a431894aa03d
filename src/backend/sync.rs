// Synchronization primitives
//
// One FrameSync per frame in flight: the slot's semaphores order acquire,
// render and present on the GPU, its fence tells the CPU when the slot's last
// submission has retired.

use ash::vk;
use std::sync::Arc;

use super::error::BackendResult;
use super::VulkanDevice;

/// Frame synchronization - one per frame in flight
pub struct FrameSync {
    pub image_available: vk::Semaphore,
    pub render_finished: vk::Semaphore,
    pub in_flight_fence: vk::Fence,
    device: Arc<VulkanDevice>,
}

impl FrameSync {
    pub fn new(device: Arc<VulkanDevice>) -> BackendResult<Self> {
        let semaphore_info = vk::SemaphoreCreateInfo::default();
        // Start signaled so the first wait on a fresh slot returns immediately
        let fence_info = vk::FenceCreateInfo::default().flags(vk::FenceCreateFlags::SIGNALED);

        let d = &device.device;
        unsafe {
            let image_available = d.create_semaphore(&semaphore_info, None)?;
            let render_finished = match d.create_semaphore(&semaphore_info, None) {
                Ok(semaphore) => semaphore,
                Err(e) => {
                    d.destroy_semaphore(image_available, None);
                    return Err(e.into());
                }
            };
            let in_flight_fence = match d.create_fence(&fence_info, None) {
                Ok(fence) => fence,
                Err(e) => {
                    d.destroy_semaphore(image_available, None);
                    d.destroy_semaphore(render_finished, None);
                    return Err(e.into());
                }
            };

            Ok(Self {
                image_available,
                render_finished,
                in_flight_fence,
                device,
            })
        }
    }

    /// Create `count` slots
    pub fn create_slots(device: &Arc<VulkanDevice>, count: usize) -> BackendResult<Vec<Self>> {
        (0..count).map(|_| Self::new(device.clone())).collect()
    }

    /// Block until the slot's last submission has completed
    pub fn wait(&self) -> BackendResult<()> {
        unsafe {
            self.device
                .device
                .wait_for_fences(&[self.in_flight_fence], true, u64::MAX)?;
        }
        Ok(())
    }

    /// Unsignal the fence right before it is handed to a new submission
    pub fn reset(&self) -> BackendResult<()> {
        unsafe { self.device.device.reset_fences(&[self.in_flight_fence])? };
        Ok(())
    }
}

impl Drop for FrameSync {
    fn drop(&mut self) {
        unsafe {
            self.device.device.destroy_semaphore(self.image_available, None);
            self.device.device.destroy_semaphore(self.render_finished, None);
            self.device.device.destroy_fence(self.in_flight_fence, None);
        }
    }
}

// Command pool and one-shot submission
//
// One-shot buffers are used for init-time transfers: record, submit to the
// graphics queue, block until the GPU is done, free.

use ash::vk;
use std::sync::Arc;

use super::error::BackendResult;
use super::VulkanDevice;

pub struct CommandPool {
    pub pool: vk::CommandPool,
    device: Arc<VulkanDevice>,
}

impl CommandPool {
    /// Pool on the graphics family
    pub fn new(device: Arc<VulkanDevice>) -> BackendResult<Self> {
        let pool_info = vk::CommandPoolCreateInfo::default()
            .queue_family_index(device.queue_families.graphics)
            // RESET: pre-recorded buffers are freed and re-allocated on resize
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER);

        let pool = unsafe { device.device.create_command_pool(&pool_info, None)? };
        Ok(Self { pool, device })
    }

    pub fn allocate(&self, count: u32) -> BackendResult<Vec<vk::CommandBuffer>> {
        let alloc_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(self.pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(count);

        let buffers = unsafe { self.device.device.allocate_command_buffers(&alloc_info)? };
        Ok(buffers)
    }

    pub fn free(&self, buffers: &[vk::CommandBuffer]) {
        if buffers.is_empty() {
            return;
        }
        unsafe { self.device.device.free_command_buffers(self.pool, buffers) };
    }

    /// Record commands with `record`, submit them and wait for completion
    pub fn one_shot<F>(&self, record: F) -> BackendResult<()>
    where
        F: FnOnce(&ash::Device, vk::CommandBuffer),
    {
        let cmd = self.allocate(1)?[0];
        let result = self.submit_and_wait(cmd, record);
        self.free(&[cmd]);
        result
    }

    fn submit_and_wait<F>(&self, cmd: vk::CommandBuffer, record: F) -> BackendResult<()>
    where
        F: FnOnce(&ash::Device, vk::CommandBuffer),
    {
        let device = &self.device.device;

        let begin_info =
            vk::CommandBufferBeginInfo::default().flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);

        unsafe {
            device.begin_command_buffer(cmd, &begin_info)?;
            record(device, cmd);
            device.end_command_buffer(cmd)?;

            let fence = device.create_fence(&vk::FenceCreateInfo::default(), None)?;

            let command_buffers = [cmd];
            let submit_info = vk::SubmitInfo::default().command_buffers(&command_buffers);

            let waited = device
                .queue_submit(self.device.graphics_queue, &[submit_info], fence)
                .and_then(|()| device.wait_for_fences(&[fence], true, u64::MAX));

            device.destroy_fence(fence, None);
            waited?;
        }

        Ok(())
    }
}

impl Drop for CommandPool {
    fn drop(&mut self) {
        // Also frees every buffer still allocated from the pool
        unsafe { self.device.device.destroy_command_pool(self.pool, None) };
    }
}

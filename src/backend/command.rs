// Command pool and one-time submission
//
// The culling dispatch records into a transient command buffer, submits,
// and blocks on a fence: its output buffers are read back on the frame
// thread before draw recording continues.

use anyhow::{Context, Result};
use ash::vk;
use std::sync::Arc;

use super::VulkanDevice;

/// A command pool with helpers for per-image buffers and blocking
/// one-time submissions.
pub struct CommandPool {
    pub pool: vk::CommandPool,
    device: Arc<VulkanDevice>,
}

impl CommandPool {
    pub fn new(device: Arc<VulkanDevice>) -> Result<Self> {
        let pool_info = vk::CommandPoolCreateInfo::builder()
            .queue_family_index(device.graphics_queue_family)
            .flags(
                vk::CommandPoolCreateFlags::TRANSIENT
                    | vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER,
            );

        let pool = unsafe {
            device
                .device
                .create_command_pool(&pool_info, None)
                .context("Failed to create command pool")?
        };

        Ok(Self { pool, device })
    }

    /// Allocate `count` primary command buffers.
    pub fn allocate(&self, count: u32) -> Result<Vec<vk::CommandBuffer>> {
        let alloc_info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(self.pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(count);

        unsafe {
            self.device
                .device
                .allocate_command_buffers(&alloc_info)
                .context("Failed to allocate command buffers")
        }
    }

    pub fn free(&self, buffers: &[vk::CommandBuffer]) {
        if !buffers.is_empty() {
            unsafe {
                self.device.device.free_command_buffers(self.pool, buffers);
            }
        }
    }

    /// Record into a transient command buffer, submit, and block until the
    /// GPU has finished. Used by the culling dispatch, whose results the
    /// same frame reads back.
    pub fn submit_and_wait<F>(&self, record: F) -> Result<()>
    where
        F: FnOnce(vk::CommandBuffer),
    {
        let device = &self.device.device;
        let cmd = self.allocate(1)?[0];

        let begin_info = vk::CommandBufferBeginInfo::builder()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);

        let fence_info = vk::FenceCreateInfo::builder();
        let fence = unsafe { device.create_fence(&fence_info, None)? };

        let result = (|| -> Result<()> {
            unsafe {
                device.begin_command_buffer(cmd, &begin_info)?;
            }
            record(cmd);
            unsafe {
                device.end_command_buffer(cmd)?;

                let command_buffers = [cmd];
                let submit_info = vk::SubmitInfo::builder().command_buffers(&command_buffers);
                device.queue_submit(
                    self.device.graphics_queue,
                    &[submit_info.build()],
                    fence,
                )?;
                device.wait_for_fences(&[fence], true, u64::MAX)?;
            }
            Ok(())
        })();

        unsafe {
            device.destroy_fence(fence, None);
        }
        self.free(&[cmd]);

        result
    }
}

impl Drop for CommandPool {
    fn drop(&mut self) {
        unsafe {
            self.device.device.destroy_command_pool(self.pool, None);
        }
    }
}

// Per-frame command storage
//
// One TRANSIENT command pool per frame in flight with a single primary
// buffer. Resetting the pool recycles everything recorded into it, which is
// only legal once the frame's timeline value has been reached.

use ash::vk;
use std::sync::Arc;

use super::VulkanDevice;
use crate::error::FrameResult;
use crate::frame::CommandAllocator;

pub struct FrameCommands {
    pool: vk::CommandPool,
    buffer: vk::CommandBuffer,
    device: Arc<VulkanDevice>,
}

impl FrameCommands {
    pub fn new(device: Arc<VulkanDevice>) -> FrameResult<Self> {
        let pool_info = vk::CommandPoolCreateInfo::builder()
            .queue_family_index(device.graphics_queue_family)
            .flags(vk::CommandPoolCreateFlags::TRANSIENT);
        let pool = unsafe { device.device.create_command_pool(&pool_info, None) }?;

        let alloc_info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);

        let buffer = match unsafe { device.device.allocate_command_buffers(&alloc_info) } {
            Ok(buffers) => buffers[0],
            Err(e) => {
                unsafe { device.device.destroy_command_pool(pool, None) };
                return Err(e.into());
            }
        };

        Ok(Self { pool, buffer, device })
    }

    pub fn buffer(&self) -> vk::CommandBuffer {
        self.buffer
    }

    /// Begin one-time recording. Call after `reset`.
    pub fn begin(&self) -> FrameResult<()> {
        let begin_info = vk::CommandBufferBeginInfo::builder()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        unsafe { self.device.device.begin_command_buffer(self.buffer, &begin_info) }?;
        Ok(())
    }

    pub fn end(&self) -> FrameResult<()> {
        unsafe { self.device.device.end_command_buffer(self.buffer) }?;
        Ok(())
    }
}

impl CommandAllocator for FrameCommands {
    fn reset(&mut self) -> FrameResult<()> {
        unsafe {
            self.device
                .device
                .reset_command_pool(self.pool, vk::CommandPoolResetFlags::empty())
        }?;
        Ok(())
    }
}

impl Drop for FrameCommands {
    fn drop(&mut self) {
        // Also frees the command buffer
        unsafe { self.device.device.destroy_command_pool(self.pool, None) };
    }
}

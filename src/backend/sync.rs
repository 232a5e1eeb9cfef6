// Synchronization primitives
//
// Timeline semaphore for CPU-GPU frame pacing, binary semaphores for the
// acquire/present handshake with the swap chain. Each wrapper owns its
// handle and destroys it on drop.

use ash::vk;
use std::sync::Arc;
use std::time::Duration;

use super::VulkanDevice;
use crate::error::{FrameError, FrameResult};
use crate::frame::TimelineFence;

/// Monotonic GPU counter (Vulkan 1.2 timeline semaphore).
pub struct TimelineSemaphore {
    semaphore: vk::Semaphore,
    device: Arc<VulkanDevice>,
}

impl TimelineSemaphore {
    pub fn new(device: Arc<VulkanDevice>) -> FrameResult<Self> {
        let mut type_info = vk::SemaphoreTypeCreateInfo::builder()
            .semaphore_type(vk::SemaphoreType::TIMELINE)
            .initial_value(0);
        let create_info = vk::SemaphoreCreateInfo::builder().push_next(&mut type_info);

        let semaphore = unsafe { device.device.create_semaphore(&create_info, None) }?;
        Ok(Self { semaphore, device })
    }

    pub fn handle(&self) -> vk::Semaphore {
        self.semaphore
    }
}

impl TimelineFence for TimelineSemaphore {
    fn signal(&self, value: u64) -> FrameResult<()> {
        // Empty submission: its signal is ordered after all earlier work on
        // the queue.
        let values = [value];
        let semaphores = [self.semaphore];
        let mut timeline_info =
            vk::TimelineSemaphoreSubmitInfo::builder().signal_semaphore_values(&values);
        let submit_info = vk::SubmitInfo::builder()
            .signal_semaphores(&semaphores)
            .push_next(&mut timeline_info);

        unsafe {
            self.device.device.queue_submit(
                self.device.graphics_queue,
                &[submit_info.build()],
                vk::Fence::null(),
            )
        }?;
        Ok(())
    }

    fn completed_value(&self) -> FrameResult<u64> {
        let value = unsafe { self.device.device.get_semaphore_counter_value(self.semaphore) }?;
        Ok(value)
    }

    fn wait(&self, value: u64, timeout: Option<Duration>) -> FrameResult<()> {
        let semaphores = [self.semaphore];
        let values = [value];
        let wait_info = vk::SemaphoreWaitInfo::builder()
            .semaphores(&semaphores)
            .values(&values);

        let timeout_ns = timeout.map_or(u64::MAX, |t| {
            t.as_nanos().min(u128::from(u64::MAX - 1)) as u64
        });

        match unsafe { self.device.device.wait_semaphores(&wait_info, timeout_ns) } {
            Ok(()) => Ok(()),
            Err(vk::Result::TIMEOUT) => Err(FrameError::FenceWaitTimedOut {
                value,
                completed: self.completed_value()?,
            }),
            Err(e) => Err(e.into()),
        }
    }
}

impl Drop for TimelineSemaphore {
    fn drop(&mut self) {
        unsafe { self.device.device.destroy_semaphore(self.semaphore, None) };
    }
}

/// GPU-GPU signal between acquire, submit and present.
pub struct BinarySemaphore {
    semaphore: vk::Semaphore,
    device: Arc<VulkanDevice>,
}

impl BinarySemaphore {
    pub fn new(device: Arc<VulkanDevice>) -> FrameResult<Self> {
        let create_info = vk::SemaphoreCreateInfo::builder();
        let semaphore = unsafe { device.device.create_semaphore(&create_info, None) }?;
        Ok(Self { semaphore, device })
    }

    pub fn handle(&self) -> vk::Semaphore {
        self.semaphore
    }
}

impl Drop for BinarySemaphore {
    fn drop(&mut self) {
        unsafe { self.device.device.destroy_semaphore(self.semaphore, None) };
    }
}

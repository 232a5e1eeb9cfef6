// Error types for the frame pacing core
//
// Construction failures and pool exhaustion are fatal for the caller;
// everything here is still a value so the app decides how to die.

use ash::vk;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum FrameError {
    /// Every descriptor slot is live. The heap was sized too small.
    #[error("descriptor pool exhausted: all {capacity} slots are in use")]
    DescriptorPoolExhausted { capacity: u32 },

    #[error("descriptor heap allocator is already created")]
    HeapAlreadyCreated,

    #[error("descriptor heap allocator has not been created")]
    HeapNotCreated,

    /// The swap chain has more buffers than the render target heap has slots.
    #[error("swap chain has {buffers} buffers but the render target heap holds {capacity}")]
    RenderTargetHeapTooSmall { buffers: usize, capacity: u32 },

    /// Only reachable when a wait timeout is configured.
    #[error("timed out waiting for fence value {value} (GPU completed {completed})")]
    FenceWaitTimedOut { value: u64, completed: u64 },

    #[error("GPU device lost")]
    DeviceLost,

    #[error("presentation surface lost")]
    SurfaceLost,

    #[error("Vulkan error: {0}")]
    Vulkan(vk::Result),
}

impl From<vk::Result> for FrameError {
    fn from(result: vk::Result) -> Self {
        match result {
            vk::Result::ERROR_DEVICE_LOST => FrameError::DeviceLost,
            vk::Result::ERROR_SURFACE_LOST_KHR => FrameError::SurfaceLost,
            other => FrameError::Vulkan(other),
        }
    }
}

pub type FrameResult<T> = std::result::Result<T, FrameError>;

// Backend module - Vulkan implementations of the frame pacing seams
//
// Design: Thin wrapper around ash, every handle owned and released on drop

pub mod command;
pub mod descriptor_heap;
pub mod device;
pub mod swapchain;
pub mod sync;

pub use command::FrameCommands;
pub use descriptor_heap::BindlessHeap;
pub use device::VulkanDevice;
pub use swapchain::{PresentStatus, Swapchain};
pub use sync::TimelineSemaphore;

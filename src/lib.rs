// =============================================================================
// FRAME PACER - GPU frame pacing and transient resource layer
// =============================================================================
//
// ARCHITECTURE OVERVIEW:
// ┌─────────────────────────────────────────────────────────────────┐
// │  Renderer (frame loop, resize/occlusion, texture slots)         │
// │    ├── frame::FrameSynchronizer (timeline + ring of contexts)   │
// │    ├── frame::SwapChainResourceManager (render targets)         │
// │    ├── frame::DescriptorHeapAllocator (texture slot free-list)  │
// │    └── backend (ash: device, semaphores, pools, swapchain)      │
// └─────────────────────────────────────────────────────────────────┘
//
// `frame` knows nothing about Vulkan; `backend` implements its traits.
// =============================================================================

pub mod backend;
pub mod config;
pub mod error;
pub mod frame;
pub mod renderer;

pub use error::{FrameError, FrameResult};
pub use renderer::{FrameOutcome, RecordingContext, Renderer};

// Frame pacing core - backend agnostic
//
// Hands out per-frame recording contexts, tracks GPU progress through a
// single monotonically increasing timeline value, recreates render targets
// around resize/occlusion, and manages shader-visible descriptor slots.
//
// Everything here talks to the GPU through the traits below. The Vulkan
// implementations live in `crate::backend`; the simulated ones used by the
// tests live in `testing`.

pub mod context;
pub mod descriptor;
pub mod render_targets;
pub mod synchronizer;

#[cfg(test)]
pub mod testing;

use std::time::Duration;

use crate::error::FrameResult;

pub use context::{FrameContext, FrameState};
pub use descriptor::{
    CpuDescriptorHandle, DescriptorHeapAllocator, DescriptorHeapDesc, DeviceCaps,
    GpuDescriptorHandle,
};
pub use render_targets::{RenderTarget, ResizeOutcome, SwapChainResourceManager};
pub use synchronizer::FrameSynchronizer;

/// GPU/CPU synchronization counter.
///
/// Values only ever grow. `completed_value() <= ` the highest value passed
/// to `signal` at all times.
pub trait TimelineFence {
    /// Enqueue a GPU-side signal that fires once all previously submitted
    /// work on the queue has finished.
    fn signal(&self, value: u64) -> FrameResult<()>;

    /// Highest value the GPU has reached so far.
    fn completed_value(&self) -> FrameResult<u64>;

    /// Block until the GPU reaches `value`. `None` waits forever.
    fn wait(&self, value: u64, timeout: Option<Duration>) -> FrameResult<()>;
}

/// Backing storage for one frame's recorded GPU commands.
pub trait CommandAllocator {
    /// Recycle all memory of the previous recording. The GPU must be done
    /// with every command recorded from this allocator.
    fn reset(&mut self) -> FrameResult<()>;
}

/// Caps how many frames may be queued ahead of the display.
pub trait FrameLatencyWait {
    /// Block until the presentation engine can take another frame.
    /// `frame_slot` is the ring slot that is about to record.
    fn wait_for_present_slot(&mut self, frame_slot: usize) -> FrameResult<()>;
}

/// The swap chain as seen by [`SwapChainResourceManager`].
pub trait SwapChainSurface {
    /// Back buffer resource handle.
    type Buffer: Clone;
    /// Render target view of a back buffer.
    type View;

    fn buffer_count(&self) -> usize;

    fn buffer(&self, index: usize) -> FrameResult<Self::Buffer>;

    /// Create a render target view for `buffer` in the reserved `slot`.
    fn create_view(
        &mut self,
        buffer: &Self::Buffer,
        slot: CpuDescriptorHandle,
    ) -> FrameResult<Self::View>;

    fn destroy_view(&mut self, view: Self::View);

    /// Resize the underlying buffers. All views must be destroyed first.
    fn resize_buffers(&mut self, width: u32, height: u32) -> FrameResult<()>;
}

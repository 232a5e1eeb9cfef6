// Swap chain render targets
//
// Owns the back buffer views and replaces them around resize. Every path
// that releases a view drains the GPU first.

use super::{
    CommandAllocator, CpuDescriptorHandle, DescriptorHeapDesc, DeviceCaps, FrameSynchronizer,
    SwapChainSurface, TimelineFence,
};
use crate::error::{FrameError, FrameResult};

/// One back buffer and its view.
pub struct RenderTarget<B, V> {
    pub buffer: B,
    pub view: V,
    /// Reserved view slot, fixed for the lifetime of the manager.
    pub slot: CpuDescriptorHandle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResizeOutcome {
    Resized,
    /// Buffers could not be resized; targets were recreated on the old ones.
    KeptPreviousSize,
    /// Zero-area request; treated as occlusion and nothing was touched.
    Deferred,
}

pub struct SwapChainResourceManager<S: SwapChainSurface> {
    surface: S,
    caps: DeviceCaps,
    rtv_heap: DescriptorHeapDesc,
    slots: Vec<CpuDescriptorHandle>,
    targets: Vec<RenderTarget<S::Buffer, S::View>>,
    occluded: bool,
}

impl<S: SwapChainSurface> SwapChainResourceManager<S> {
    /// Create the initial render targets, one view slot from `rtv_heap` per
    /// back buffer.
    pub fn new(
        surface: S,
        caps: &DeviceCaps,
        rtv_heap: &DescriptorHeapDesc,
    ) -> FrameResult<Self> {
        let count = surface.buffer_count();
        let mut manager = Self {
            surface,
            caps: *caps,
            rtv_heap: *rtv_heap,
            slots: Vec::with_capacity(count),
            targets: Vec::with_capacity(count),
            occluded: false,
        };
        manager.create_render_targets()?;
        Ok(manager)
    }

    /// Create a view for every current back buffer.
    ///
    /// The swap chain may come back from a resize with more buffers than
    /// before; slots are reserved up to the heap capacity.
    pub fn create_render_targets(&mut self) -> FrameResult<()> {
        debug_assert!(self.targets.is_empty(), "render targets already exist");
        let count = self.surface.buffer_count();
        self.reserve_slots(count)?;

        for index in 0..count {
            let buffer = self.surface.buffer(index)?;
            let slot = self.slots[index];
            let view = self.surface.create_view(&buffer, slot)?;
            self.targets.push(RenderTarget { buffer, view, slot });
        }

        log::debug!("Created {} render targets", count);
        Ok(())
    }

    fn reserve_slots(&mut self, count: usize) -> FrameResult<()> {
        if count > self.rtv_heap.capacity as usize {
            return Err(FrameError::RenderTargetHeapTooSmall {
                buffers: count,
                capacity: self.rtv_heap.capacity,
            });
        }
        if count > self.slots.len() {
            log::debug!("Reserving view slots {}..{}", self.slots.len(), count);
            let first = self.slots.len() as u32;
            let (caps, heap) = (self.caps, self.rtv_heap);
            self.slots
                .extend((first..count as u32).map(|i| heap.cpu_handle(&caps, i)));
        }
        Ok(())
    }

    /// Drain the GPU, then release every view.
    pub fn cleanup_render_targets<F, A>(
        &mut self,
        sync: &mut FrameSynchronizer<F, A>,
    ) -> FrameResult<()>
    where
        F: TimelineFence,
        A: CommandAllocator,
    {
        sync.drain_all()?;
        for target in self.targets.drain(..) {
            self.surface.destroy_view(target.view);
        }
        Ok(())
    }

    /// Cleanup, resize the buffers, recreate.
    ///
    /// A failed buffer resize is logged and the targets are rebuilt on the
    /// existing buffers; the next resize event gets another chance.
    pub fn on_resize<F, A>(
        &mut self,
        sync: &mut FrameSynchronizer<F, A>,
        width: u32,
        height: u32,
    ) -> FrameResult<ResizeOutcome>
    where
        F: TimelineFence,
        A: CommandAllocator,
    {
        if width == 0 || height == 0 {
            self.on_occlusion(true);
            return Ok(ResizeOutcome::Deferred);
        }

        self.cleanup_render_targets(sync)?;

        let outcome = match self.surface.resize_buffers(width, height) {
            Ok(()) => {
                log::info!("Swap chain resized to {}x{}", width, height);
                ResizeOutcome::Resized
            }
            Err(e) => {
                log::warn!(
                    "Swap chain resize to {}x{} failed ({}), keeping current buffers",
                    width,
                    height,
                    e
                );
                ResizeOutcome::KeptPreviousSize
            }
        };

        self.create_render_targets()?;
        Ok(outcome)
    }

    /// While occluded the frame loop submits nothing and polls.
    pub fn on_occlusion(&mut self, occluded: bool) {
        if self.occluded != occluded {
            log::debug!("Surface {}", if occluded { "occluded" } else { "visible" });
        }
        self.occluded = occluded;
    }

    pub fn is_occluded(&self) -> bool {
        self.occluded
    }

    pub fn targets(&self) -> &[RenderTarget<S::Buffer, S::View>] {
        &self.targets
    }

    pub fn target(&self, index: usize) -> Option<&RenderTarget<S::Buffer, S::View>> {
        self.targets.get(index)
    }

    pub fn surface(&self) -> &S {
        &self.surface
    }

    pub fn surface_mut(&mut self) -> &mut S {
        &mut self.surface
    }

    /// Release all views. The caller must have drained the GPU.
    pub fn release_drained(&mut self) {
        for target in self.targets.drain(..) {
            self.surface.destroy_view(target.view);
        }
    }
}

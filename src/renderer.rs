// =============================================================================
// RENDERER - frame loop on top of the pacing core
// =============================================================================
//
// FRAME FLOW:
// 1. Skip everything while occluded
// 2. Apply a pending resize (drains the GPU first)
// 3. Wait for this ring slot's fence, then acquire a swapchain image
// 4. Reset the slot's command pool and let the caller record
// 5. Submit, signal the timeline, present
//
// Present/acquire status (out of date, suboptimal) only schedules a resize
// for the next frame; it never surfaces as an error.

use anyhow::{Context, Result};
use ash::vk;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};
use std::sync::Arc;
use winit::window::Window;

use crate::backend::{
    swapchain, BindlessHeap, FrameCommands, PresentStatus, Swapchain, TimelineSemaphore,
    VulkanDevice,
};
use crate::config::Config;
use crate::error::FrameResult;
use crate::frame::{
    CpuDescriptorHandle, DescriptorHeapAllocator, DescriptorHeapDesc, FrameLatencyWait,
    FrameSynchronizer, GpuDescriptorHandle, ResizeOutcome, SwapChainResourceManager,
    SwapChainSurface,
};

/// View slots reserved for swapchain images.
const RENDER_TARGET_SLOTS: u32 = 8;

/// Everything a recorder needs to append commands to the current frame.
pub struct RecordingContext<'a> {
    pub device: &'a ash::Device,
    pub command_buffer: vk::CommandBuffer,
    pub image: vk::Image,
    pub view: vk::ImageView,
    pub format: vk::Format,
    pub extent: vk::Extent2D,
    /// Bindless texture array; index with a slot's GPU handle.
    pub texture_set: vk::DescriptorSet,
    pub frame_slot: usize,
    pub image_index: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameOutcome {
    Presented,
    /// Nothing was submitted (occluded, or the swapchain needs a resize).
    Skipped,
}

/// Field order matters for Drop: the frame ring and render targets go
/// before the texture heap, the device goes last.
pub struct Renderer {
    sync: FrameSynchronizer<TimelineSemaphore, FrameCommands>,
    targets: SwapChainResourceManager<Swapchain>,
    texture_heap: BindlessHeap,
    texture_slots: DescriptorHeapAllocator,
    surface_size: (u32, u32),
    pending_resize: Option<(u32, u32)>,
    device: Arc<VulkanDevice>,
}

impl Renderer {
    /// Create the device, swapchain, frame ring and texture heap for `window`.
    pub fn new(config: &Config, window: &Window) -> Result<Self> {
        let display = window
            .display_handle()
            .context("Failed to get display handle")?
            .as_raw();
        let window_handle = window
            .window_handle()
            .context("Failed to get window handle")?
            .as_raw();

        // Validation only in debug builds
        let enable_validation = cfg!(debug_assertions) && config.debug.validation_layers;
        let device = VulkanDevice::new(&config.window.title, display, enable_validation)?;
        let caps = device.caps();

        let frames_in_flight = config.graphics.frames_in_flight;
        let size = window.inner_size();

        let surface = swapchain::create_surface(&device, display, window_handle)
            .context("Failed to create surface")?;
        let swapchain = Swapchain::new(
            device.clone(),
            surface,
            config.get_present_mode(),
            frames_in_flight,
            size.width,
            size.height,
        )?;

        // Views are plain handles indexed by slot. A rebuilt swapchain may
        // hand back more images than the first one did.
        let rtv_heap = DescriptorHeapDesc {
            cpu_start: CpuDescriptorHandle(0),
            gpu_start: GpuDescriptorHandle(0),
            capacity: (swapchain.buffer_count() as u32).max(RENDER_TARGET_SLOTS),
        };
        let targets = SwapChainResourceManager::new(swapchain, &caps, &rtv_heap)
            .context("Failed to create render targets")?;

        let timeline =
            TimelineSemaphore::new(device.clone()).context("Failed to create frame fence")?;
        let allocators = (0..frames_in_flight)
            .map(|_| FrameCommands::new(device.clone()))
            .collect::<FrameResult<Vec<_>>>()
            .context("Failed to create command pools")?;
        let sync = FrameSynchronizer::new(timeline, allocators)
            .with_wait_timeout(config.sync.fence_wait_timeout());

        let mut capacity = config.graphics.srv_heap_capacity;
        let device_limit = device.max_bindless_images();
        if capacity > device_limit {
            log::warn!(
                "srv_heap_capacity {} exceeds device limit {}, clamping",
                capacity,
                device_limit
            );
            capacity = device_limit;
        }
        let texture_heap = BindlessHeap::new(device.clone(), capacity)
            .context("Failed to create texture descriptor heap")?;
        let texture_slots = DescriptorHeapAllocator::new(&caps, &texture_heap.desc())?;

        log::info!(
            "Renderer ready: {} frames in flight, {} render targets, {} texture slots",
            frames_in_flight,
            targets.targets().len(),
            capacity
        );

        Ok(Self {
            sync,
            targets,
            texture_heap,
            texture_slots,
            surface_size: (size.width, size.height),
            pending_resize: None,
            device,
        })
    }

    /// Render one frame. `record` appends commands for the acquired image;
    /// the image must end up in `PRESENT_SRC_KHR` layout.
    pub fn render_frame<R>(&mut self, record: R) -> Result<FrameOutcome>
    where
        R: FnOnce(&RecordingContext<'_>) -> Result<()>,
    {
        if self.targets.is_occluded() {
            return Ok(FrameOutcome::Skipped);
        }

        if let Some((width, height)) = self.pending_resize.take() {
            self.apply_resize(width, height)?;
            if self.targets.is_occluded() {
                return Ok(FrameOutcome::Skipped);
            }
        }

        // ─────────────────────────────────────────────────────────────────────
        // Wait for the ring slot, then for a presentable image
        // ─────────────────────────────────────────────────────────────────────
        let latency: &mut dyn FrameLatencyWait = self.targets.surface_mut();
        let frame_slot = self.sync.acquire_next_frame(Some(latency))?.slot();

        let Some(acquired) = self.targets.surface().acquired() else {
            self.pending_resize = Some(self.surface_size);
            return Ok(FrameOutcome::Skipped);
        };

        let target = self
            .targets
            .target(acquired.index as usize)
            .context("Acquired image has no render target")?;
        let surface = self.targets.surface();

        // ─────────────────────────────────────────────────────────────────────
        // Record
        // ─────────────────────────────────────────────────────────────────────
        let frame = self.sync.current_frame_mut();
        let commands = frame.begin_recording()?;
        let command_buffer = commands.buffer();

        let ctx = RecordingContext {
            device: &self.device.device,
            command_buffer,
            image: target.buffer,
            view: target.view,
            format: surface.format(),
            extent: surface.extent(),
            texture_set: self.texture_heap.set(),
            frame_slot,
            image_index: acquired.index,
        };

        let recorded = commands
            .begin()
            .map_err(anyhow::Error::from)
            .and_then(|()| record(&ctx))
            .and_then(|()| commands.end().map_err(anyhow::Error::from));
        if let Err(e) = recorded {
            frame.abandon_recording();
            return Err(e.context("Failed to record frame"));
        }

        // ─────────────────────────────────────────────────────────────────────
        // Submit, then tie the slot to the timeline
        // ─────────────────────────────────────────────────────────────────────
        let wait_semaphores = [acquired.wait_semaphore];
        let wait_stages = [vk::PipelineStageFlags::ALL_COMMANDS];
        let command_buffers = [command_buffer];
        let signal_semaphores = [surface.present_semaphore(acquired.index)];

        let submit_info = vk::SubmitInfo::builder()
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&wait_stages)
            .command_buffers(&command_buffers)
            .signal_semaphores(&signal_semaphores);

        unsafe {
            self.device.device.queue_submit(
                self.device.graphics_queue,
                &[submit_info.build()],
                vk::Fence::null(),
            )
        }
        .context("Failed to submit frame")?;

        self.sync.submit_and_advance()?;

        // ─────────────────────────────────────────────────────────────────────
        // Present
        // ─────────────────────────────────────────────────────────────────────
        match self.targets.surface_mut().present(self.device.graphics_queue)? {
            PresentStatus::Presented => {}
            PresentStatus::Suboptimal | PresentStatus::OutOfDate => {
                log::debug!("Swapchain needs recreation after present");
                self.pending_resize = Some(self.surface_size);
            }
        }

        Ok(FrameOutcome::Presented)
    }

    /// Window size changed. Applied at the start of the next frame.
    pub fn request_resize(&mut self, width: u32, height: u32) {
        if width == 0 || height == 0 {
            self.targets.on_occlusion(true);
            return;
        }
        self.targets.on_occlusion(false);
        self.surface_size = (width, height);
        self.pending_resize = Some((width, height));
    }

    pub fn set_occluded(&mut self, occluded: bool) {
        self.targets.on_occlusion(occluded);
    }

    pub fn is_occluded(&self) -> bool {
        self.targets.is_occluded()
    }

    fn apply_resize(&mut self, width: u32, height: u32) -> Result<()> {
        let outcome = self
            .targets
            .on_resize(&mut self.sync, width, height)
            .context("Failed to recreate render targets")?;
        if outcome == ResizeOutcome::KeptPreviousSize {
            // Rebuilt against the old images; try again on the next event.
            log::debug!("Render targets kept at previous size");
        }
        Ok(())
    }

    // =========================================================================
    // TEXTURE SLOTS
    // =========================================================================

    /// Reserve a slot in the bindless texture array.
    pub fn allocate_texture_slot(
        &mut self,
    ) -> FrameResult<(CpuDescriptorHandle, GpuDescriptorHandle)> {
        self.texture_slots.alloc()
    }

    /// Return a slot. No frame still in flight may sample from it.
    pub fn free_texture_slot(&mut self, cpu: CpuDescriptorHandle, gpu: GpuDescriptorHandle) {
        self.texture_slots.free(cpu, gpu);
    }

    pub fn bind_texture(
        &self,
        cpu: CpuDescriptorHandle,
        view: vk::ImageView,
        sampler: vk::Sampler,
    ) {
        debug_assert!(
            self.texture_slots
                .index_of(cpu, GpuDescriptorHandle(cpu.0))
                .is_some_and(|i| self.texture_slots.is_live(i)),
            "binding a texture into a slot that is not allocated from this heap"
        );
        self.texture_heap.write_texture(cpu, view, sampler);
    }

    /// Layout for pipelines that sample the texture array.
    pub fn texture_set_layout(&self) -> vk::DescriptorSetLayout {
        self.texture_heap.layout()
    }

    pub fn device(&self) -> &Arc<VulkanDevice> {
        &self.device
    }

    /// Block until the GPU has finished all submitted frames.
    pub fn drain(&mut self) -> FrameResult<()> {
        self.sync.drain_all()
    }
}

impl Drop for Renderer {
    fn drop(&mut self) {
        log::info!("Cleaning up renderer...");

        // Nothing may be released while a frame could still reference it
        if let Err(e) = self.sync.drain_all() {
            log::error!("Failed to drain GPU before shutdown: {}", e);
            let _ = self.device.wait_idle();
        }
        self.targets.release_drained();
        self.texture_slots.destroy();

        log::info!("Cleanup complete");
    }
}

// Swapchain - Window presentation
//
// Owns the surface, the chain of images we render to, their views, and the
// binary semaphores of the acquire -> submit -> present handshake.
// Resizing recreates the chain in place, handing the old one over as
// `old_swapchain`.

use anyhow::{Context, Result};
use ash::vk;
use raw_window_handle::{RawDisplayHandle, RawWindowHandle};
use std::ffi::CStr;
use std::sync::Arc;

use super::sync::BinarySemaphore;
use super::VulkanDevice;
use crate::error::{FrameError, FrameResult};
use crate::frame::{CpuDescriptorHandle, FrameLatencyWait, SwapChainSurface};

/// Result of queueing an image for presentation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresentStatus {
    Presented,
    /// Still presentable but no longer matches the surface.
    Suboptimal,
    /// Must be resized before the next frame.
    OutOfDate,
}

/// Image acquired for the frame currently being recorded.
#[derive(Debug, Clone, Copy)]
pub struct AcquiredImage {
    pub index: u32,
    pub wait_semaphore: vk::Semaphore,
    pub suboptimal: bool,
}

/// Instance extension needed to create a surface on `display`.
pub fn platform_surface_extension(display: RawDisplayHandle) -> Result<&'static CStr> {
    match display {
        RawDisplayHandle::Windows(_) => Ok(ash::extensions::khr::Win32Surface::name()),
        RawDisplayHandle::Xlib(_) => Ok(ash::extensions::khr::XlibSurface::name()),
        RawDisplayHandle::Wayland(_) => Ok(ash::extensions::khr::WaylandSurface::name()),
        other => anyhow::bail!("Unsupported display type: {:?}", other),
    }
}

/// Create a `VkSurfaceKHR` for a native window.
pub fn create_surface(
    device: &VulkanDevice,
    display: RawDisplayHandle,
    window: RawWindowHandle,
) -> Result<vk::SurfaceKHR> {
    let entry = &device.entry;
    let instance = &device.instance;

    let surface = unsafe {
        match (display, window) {
            (RawDisplayHandle::Windows(_), RawWindowHandle::Win32(handle)) => {
                let hinstance =
                    handle.hinstance.map(|h| h.get()).unwrap_or(0) as *const std::ffi::c_void;
                let hwnd = handle.hwnd.get() as *const std::ffi::c_void;
                let create_info = vk::Win32SurfaceCreateInfoKHR::builder()
                    .hinstance(hinstance)
                    .hwnd(hwnd);
                ash::extensions::khr::Win32Surface::new(entry, instance)
                    .create_win32_surface(&create_info, None)?
            }
            (RawDisplayHandle::Xlib(display), RawWindowHandle::Xlib(handle)) => {
                let dpy = display
                    .display
                    .context("Xlib display handle has no display")?
                    .as_ptr();
                let create_info = vk::XlibSurfaceCreateInfoKHR::builder()
                    .dpy(dpy.cast())
                    .window(handle.window);
                ash::extensions::khr::XlibSurface::new(entry, instance)
                    .create_xlib_surface(&create_info, None)?
            }
            (RawDisplayHandle::Wayland(display), RawWindowHandle::Wayland(handle)) => {
                let create_info = vk::WaylandSurfaceCreateInfoKHR::builder()
                    .display(display.display.as_ptr())
                    .surface(handle.surface.as_ptr());
                ash::extensions::khr::WaylandSurface::new(entry, instance)
                    .create_wayland_surface(&create_info, None)?
            }
            _ => anyhow::bail!("Unsupported window handle type"),
        }
    };

    Ok(surface)
}

pub struct Swapchain {
    swapchain: vk::SwapchainKHR,
    swapchain_loader: ash::extensions::khr::Swapchain,
    surface: vk::SurfaceKHR,
    surface_loader: ash::extensions::khr::Surface,
    images: Vec<vk::Image>,
    /// Indexed by render target slot.
    views: Vec<Option<vk::ImageView>>,
    format: vk::Format,
    extent: vk::Extent2D,
    present_mode: vk::PresentModeKHR,
    /// One per frame in flight; reusable once that slot's fence is reached.
    acquire_semaphores: Vec<BinarySemaphore>,
    /// One per image.
    present_semaphores: Vec<BinarySemaphore>,
    acquired: Option<AcquiredImage>,
    device: Arc<VulkanDevice>,
}

impl Swapchain {
    /// Takes ownership of `surface`.
    pub fn new(
        device: Arc<VulkanDevice>,
        surface: vk::SurfaceKHR,
        preferred_present_mode: vk::PresentModeKHR,
        frames_in_flight: usize,
        width: u32,
        height: u32,
    ) -> Result<Self> {
        log::info!("Creating swapchain: {}x{}", width, height);

        let surface_loader = ash::extensions::khr::Surface::new(&device.entry, &device.instance);

        let supported = unsafe {
            surface_loader.get_physical_device_surface_support(
                device.physical_device,
                device.graphics_queue_family,
                surface,
            )
        };
        if !matches!(supported, Ok(true)) {
            unsafe { surface_loader.destroy_surface(surface, None) };
            anyhow::bail!("GPU doesn't support presenting to this surface");
        }

        let swapchain_loader =
            ash::extensions::khr::Swapchain::new(&device.instance, &device.device);

        let mut swapchain = Self {
            swapchain: vk::SwapchainKHR::null(),
            swapchain_loader,
            surface,
            surface_loader,
            images: Vec::new(),
            views: Vec::new(),
            format: vk::Format::UNDEFINED,
            extent: vk::Extent2D { width, height },
            present_mode: preferred_present_mode,
            acquire_semaphores: Vec::new(),
            present_semaphores: Vec::new(),
            acquired: None,
            device: device.clone(),
        };

        swapchain.acquire_semaphores = (0..frames_in_flight)
            .map(|_| BinarySemaphore::new(device.clone()))
            .collect::<FrameResult<Vec<_>>>()?;
        swapchain
            .rebuild(width, height)
            .context("Failed to create swapchain")?;

        log::info!(
            "Created swapchain with {} images ({:?}, {:?})",
            swapchain.images.len(),
            swapchain.format,
            swapchain.present_mode
        );
        Ok(swapchain)
    }

    /// (Re)create the chain for the given size. On failure the current chain
    /// and its images stay as they were.
    fn rebuild(&mut self, width: u32, height: u32) -> FrameResult<()> {
        let physical_device = self.device.physical_device;

        let surface_caps = unsafe {
            self.surface_loader
                .get_physical_device_surface_capabilities(physical_device, self.surface)
        }?;
        let formats = unsafe {
            self.surface_loader
                .get_physical_device_surface_formats(physical_device, self.surface)
        }?;
        let present_modes = unsafe {
            self.surface_loader
                .get_physical_device_surface_present_modes(physical_device, self.surface)
        }?;

        // Prefer SRGB
        let surface_format = formats
            .iter()
            .find(|f| {
                f.format == vk::Format::B8G8R8A8_SRGB
                    && f.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR
            })
            .or_else(|| formats.first())
            .copied()
            .ok_or(FrameError::SurfaceLost)?;

        // FIFO is always supported
        let present_mode = if present_modes.contains(&self.present_mode) {
            self.present_mode
        } else {
            vk::PresentModeKHR::FIFO
        };

        let extent = if surface_caps.current_extent.width != u32::MAX {
            surface_caps.current_extent
        } else {
            vk::Extent2D {
                width: width.clamp(
                    surface_caps.min_image_extent.width,
                    surface_caps.max_image_extent.width,
                ),
                height: height.clamp(
                    surface_caps.min_image_extent.height,
                    surface_caps.max_image_extent.height,
                ),
            }
        };
        if extent.width == 0 || extent.height == 0 {
            return Err(FrameError::Vulkan(vk::Result::ERROR_OUT_OF_DATE_KHR));
        }

        // Keep the image count stable across rebuilds
        let mut image_count = if self.images.is_empty() {
            surface_caps.min_image_count + 1
        } else {
            self.images.len() as u32
        };
        image_count = image_count.max(surface_caps.min_image_count);
        if surface_caps.max_image_count > 0 && image_count > surface_caps.max_image_count {
            image_count = surface_caps.max_image_count;
        }

        let create_info = vk::SwapchainCreateInfoKHR::builder()
            .surface(self.surface)
            .min_image_count(image_count)
            .image_format(surface_format.format)
            .image_color_space(surface_format.color_space)
            .image_extent(extent)
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::TRANSFER_DST)
            .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
            .pre_transform(surface_caps.current_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(present_mode)
            .clipped(true)
            .old_swapchain(self.swapchain);

        let swapchain = unsafe { self.swapchain_loader.create_swapchain(&create_info, None) }?;
        let images = match unsafe { self.swapchain_loader.get_swapchain_images(swapchain) } {
            Ok(images) => images,
            Err(e) => {
                unsafe { self.swapchain_loader.destroy_swapchain(swapchain, None) };
                return Err(e.into());
            }
        };

        if self.swapchain != vk::SwapchainKHR::null() {
            unsafe { self.swapchain_loader.destroy_swapchain(self.swapchain, None) };
        }

        if self.present_semaphores.len() != images.len() {
            self.present_semaphores = (0..images.len())
                .map(|_| BinarySemaphore::new(self.device.clone()))
                .collect::<FrameResult<Vec<_>>>()?;
        }
        self.views.resize_with(images.len(), || None);

        self.swapchain = swapchain;
        self.images = images;
        self.format = surface_format.format;
        self.extent = extent;
        self.present_mode = present_mode;
        self.acquired = None;
        Ok(())
    }

    pub fn format(&self) -> vk::Format {
        self.format
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    /// Image acquired by the last `wait_for_present_slot`, if any.
    pub fn acquired(&self) -> Option<AcquiredImage> {
        self.acquired
    }

    pub fn present_semaphore(&self, image_index: u32) -> vk::Semaphore {
        self.present_semaphores[image_index as usize].handle()
    }

    /// Present the acquired image once `render_finished` is signaled.
    pub fn present(&mut self, queue: vk::Queue) -> FrameResult<PresentStatus> {
        let acquired = self
            .acquired
            .take()
            .expect("present() without an acquired image");

        let swapchains = [self.swapchain];
        let image_indices = [acquired.index];
        let wait_semaphores = [self.present_semaphore(acquired.index)];

        let present_info = vk::PresentInfoKHR::builder()
            .wait_semaphores(&wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&image_indices);

        match unsafe { self.swapchain_loader.queue_present(queue, &present_info) } {
            Ok(false) if !acquired.suboptimal => Ok(PresentStatus::Presented),
            Ok(_) => Ok(PresentStatus::Suboptimal),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(PresentStatus::OutOfDate),
            Err(e) => Err(e.into()),
        }
    }
}

impl FrameLatencyWait for Swapchain {
    /// Blocks in `vkAcquireNextImageKHR` until the presentation engine
    /// releases an image. An out-of-date chain leaves nothing acquired.
    fn wait_for_present_slot(&mut self, frame_slot: usize) -> FrameResult<()> {
        debug_assert!(self.acquired.is_none(), "previous image was never presented");
        let semaphore = self.acquire_semaphores[frame_slot].handle();

        let result = unsafe {
            self.swapchain_loader.acquire_next_image(
                self.swapchain,
                u64::MAX,
                semaphore,
                vk::Fence::null(),
            )
        };

        self.acquired = match result {
            Ok((index, suboptimal)) => Some(AcquiredImage {
                index,
                wait_semaphore: semaphore,
                suboptimal,
            }),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => {
                log::debug!("Swapchain out of date during acquire");
                None
            }
            Err(e) => return Err(e.into()),
        };
        Ok(())
    }
}

impl SwapChainSurface for Swapchain {
    type Buffer = vk::Image;
    type View = vk::ImageView;

    fn buffer_count(&self) -> usize {
        self.images.len()
    }

    fn buffer(&self, index: usize) -> FrameResult<vk::Image> {
        Ok(self.images[index])
    }

    fn create_view(
        &mut self,
        buffer: &vk::Image,
        slot: CpuDescriptorHandle,
    ) -> FrameResult<vk::ImageView> {
        let create_info = vk::ImageViewCreateInfo::builder()
            .image(*buffer)
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(self.format)
            .components(vk::ComponentMapping {
                r: vk::ComponentSwizzle::IDENTITY,
                g: vk::ComponentSwizzle::IDENTITY,
                b: vk::ComponentSwizzle::IDENTITY,
                a: vk::ComponentSwizzle::IDENTITY,
            })
            .subresource_range(vk::ImageSubresourceRange {
                aspect_mask: vk::ImageAspectFlags::COLOR,
                base_mip_level: 0,
                level_count: 1,
                base_array_layer: 0,
                layer_count: 1,
            });

        let view = unsafe { self.device.device.create_image_view(&create_info, None) }?;
        let slot = slot.0 as usize;
        debug_assert!(self.views[slot].is_none(), "render target slot {} in use", slot);
        self.views[slot] = Some(view);
        Ok(view)
    }

    fn destroy_view(&mut self, view: vk::ImageView) {
        if let Some(entry) = self.views.iter_mut().find(|v| **v == Some(view)) {
            *entry = None;
        }
        unsafe { self.device.device.destroy_image_view(view, None) };
    }

    fn resize_buffers(&mut self, width: u32, height: u32) -> FrameResult<()> {
        debug_assert!(self.views.iter().all(Option::is_none), "resize with live views");
        self.rebuild(width, height)
    }
}

impl Drop for Swapchain {
    fn drop(&mut self) {
        unsafe {
            for view in self.views.iter().flatten() {
                self.device.device.destroy_image_view(*view, None);
            }
            if self.swapchain != vk::SwapchainKHR::null() {
                self.swapchain_loader.destroy_swapchain(self.swapchain, None);
            }
            self.surface_loader.destroy_surface(self.surface, None);
        }
    }
}

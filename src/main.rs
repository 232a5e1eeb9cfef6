// =============================================================================
// FRAME PACER - window shell around the renderer
// =============================================================================
//
// The window layer feeds resize/occlusion events into the renderer and
// drives one frame per redraw. While the window is occluded nothing is
// submitted and the loop wakes up at a fixed interval instead of spinning.
//
// =============================================================================

use anyhow::Result;
use env_logger::{Builder, Env, Target};
use ash::vk;
use frame_pacer::config::Config;
use frame_pacer::{FrameOutcome, RecordingContext, Renderer};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::sync::Arc;
use std::time::Instant;
use winit::{
    application::ApplicationHandler,
    event::WindowEvent,
    event_loop::{ActiveEventLoop, ControlFlow, EventLoop},
    window::{Fullscreen, Window, WindowAttributes},
};

// =============================================================================
// ENTRY POINT
// =============================================================================

fn main() -> Result<()> {
    let config = Config::load();

    init_logging(&config);
    log::info!("Starting frame pacer");
    log::info!(
        "Window: {}x{}, {} frames in flight, {} texture slots",
        config.window.width,
        config.window.height,
        config.graphics.frames_in_flight,
        config.graphics.srv_heap_capacity
    );

    let event_loop = EventLoop::new()?;
    let mut app = App::new(config);
    event_loop.run_app(&mut app)?;

    match app.fatal_error.take() {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

/// Initialize logging; with `debug.log_to_file` records go to the log file
/// instead of stderr.
fn init_logging(config: &Config) {
    logger_builder(config, Env::default()).init();
}

fn logger_builder(config: &Config, env: Env<'_>) -> Builder {
    let mut builder = Builder::from_env(env.default_filter_or("info"));

    if config.debug.log_to_file {
        match open_log_file(&config.debug.log_file) {
            Ok(file) => {
                builder.target(Target::Pipe(Box::new(file)));
            }
            Err(e) => eprintln!("Failed to open log file {}: {}", config.debug.log_file, e),
        }
    }

    builder
}

fn open_log_file(path: &str) -> std::io::Result<File> {
    let mut file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(path)?;
    writeln!(file, "=== Frame Pacer Log ===")?;
    writeln!(file, "Started: {:?}", std::time::SystemTime::now())?;
    writeln!(file)?;
    Ok(file)
}

// =============================================================================
// APPLICATION STATE
// =============================================================================

struct App {
    config: Config,

    // The renderer must drop before the window it presents to
    renderer: Option<Renderer>,
    window: Option<Arc<Window>>,
    is_fullscreen: bool,

    /// First unrecoverable error; reported after the event loop exits.
    fatal_error: Option<anyhow::Error>,

    // FPS tracking
    frame_count: u32,
    last_fps_update: Instant,
    last_frame_time: Instant,
}

impl App {
    fn new(config: Config) -> Self {
        let is_fullscreen = config.window.fullscreen;
        let now = Instant::now();
        Self {
            config,
            renderer: None,
            window: None,
            is_fullscreen,
            fatal_error: None,
            frame_count: 0,
            last_fps_update: now,
            last_frame_time: now,
        }
    }

    fn fail(&mut self, event_loop: &ActiveEventLoop, error: anyhow::Error) {
        log::error!("{:#}", error);
        self.fatal_error.get_or_insert(error);
        event_loop.exit();
    }

    fn redraw(&mut self, event_loop: &ActiveEventLoop) {
        let Some(renderer) = self.renderer.as_mut() else {
            return;
        };

        let clear_color = self.config.graphics.clear_color;
        match renderer.render_frame(|ctx| record_clear(ctx, clear_color)) {
            Ok(FrameOutcome::Presented) => self.update_fps(),
            Ok(FrameOutcome::Skipped) => {}
            Err(e) => self.fail(event_loop, e.context("Render error")),
        }
    }

    // =========================================================================
    // FULLSCREEN TOGGLE
    // =========================================================================

    fn toggle_fullscreen(&mut self) {
        if let Some(ref window) = self.window {
            self.is_fullscreen = !self.is_fullscreen;

            if self.is_fullscreen {
                window.set_fullscreen(Some(Fullscreen::Borderless(None)));
                log::info!("Entered fullscreen mode");
            } else {
                window.set_fullscreen(None);
                log::info!("Exited fullscreen mode");
            }
            // The resulting Resized event recreates the render targets
        }
    }

    // =========================================================================
    // FPS TRACKING
    // =========================================================================

    fn update_fps(&mut self) {
        if !self.config.debug.show_fps {
            return;
        }

        let now = Instant::now();
        let frame_time = now.duration_since(self.last_frame_time).as_secs_f32();
        self.last_frame_time = now;
        self.frame_count += 1;

        // Update title every second
        if now.duration_since(self.last_fps_update).as_secs_f32() >= 1.0 {
            let elapsed = now.duration_since(self.last_fps_update).as_secs_f32();
            let fps = self.frame_count as f32 / elapsed;

            if let Some(ref window) = self.window {
                window.set_title(&format!(
                    "{} - {:.0} FPS ({:.2}ms)",
                    self.config.window.title,
                    fps,
                    frame_time * 1000.0,
                ));
            }

            self.frame_count = 0;
            self.last_fps_update = now;
        }
    }
}

// =============================================================================
// COMMAND RECORDING
// =============================================================================

/// Stand-in for the UI pass: clear the back buffer and hand it to present.
fn record_clear(ctx: &RecordingContext<'_>, color: [f32; 4]) -> Result<()> {
    let clear_color = vk::ClearColorValue { float32: color };

    let subresource_range = vk::ImageSubresourceRange {
        aspect_mask: vk::ImageAspectFlags::COLOR,
        base_mip_level: 0,
        level_count: 1,
        base_array_layer: 0,
        layer_count: 1,
    };

    // UNDEFINED -> TRANSFER_DST: old contents are discarded
    let barrier_to_transfer = vk::ImageMemoryBarrier::builder()
        .src_access_mask(vk::AccessFlags::empty())
        .dst_access_mask(vk::AccessFlags::TRANSFER_WRITE)
        .old_layout(vk::ImageLayout::UNDEFINED)
        .new_layout(vk::ImageLayout::TRANSFER_DST_OPTIMAL)
        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .image(ctx.image)
        .subresource_range(subresource_range)
        .build();

    // TRANSFER_DST -> PRESENT_SRC
    let barrier_to_present = vk::ImageMemoryBarrier::builder()
        .src_access_mask(vk::AccessFlags::TRANSFER_WRITE)
        .dst_access_mask(vk::AccessFlags::empty())
        .old_layout(vk::ImageLayout::TRANSFER_DST_OPTIMAL)
        .new_layout(vk::ImageLayout::PRESENT_SRC_KHR)
        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .image(ctx.image)
        .subresource_range(subresource_range)
        .build();

    unsafe {
        ctx.device.cmd_pipeline_barrier(
            ctx.command_buffer,
            vk::PipelineStageFlags::TRANSFER,
            vk::PipelineStageFlags::TRANSFER,
            vk::DependencyFlags::empty(),
            &[],
            &[],
            &[barrier_to_transfer],
        );

        ctx.device.cmd_clear_color_image(
            ctx.command_buffer,
            ctx.image,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            &clear_color,
            &[subresource_range],
        );

        ctx.device.cmd_pipeline_barrier(
            ctx.command_buffer,
            vk::PipelineStageFlags::TRANSFER,
            vk::PipelineStageFlags::BOTTOM_OF_PIPE,
            vk::DependencyFlags::empty(),
            &[],
            &[],
            &[barrier_to_present],
        );
    }

    Ok(())
}

// =============================================================================
// EVENT HANDLING
// =============================================================================

impl ApplicationHandler for App {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.window.is_some() {
            return;
        }

        let mut window_attributes = WindowAttributes::default()
            .with_title(&self.config.window.title)
            .with_inner_size(winit::dpi::PhysicalSize::new(
                self.config.window.width,
                self.config.window.height,
            ));

        if self.config.window.fullscreen {
            window_attributes =
                window_attributes.with_fullscreen(Some(Fullscreen::Borderless(None)));
        }

        let window = match event_loop.create_window(window_attributes) {
            Ok(w) => Arc::new(w),
            Err(e) => {
                let error = anyhow::Error::new(e).context("Failed to create window");
                self.fail(event_loop, error);
                return;
            }
        };

        match Renderer::new(&self.config, &window) {
            Ok(renderer) => self.renderer = Some(renderer),
            Err(e) => {
                self.fail(event_loop, e.context("Failed to initialize GPU"));
                return;
            }
        }

        self.window = Some(window);
    }

    fn window_event(
        &mut self,
        event_loop: &ActiveEventLoop,
        _id: winit::window::WindowId,
        event: WindowEvent,
    ) {
        match event {
            WindowEvent::CloseRequested => {
                log::info!("Close requested, shutting down...");
                if let Some(ref mut renderer) = self.renderer {
                    if let Err(e) = renderer.drain() {
                        log::error!("Failed to drain GPU: {}", e);
                    }
                }
                event_loop.exit();
            }

            WindowEvent::Resized(size) => {
                log::debug!("Window resized to {}x{}", size.width, size.height);
                if let Some(ref mut renderer) = self.renderer {
                    renderer.request_resize(size.width, size.height);
                }
            }

            WindowEvent::Occluded(occluded) => {
                if let Some(ref mut renderer) = self.renderer {
                    renderer.set_occluded(occluded);
                }
            }

            WindowEvent::RedrawRequested => self.redraw(event_loop),

            WindowEvent::KeyboardInput { event, .. } => {
                use winit::keyboard::{KeyCode, PhysicalKey};

                if event.state.is_pressed() {
                    if let PhysicalKey::Code(key) = event.physical_key {
                        match key {
                            KeyCode::Escape => {
                                log::info!("ESC pressed, exiting...");
                                event_loop.exit();
                            }
                            KeyCode::F11 => self.toggle_fullscreen(),
                            _ => {}
                        }
                    }
                }
            }

            _ => {}
        }
    }

    /// Redraw continuously while visible; poll at a fixed interval while
    /// occluded.
    fn about_to_wait(&mut self, event_loop: &ActiveEventLoop) {
        let occluded = self.renderer.as_ref().is_some_and(Renderer::is_occluded);

        if occluded {
            let wake_at = Instant::now() + self.config.sync.occluded_poll_interval();
            event_loop.set_control_flow(ControlFlow::WaitUntil(wake_at));
        } else {
            event_loop.set_control_flow(ControlFlow::Poll);
            if let Some(ref window) = self.window {
                window.request_redraw();
            }
        }
    }
}

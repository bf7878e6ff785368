// =============================================================================
// VK-PRESENTER DEMO - Clear-screen window driven by the frame renderer
// =============================================================================
//
// ARCHITECTURE OVERVIEW:
// ┌─────────────────────────────────────────────────────────────────┐
// │  winit event loop (input, resize, redraw)                       │
// │    └── Renderer (begin/end frame, recreation)                   │
// │          ├── FrameSynchronizer (fences, semaphores)             │
// │          └── SwapRing (images, framebuffers, render pass)       │
// │                └── VulkanDevice (queues, allocator, surface)    │
// └─────────────────────────────────────────────────────────────────┘
//
// FRAME FLOW:
// 1. RedrawRequested
// 2. begin_frame: wait for a free slot, acquire a swap image
// 3. Render pass: clears colour + depth (pipelines would draw here)
// 4. end_frame: submit, present, recreate the ring if the window changed
//
// =============================================================================

use anyhow::{Context, Result};
use ash::vk;
use std::sync::Arc;
use std::time::Instant;
use vk_presenter::backend::{VulkanDevice, WindowSurface};
use vk_presenter::config::Config;
use vk_presenter::frame::{RecreateListener, Renderer};
use vk_presenter::FrameResult;
use winit::{
    application::ApplicationHandler,
    event::WindowEvent,
    event_loop::{ActiveEventLoop, EventLoop},
    window::{Fullscreen, Window, WindowAttributes},
};

// =============================================================================
// ENTRY POINT
// =============================================================================

fn main() -> Result<()> {
    init_logging();

    // Load configuration from config.toml
    let config = Config::load();

    log::info!("Starting vk-presenter");
    log::info!(
        "Window: {}x{} ({})",
        config.window.width,
        config.window.height,
        if config.window.fullscreen { "fullscreen" } else { "windowed" }
    );
    log::info!("Present mode: {}", config.graphics.present_mode);

    let event_loop = EventLoop::new()?;
    let mut app = App::new(config);
    event_loop.run_app(&mut app)?;
    Ok(())
}

/// Info by default, RUST_LOG overrides
fn init_logging() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
}

// =============================================================================
// RECREATION LISTENER
// =============================================================================

/// The demo has no pipelines or per-image buffers, so recreation results
/// only need to be reported.
struct LoggingListener;

impl RecreateListener for LoggingListener {
    fn on_resize(&mut self, extent: vk::Extent2D) -> FrameResult<()> {
        log::info!("Swap ring resized to {}x{}", extent.width, extent.height);
        Ok(())
    }

    fn on_render_pass_changed(&mut self, render_pass: vk::RenderPass) -> FrameResult<()> {
        log::info!("Render pass replaced: {:?}", render_pass);
        Ok(())
    }
}

// =============================================================================
// APPLICATION STATE
// =============================================================================

/// Field order matters for Drop: the renderer (and with it the device and
/// the Vulkan surface) goes before the window.
struct App {
    config: Config,
    renderer: Option<Renderer<VulkanDevice, WindowSurface>>,
    window: Option<Arc<Window>>,
    is_fullscreen: bool,

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
            frame_count: 0,
            last_fps_update: now,
            last_frame_time: now,
        }
    }

    // =========================================================================
    // INITIALIZATION
    // =========================================================================

    fn init_vulkan(&mut self, window: Arc<Window>) -> Result<()> {
        let device = VulkanDevice::new(
            &self.config.window.title,
            self.config.debug.validation_layers,
            window.as_ref(),
        )?;

        let settings = self.config.frame_settings(device.max_sample_count);
        let renderer = Renderer::new(
            device,
            WindowSurface::new(window),
            settings,
            Some(Box::new(LoggingListener)),
        )
        .context("Failed to create renderer")?;

        self.renderer = Some(renderer);
        Ok(())
    }

    // =========================================================================
    // RENDERING
    // =========================================================================

    /// Returns whether a frame was presented.
    fn render_frame(&mut self) -> Result<bool> {
        let Some(renderer) = self.renderer.as_mut() else {
            return Ok(false);
        };

        // Minimised: nothing to draw into
        if renderer.surface().is_minimized() {
            return Ok(false);
        }

        let Some(target) = renderer.begin_frame()? else {
            // Surface was out of date, ring rebuilt, try again next tick
            return Ok(false);
        };

        renderer.begin_render_pass(&target);
        renderer.end_render_pass(&target);
        renderer.end_frame(target)?;

        Ok(true)
    }

    // =========================================================================
    // FULLSCREEN TOGGLE
    // =========================================================================

    fn toggle_fullscreen(&mut self) {
        let Some(ref window) = self.window else {
            return;
        };

        self.is_fullscreen = !self.is_fullscreen;
        if self.is_fullscreen {
            // Enter fullscreen (use current monitor)
            window.set_fullscreen(Some(Fullscreen::Borderless(None)));
            log::info!("Entered fullscreen mode");
        } else {
            window.set_fullscreen(None);
            log::info!("Exited fullscreen mode");
        }

        if let Some(renderer) = self.renderer.as_mut() {
            renderer.surface_mut().mark_resized();
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
        let elapsed = now.duration_since(self.last_fps_update).as_secs_f32();
        if elapsed >= 1.0 {
            let fps = self.frame_count as f32 / elapsed;

            if let (Some(window), Some(renderer)) = (&self.window, &self.renderer) {
                let extent = renderer.current_extent();
                window.set_title(&format!(
                    "{} - {:.0} FPS ({:.2}ms) [{}x{}, {} images]",
                    self.config.window.title,
                    fps,
                    frame_time * 1000.0,
                    extent.width,
                    extent.height,
                    renderer.swap_image_count()
                ));
            }

            self.frame_count = 0;
            self.last_fps_update = now;
        }
    }
}

// =============================================================================
// EVENT HANDLING
// =============================================================================

impl ApplicationHandler for App {
    /// Called when the application is ready to create windows.
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.window.is_some() {
            return;
        }

        // Create window with settings from config
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
                log::error!("Failed to create window: {:?}", e);
                event_loop.exit();
                return;
            }
        };

        if let Err(e) = self.init_vulkan(window.clone()) {
            log::error!("Failed to initialize Vulkan: {:?}", e);
            event_loop.exit();
            return;
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
                event_loop.exit();
            }

            WindowEvent::Resized(size) => {
                log::debug!("Window resized to {}x{}", size.width, size.height);
                if let Some(renderer) = self.renderer.as_mut() {
                    renderer.surface_mut().mark_resized();
                }
            }

            WindowEvent::RedrawRequested => match self.render_frame() {
                Ok(true) => self.update_fps(),
                Ok(false) => {}
                Err(e) => {
                    // Device lost, allocation failure, missing listener: no retry
                    log::error!("Render error: {:?}", e);
                    event_loop.exit();
                }
            },

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

    /// Request continuous redraws
    fn about_to_wait(&mut self, _event_loop: &ActiveEventLoop) {
        if let Some(ref window) = self.window {
            window.request_redraw();
        }
    }

    fn exiting(&mut self, _event_loop: &ActiveEventLoop) {
        // Tear down while the window still exists
        self.renderer = None;
        log::info!("Cleanup complete");
    }
}

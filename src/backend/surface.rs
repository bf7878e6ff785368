// Presentation surface provider
//
// The renderer asks the windowing side three things: how big is the drawable
// area, did it change since we last rebuilt, and please block a little while
// the window is minimised.

use ash::vk;
use std::sync::Arc;
use std::time::Duration;
use winit::window::Window;

/// How long `WindowSurface::wait_events` sleeps between size polls.
const MINIMIZED_POLL_INTERVAL: Duration = Duration::from_millis(16);

pub trait SurfaceProvider {
    /// Current drawable size in pixels. Zero in either dimension while
    /// minimised.
    fn extent(&self) -> vk::Extent2D;

    /// One-shot resize flag, stays set until `reset_resized`.
    fn was_resized(&self) -> bool;
    fn reset_resized(&mut self);

    /// Block until the platform has something new to report.
    fn wait_events(&mut self);
}

/// A winit window as a presentation surface.
pub struct WindowSurface {
    window: Arc<Window>,
    resized: bool,
}

impl WindowSurface {
    pub fn new(window: Arc<Window>) -> Self {
        Self {
            window,
            resized: false,
        }
    }

    /// Called by the event loop on `WindowEvent::Resized` (and fullscreen
    /// toggles).
    pub fn mark_resized(&mut self) {
        self.resized = true;
    }

    pub fn is_minimized(&self) -> bool {
        let extent = self.extent();
        extent.width == 0 || extent.height == 0
    }
}

impl SurfaceProvider for WindowSurface {
    fn extent(&self) -> vk::Extent2D {
        let size = self.window.inner_size();
        vk::Extent2D {
            width: size.width,
            height: size.height,
        }
    }

    fn was_resized(&self) -> bool {
        self.resized
    }

    fn reset_resized(&mut self) {
        self.resized = false;
    }

    // winit 0.30 owns the event loop, so we cannot pump it from here. The
    // window size is re-read from the platform on every `extent()` call, so
    // sleeping and polling again is enough.
    fn wait_events(&mut self) {
        log::trace!("Surface extent degenerate, waiting");
        std::thread::sleep(MINIMIZED_POLL_INTERVAL);
    }
}

// Frame controller - the renderer's public face
//
// FRAME FLOW:
// 1. begin_frame: wait for the slot, acquire an image, open the command buffer
// 2. caller records, usually between begin_render_pass / end_render_pass
// 3. end_frame: close, submit, present, then recreate if the surface went stale
//
// State machine:
//   Idle --begin_frame--> FrameOpen --end_frame--> Idle
//   Idle --begin_frame(out of date)--> Recreating --> Idle   (frame skipped)
//   FrameOpen --end_frame(stale)--> Recreating --> Idle
//   any --fatal error--> Failed   (only drop is left)

use ash::vk;
use std::sync::Arc;

use super::synchronizer::FrameSynchronizer;
use crate::backend::context::{Acquire, DeviceContext, PresentRing, SurfaceStatus, SwapRingRequest};
use crate::backend::surface::SurfaceProvider;
use crate::error::{FrameError, FrameResult};

/// Everything the renderer needs to know up front.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrameSettings {
    /// Number of frame slots (K)
    pub frames_in_flight: usize,
    pub samples: vk::SampleCountFlags,
    /// Used when the surface supports it, FIFO otherwise
    pub present_mode: vk::PresentModeKHR,
    pub clear_color: [f32; 4],
}

impl Default for FrameSettings {
    fn default() -> Self {
        Self {
            frames_in_flight: 2,
            samples: vk::SampleCountFlags::TYPE_1,
            present_mode: vk::PresentModeKHR::MAILBOX,
            clear_color: [0.0, 0.0, 0.0, 1.0],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameState {
    Idle,
    FrameOpen,
    Recreating,
    /// A fatal error ended rendering. The renderer can only be dropped.
    Failed,
}

/// Handle to the open frame. Only valid until the matching `end_frame`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameTarget {
    command_buffer: vk::CommandBuffer,
    slot: usize,
    image_index: u32,
    serial: u64,
}

impl FrameTarget {
    /// Command buffer to record this frame's work into
    pub fn command_buffer(&self) -> vk::CommandBuffer {
        self.command_buffer
    }

    pub fn slot_index(&self) -> usize {
        self.slot
    }

    pub fn image_index(&self) -> u32 {
        self.image_index
    }
}

/// Told about recreation results that invalidate dependent objects.
pub trait RecreateListener {
    /// The ring was rebuilt after a resize. Per-image resources sized to the
    /// old extent should be recreated.
    fn on_resize(&mut self, extent: vk::Extent2D) -> FrameResult<()>;

    /// The new render pass is incompatible with the old one. Pipelines built
    /// against the old render pass must be rebuilt.
    fn on_render_pass_changed(&mut self, render_pass: vk::RenderPass) -> FrameResult<()>;
}

pub struct Renderer<D: DeviceContext, S: SurfaceProvider> {
    device: Arc<D>,
    surface: S,
    settings: FrameSettings,
    listener: Option<Box<dyn RecreateListener>>,

    // Only `None` mid-recreation or after a failed one
    ring: Option<D::Ring>,
    sync: Option<FrameSynchronizer>,
    /// One per slot, reused once the slot's fence has signaled
    command_buffers: Vec<vk::CommandBuffer>,

    state: FrameState,
    frame_serial: u64,
    /// Acquire said suboptimal, rebuild once the frame is presented
    recreate_after_present: bool,
    render_pass_open: bool,
}

impl<D: DeviceContext, S: SurfaceProvider> Renderer<D, S> {
    /// Build the first swap ring and frame slots. Blocks while the surface
    /// has no drawable area.
    pub fn new(
        device: Arc<D>,
        surface: S,
        settings: FrameSettings,
        listener: Option<Box<dyn RecreateListener>>,
    ) -> FrameResult<Self> {
        let mut renderer = Self {
            device,
            surface,
            settings,
            listener,
            ring: None,
            sync: None,
            command_buffers: Vec::new(),
            state: FrameState::Idle,
            frame_serial: 0,
            recreate_after_present: false,
            render_pass_open: false,
        };

        // Partially built state is released by Drop on error
        let extent = renderer.wait_for_drawable_extent();
        let ring = renderer
            .device
            .create_swap_ring(&renderer.ring_request(extent), None)?;
        let image_count = ring.image_count();
        renderer.ring = Some(ring);
        renderer.sync = Some(FrameSynchronizer::new(
            renderer.device.as_ref(),
            settings.frames_in_flight,
            image_count,
        )?);
        renderer.command_buffers = renderer
            .device
            .allocate_command_buffers(settings.frames_in_flight as u32)?;

        // The initial size is not a resize
        renderer.surface.reset_resized();

        log::info!(
            "Renderer ready: {}x{}, {} swap images, {} frames in flight, {:?}",
            renderer.current_extent().width,
            renderer.current_extent().height,
            image_count,
            settings.frames_in_flight,
            settings.samples
        );

        Ok(renderer)
    }

    fn ring_request(&self, extent: vk::Extent2D) -> SwapRingRequest {
        SwapRingRequest {
            extent,
            samples: self.settings.samples,
            present_mode: self.settings.present_mode,
        }
    }

    fn ring(&self) -> &D::Ring {
        self.ring
            .as_ref()
            .expect("swap ring missing: a previous recreation failed")
    }

    /// Open a frame. `None` means the surface was out of date: the ring has
    /// been rebuilt and this tick should be skipped.
    ///
    /// # Panics
    /// If a frame is already open, or an earlier error was fatal.
    pub fn begin_frame(&mut self) -> FrameResult<Option<FrameTarget>> {
        self.assert_usable();
        assert_eq!(
            self.state,
            FrameState::Idle,
            "begin_frame called while a frame is open"
        );

        let (Some(sync), Some(ring)) = (self.sync.as_mut(), self.ring.as_ref()) else {
            panic!("swap ring missing: a previous recreation failed");
        };

        let slot = sync.current_slot();
        let acquire = sync.acquire_next_image(self.device.as_ref(), ring);
        let image_index = match self.fatal(acquire)? {
            Acquire::Ready {
                image_index,
                status,
            } => {
                if status == SurfaceStatus::Suboptimal {
                    log::debug!("Acquired suboptimal image, recreating after present");
                    self.recreate_after_present = true;
                }
                image_index
            }
            Acquire::OutOfDate => {
                log::debug!("Surface out of date on acquire, skipping frame");
                self.recreate()?;
                return Ok(None);
            }
        };

        let command_buffer = self.command_buffers[slot];
        let begun = self.device.begin_command_buffer(command_buffer);
        self.fatal(begun)?;

        self.frame_serial += 1;
        self.state = FrameState::FrameOpen;

        Ok(Some(FrameTarget {
            command_buffer,
            slot,
            image_index,
            serial: self.frame_serial,
        }))
    }

    fn assert_usable(&self) {
        assert_ne!(
            self.state,
            FrameState::Failed,
            "renderer is unusable after a fatal error (failed recreation or device error)"
        );
    }

    /// Record a fatal error: nothing but drop is valid afterwards.
    fn fatal<T>(&mut self, result: FrameResult<T>) -> FrameResult<T> {
        if result.is_err() {
            self.state = FrameState::Failed;
        }
        result
    }

    fn assert_current(&self, target: &FrameTarget) {
        self.assert_usable();
        assert_eq!(self.state, FrameState::FrameOpen, "no frame is open");
        assert_eq!(
            target.serial, self.frame_serial,
            "frame target is stale (belongs to an ended frame)"
        );
    }

    /// Begin the ring's render pass on the acquired image, with viewport and
    /// scissor covering the whole extent.
    pub fn begin_render_pass(&mut self, target: &FrameTarget) {
        self.assert_current(target);
        assert!(!self.render_pass_open, "render pass already open");

        self.device.cmd_begin_render_pass(
            target.command_buffer,
            self.ring(),
            target.image_index,
            self.settings.clear_color,
        );
        self.render_pass_open = true;
    }

    pub fn end_render_pass(&mut self, target: &FrameTarget) {
        self.assert_current(target);
        assert!(self.render_pass_open, "no render pass open");

        self.device.cmd_end_render_pass(target.command_buffer);
        self.render_pass_open = false;
    }

    /// Submit and present the frame, then recreate the ring if the surface
    /// went stale or was resized.
    ///
    /// # Panics
    /// If `target` is not the open frame, or a render pass is still open.
    pub fn end_frame(&mut self, target: FrameTarget) -> FrameResult<()> {
        self.assert_current(&target);
        assert!(
            !self.render_pass_open,
            "end_frame called inside an open render pass"
        );

        let ended = self.device.end_command_buffer(target.command_buffer);
        self.fatal(ended)?;

        let (Some(sync), Some(ring)) = (self.sync.as_mut(), self.ring.as_ref()) else {
            panic!("swap ring missing: a previous recreation failed");
        };
        let device = self.device.as_ref();
        let presented = sync
            .submit(device, target.command_buffer, target.image_index)
            .and_then(|()| sync.present(device, ring, target.image_index));
        let status = self.fatal(presented)?;

        self.state = FrameState::Idle;

        let stale = status != SurfaceStatus::Optimal || self.recreate_after_present;
        if stale || self.surface.was_resized() {
            log::debug!(
                "Recreating after present (status: {:?}, resized: {})",
                status,
                self.surface.was_resized()
            );
            self.recreate()?;
        }

        Ok(())
    }

    fn wait_for_drawable_extent(&mut self) -> vk::Extent2D {
        let mut extent = self.surface.extent();
        if extent.width == 0 || extent.height == 0 {
            log::info!("Surface has no drawable area, waiting");
        }
        while extent.width == 0 || extent.height == 0 {
            self.surface.wait_events();
            extent = self.surface.extent();
        }
        extent
    }

    /// Rebuild the ring and the frame slots, then notify the listener.
    /// Either everything completes or the error is fatal.
    fn recreate(&mut self) -> FrameResult<()> {
        let rebuilt = self.rebuild();
        self.fatal(rebuilt)
    }

    fn rebuild(&mut self) -> FrameResult<()> {
        self.state = FrameState::Recreating;

        let extent = self.wait_for_drawable_extent();

        // Nothing may touch the old ring's images past this point
        self.device.wait_idle()?;

        let old_ring = self
            .ring
            .take()
            .expect("swap ring missing: a previous recreation failed");
        let old_layout = old_ring.layout();

        let ring = self
            .device
            .create_swap_ring(&self.ring_request(extent), Some(old_ring))?;
        let new_layout = ring.layout();
        let render_pass = ring.render_pass();
        let new_extent = ring.extent();
        let image_count = ring.image_count();
        self.ring = Some(ring);

        if let Some(old_sync) = self.sync.take() {
            old_sync.destroy(self.device.as_ref());
        }
        self.sync = Some(FrameSynchronizer::new(
            self.device.as_ref(),
            self.settings.frames_in_flight,
            image_count,
        )?);

        if !new_layout.compatible_with(&old_layout) {
            log::info!(
                "Render pass changed: {:?}/{:?} -> {:?}/{:?}",
                old_layout.color_format,
                old_layout.depth_format,
                new_layout.color_format,
                new_layout.depth_format
            );
            self.listener_for("render-pass-changed")?
                .on_render_pass_changed(render_pass)?;
        }

        if self.surface.was_resized() {
            self.listener_for("resize")?.on_resize(new_extent)?;
        }

        self.surface.reset_resized();
        self.recreate_after_present = false;
        self.state = FrameState::Idle;

        log::info!(
            "Swap ring recreated: {}x{}, {} images",
            new_extent.width,
            new_extent.height,
            image_count
        );

        Ok(())
    }

    fn listener_for(
        &mut self,
        notification: &'static str,
    ) -> FrameResult<&mut (dyn RecreateListener + 'static)> {
        self.listener
            .as_deref_mut()
            .ok_or(FrameError::MissingListener(notification))
    }

    /// Slot index of the open (or next) frame, in `0..frames_in_flight`.
    pub fn current_frame_index(&self) -> usize {
        self.sync.as_ref().map_or(0, FrameSynchronizer::current_slot)
    }

    pub fn current_extent(&self) -> vk::Extent2D {
        self.ring().extent()
    }

    pub fn swap_image_count(&self) -> usize {
        self.ring().image_count()
    }

    pub fn render_pass(&self) -> vk::RenderPass {
        self.ring().render_pass()
    }

    pub fn aspect_ratio(&self) -> f32 {
        let extent = self.current_extent();
        extent.width as f32 / extent.height as f32
    }

    pub fn state(&self) -> FrameState {
        self.state
    }

    pub fn surface(&self) -> &S {
        &self.surface
    }

    pub fn surface_mut(&mut self) -> &mut S {
        &mut self.surface
    }
}

impl<D: DeviceContext, S: SurfaceProvider> Drop for Renderer<D, S> {
    fn drop(&mut self) {
        log::info!("Destroying renderer...");

        // Wait for GPU to finish before destroying anything
        if let Err(e) = self.device.wait_idle() {
            log::error!("Failed to wait for device idle: {}", e);
        }

        self.device.free_command_buffers(&self.command_buffers);
        if let Some(sync) = self.sync.take() {
            sync.destroy(self.device.as_ref());
        }
        if let Some(ring) = self.ring.take() {
            self.device.destroy_swap_ring(ring);
        }
    }
}

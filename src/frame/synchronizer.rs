// Frame synchronizer - paces the CPU against the GPU
//
// K frame slots, each with a fence the CPU waits on and two semaphores the
// GPU uses to order acquire -> render -> present. Waiting on a slot's fence
// before reusing it is what caps the number of frames in flight at K.
//
// Swap images and slots are not paired one to one (there may be more images
// than slots, and the presentation engine hands images back in any order),
// so each image also remembers the fence of the last slot that wrote it.

use ash::vk;

use crate::backend::context::{Acquire, DeviceContext, QueueRole, Submission, SurfaceStatus};
use crate::backend::sync::FrameSlot;
use crate::error::{FrameError, FrameResult};

pub struct FrameSynchronizer {
    slots: Vec<FrameSlot>,
    /// Fence of the slot that last submitted work writing each swap image
    images_in_flight: Vec<Option<vk::Fence>>,
    current_slot: usize,
}

impl FrameSynchronizer {
    /// Create `frames_in_flight` slots for a ring of `image_count` images.
    pub fn new<D: DeviceContext>(
        device: &D,
        frames_in_flight: usize,
        image_count: usize,
    ) -> FrameResult<Self> {
        if frames_in_flight == 0 {
            return Err(FrameError::Configuration(
                "at least one frame in flight is required".to_string(),
            ));
        }

        let mut slots = Vec::with_capacity(frames_in_flight);
        for _ in 0..frames_in_flight {
            match FrameSlot::new(device) {
                Ok(slot) => slots.push(slot),
                Err(e) => {
                    for slot in slots {
                        slot.destroy(device);
                    }
                    return Err(e);
                }
            }
        }

        log::debug!(
            "Created {} frame slots for {} swap images",
            frames_in_flight,
            image_count
        );

        Ok(Self {
            slots,
            images_in_flight: vec![None; image_count],
            current_slot: 0,
        })
    }

    /// Slot the next (or currently open) frame uses.
    pub fn current_slot(&self) -> usize {
        self.current_slot
    }

    /// Wait until the current slot is free, then acquire the next image.
    ///
    /// Blocks (no timeout) on the slot's previous submission and, when the
    /// acquired image was last written through another slot, on that slot's
    /// submission too. After `Ready` returns, the image may be recorded into.
    pub fn acquire_next_image<D: DeviceContext>(
        &mut self,
        device: &D,
        ring: &D::Ring,
    ) -> FrameResult<Acquire> {
        let slot = &self.slots[self.current_slot];
        device.wait_for_fence(slot.in_flight)?;

        let acquire = device.acquire_next_image(ring, slot.image_available)?;
        if let Acquire::Ready { image_index, .. } = acquire {
            self.wait_for_image(device, image_index)?;
        }

        Ok(acquire)
    }

    fn wait_for_image<D: DeviceContext>(&self, device: &D, image_index: u32) -> FrameResult<()> {
        if let Some(fence) = self.images_in_flight[image_index as usize] {
            if !device.is_fence_signaled(fence)? {
                device.wait_for_fence(fence)?;
            }
        }
        Ok(())
    }

    /// Submit the frame's command buffer on the graphics queue.
    ///
    /// Waits for image-acquired at colour output, signals render-finished and
    /// the slot fence.
    pub fn submit<D: DeviceContext>(
        &mut self,
        device: &D,
        command_buffer: vk::CommandBuffer,
        image_index: u32,
    ) -> FrameResult<()> {
        self.wait_for_image(device, image_index)?;

        let slot = &self.slots[self.current_slot];
        self.images_in_flight[image_index as usize] = Some(slot.in_flight);

        // Only reset right before submitting, an early return would otherwise
        // leave a fence nobody will ever signal
        device.reset_fence(slot.in_flight)?;

        device.submit(
            QueueRole::Graphics,
            &Submission {
                command_buffer,
                wait_semaphore: slot.image_available,
                wait_stage: vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
                signal_semaphore: slot.render_finished,
                fence: slot.in_flight,
            },
        )
    }

    /// Present `image_index` once rendering finished, then move to the next
    /// slot. The cursor advances even when presenting fails.
    pub fn present<D: DeviceContext>(
        &mut self,
        device: &D,
        ring: &D::Ring,
        image_index: u32,
    ) -> FrameResult<SurfaceStatus> {
        let wait = self.slots[self.current_slot].render_finished;
        let status = device.present(ring, image_index, wait);
        self.current_slot = (self.current_slot + 1) % self.slots.len();
        status
    }

    /// Release all slots. The device must be idle.
    pub fn destroy<D: DeviceContext>(self, device: &D) {
        for slot in self.slots {
            slot.destroy(device);
        }
    }
}

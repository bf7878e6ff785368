// Synchronization primitives
//
// Fences, semaphores for GPU-CPU and GPU-GPU sync
// One FrameSlot per frame in flight, rebuilt with every swap ring generation

use ash::vk;

use super::context::DeviceContext;
use crate::error::FrameResult;

/// Frame synchronization - one per frame in flight
#[derive(Debug)]
pub struct FrameSlot {
    /// Signaled by the GPU when the slot's submission completes
    pub in_flight: vk::Fence,
    /// Signaled when the acquired swap image is ready to be written
    pub image_available: vk::Semaphore,
    /// Signaled when rendering is done, waited by present
    pub render_finished: vk::Semaphore,
}

impl FrameSlot {
    pub fn new<D: DeviceContext>(device: &D) -> FrameResult<Self> {
        // Start signaled so the first wait on a fresh slot returns at once
        let in_flight = device.create_fence(true)?;

        let image_available = match device.create_semaphore() {
            Ok(semaphore) => semaphore,
            Err(e) => {
                device.destroy_fence(in_flight);
                return Err(e);
            }
        };

        let render_finished = match device.create_semaphore() {
            Ok(semaphore) => semaphore,
            Err(e) => {
                device.destroy_semaphore(image_available);
                device.destroy_fence(in_flight);
                return Err(e);
            }
        };

        Ok(Self {
            in_flight,
            image_available,
            render_finished,
        })
    }

    /// The slot's GPU work must be complete (device idle) before this is called.
    pub fn destroy<D: DeviceContext>(self, device: &D) {
        device.destroy_semaphore(self.image_available);
        device.destroy_semaphore(self.render_finished);
        device.destroy_fence(self.in_flight);
    }
}

// Device context - the seam between the frame logic and the GPU
//
// The synchronizer and the renderer only talk to the device through this
// trait. `VulkanDevice` implements it on top of ash; tests implement it with
// a simulated in-order GPU.

use ash::vk;

use super::render_pass::RenderPassLayout;
use crate::error::FrameResult;

/// Logical queue a submission targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueRole {
    Graphics,
    Present,
    Transfer,
}

/// Health of the presentation surface after an acquire or present.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SurfaceStatus {
    /// Image matches the surface exactly
    Optimal,
    /// Still presentable, but the ring should be rebuilt soon
    Suboptimal,
    /// The ring can no longer be used and must be rebuilt
    OutOfDate,
}

/// Outcome of acquiring the next presentable image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acquire {
    /// An image is ready; `status` is `Optimal` or `Suboptimal`
    Ready { image_index: u32, status: SurfaceStatus },
    /// Nothing was acquired, the ring must be rebuilt first
    OutOfDate,
}

/// What a new swap ring should look like.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwapRingRequest {
    pub extent: vk::Extent2D,
    pub samples: vk::SampleCountFlags,
    pub present_mode: vk::PresentModeKHR,
}

/// One frame's worth of graphics work.
#[derive(Debug, Clone, Copy)]
pub struct Submission {
    pub command_buffer: vk::CommandBuffer,
    pub wait_semaphore: vk::Semaphore,
    pub wait_stage: vk::PipelineStageFlags,
    pub signal_semaphore: vk::Semaphore,
    pub fence: vk::Fence,
}

/// Read-only view of a swap ring, as seen by the frame logic.
pub trait PresentRing {
    fn extent(&self) -> vk::Extent2D;
    fn image_count(&self) -> usize;
    fn layout(&self) -> RenderPassLayout;
    fn render_pass(&self) -> vk::RenderPass;

    /// Pipelines built against `other`'s render pass remain usable with this one.
    fn compatible_with(&self, other: &Self) -> bool
    where
        Self: Sized,
    {
        self.layout().compatible_with(&other.layout())
    }
}

/// Everything the frame logic needs from the GPU.
pub trait DeviceContext {
    type Ring: PresentRing;

    /// Build a swap ring. A previous ring is consumed: the backend may recycle
    /// its resources and releases whatever is left of it.
    fn create_swap_ring(
        &self,
        request: &SwapRingRequest,
        previous: Option<Self::Ring>,
    ) -> FrameResult<Self::Ring>;
    fn destroy_swap_ring(&self, ring: Self::Ring);

    fn acquire_next_image(&self, ring: &Self::Ring, signal: vk::Semaphore) -> FrameResult<Acquire>;
    fn present(
        &self,
        ring: &Self::Ring,
        image_index: u32,
        wait: vk::Semaphore,
    ) -> FrameResult<SurfaceStatus>;

    fn create_fence(&self, signaled: bool) -> FrameResult<vk::Fence>;
    fn destroy_fence(&self, fence: vk::Fence);
    fn create_semaphore(&self) -> FrameResult<vk::Semaphore>;
    fn destroy_semaphore(&self, semaphore: vk::Semaphore);

    /// Block until `fence` is signaled. No timeout.
    fn wait_for_fence(&self, fence: vk::Fence) -> FrameResult<()>;
    fn is_fence_signaled(&self, fence: vk::Fence) -> FrameResult<bool>;
    fn reset_fence(&self, fence: vk::Fence) -> FrameResult<()>;

    fn submit(&self, role: QueueRole, submission: &Submission) -> FrameResult<()>;
    fn wait_idle(&self) -> FrameResult<()>;

    fn allocate_command_buffers(&self, count: u32) -> FrameResult<Vec<vk::CommandBuffer>>;
    fn free_command_buffers(&self, command_buffers: &[vk::CommandBuffer]);
    fn begin_command_buffer(&self, command_buffer: vk::CommandBuffer) -> FrameResult<()>;
    fn end_command_buffer(&self, command_buffer: vk::CommandBuffer) -> FrameResult<()>;

    /// Set viewport + scissor to the ring extent and begin the ring's render
    /// pass on the framebuffer of `image_index`.
    fn cmd_begin_render_pass(
        &self,
        command_buffer: vk::CommandBuffer,
        ring: &Self::Ring,
        image_index: u32,
        clear_color: [f32; 4],
    );
    fn cmd_end_render_pass(&self, command_buffer: vk::CommandBuffer);
}

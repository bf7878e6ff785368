// Backend module - Vulkan abstraction layer
//
// Design: Thin wrapper around ash, frame logic talks to it through DeviceContext
// Ownership: every GPU object is released explicitly, swap rings by value

pub mod attachment;
pub mod context;
pub mod device;
pub mod render_pass;
pub mod surface;
pub mod swapchain;
pub mod sync;

pub use context::{
    Acquire, DeviceContext, PresentRing, QueueRole, Submission, SurfaceStatus, SwapRingRequest,
};
pub use device::{QueueFamilies, VulkanDevice};
pub use render_pass::RenderPassLayout;
pub use surface::{SurfaceProvider, WindowSurface};
pub use swapchain::SwapRing;
pub use sync::FrameSlot;

// Error types for the presentation core
//
// Transient surface states (out of date, suboptimal) are NOT errors: they are
// reported through `SurfaceStatus` / `Acquire` and handled by recreation.
// Everything in here is fatal for the render loop.

use ash::vk;
use thiserror::Error;

/// Fatal presentation error.
#[derive(Error, Debug)]
pub enum FrameError {
    /// Vulkan API error (device lost, out of memory, ...)
    #[error("Vulkan error: {0}")]
    Vulkan(#[from] vk::Result),

    /// GPU allocator error
    #[error("Allocator error: {0}")]
    Allocation(#[from] gpu_allocator::AllocationError),

    /// The surface or device cannot satisfy the requested configuration
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Recreation produced a change that a listener must handle, but none was registered
    #[error("Recreation requires a {0} listener but none was registered")]
    MissingListener(&'static str),
}

/// Result type alias for presentation operations.
pub type FrameResult<T> = std::result::Result<T, FrameError>;

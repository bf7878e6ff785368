//! Presentation and frame synchronization for a Vulkan renderer.
//!
//! [`frame::Renderer`] is the entry point: it owns the swap ring and the
//! frame slots, paces the CPU against the GPU and rebuilds everything when
//! the surface is resized or goes stale. The GPU is reached only through
//! [`backend::DeviceContext`], implemented on ash by [`backend::VulkanDevice`].

pub mod backend;
pub mod config;
pub mod error;
pub mod frame;

pub use error::{FrameError, FrameResult};

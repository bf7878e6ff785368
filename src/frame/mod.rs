// Frame module - per-frame pacing and the renderer built on it

#[cfg(test)]
pub(crate) mod mock;
pub mod renderer;
pub mod synchronizer;

pub use renderer::{FrameSettings, FrameState, FrameTarget, RecreateListener, Renderer};
pub use synchronizer::FrameSynchronizer;

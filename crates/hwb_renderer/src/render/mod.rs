//! # Rendering
//!
//! - **vulkan**: RAII wrappers over ash, from the device context down to
//!   imported hardware-buffer images
//! - **frame**: the per-frame protocol and frame state machine
//! - **frame_context**: swapchain-bound targets and the draw step
//! - **engines**: what gets drawn, selected by [`engines::EngineKind`]

pub mod engines;
pub mod frame;
pub mod frame_context;
pub mod vulkan;

pub use engines::{CameraHwbEngine, EngineKind};
pub use frame::{FrameContent, FrameState};
pub use frame_context::{FrameContext, FrameSettings};

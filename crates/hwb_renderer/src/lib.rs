//! # HWB Renderer
//!
//! Draws Android camera frames delivered as `AHardwareBuffer`s onto a window
//! surface with Vulkan.
//!
//! ## Features
//!
//! - **Hardware buffer import**: dedicated external memory, YCbCr conversion
//!   and immutable samplers built from the buffer's reported format
//! - **Swapchain lifecycle**: negotiation, recreation on resize or when out of date
//! - **Bounded frame pacing**: one submission in flight per swapchain image
//! - **Configuration**: TOML or RON files through [`config::Config`]
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use hwb_renderer::prelude::*;
//!
//! fn run(window: &NativeWindow, width: u32, height: u32) -> Result<(), VulkanError> {
//!     hwb_renderer::foundation::logging::init();
//!
//!     let assets = Arc::new(DirectoryAssetSource::new("assets"));
//!     let mut session = RenderSession::create(assets, RendererConfig::default())?;
//!     session.set_window(window, width, height)?;
//!     session.render()
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions, clippy::similar_names, clippy::too_many_arguments)]

pub mod assets;
pub mod config;
pub mod core;
pub mod foundation;
pub mod render;

mod session;

pub use session::{classify_frame, classify_resize, FrameOutcome, RenderSession, StopHandle};

/// Common imports for bridge code
pub mod prelude {
    pub use crate::{
        assets::{AssetSource, DirectoryAssetSource, MemoryAssetSource},
        config::Config,
        core::{RendererConfig, ShaderConfig},
        foundation::math::Orientation,
        render::{
            engines::EngineKind,
            vulkan::{ExternalBuffer, HardwareBufferDesc, ImportError, NativeWindow, VulkanError, VulkanResult},
        },
        FrameOutcome, RenderSession, StopHandle,
    };

    #[cfg(target_os = "android")]
    pub use crate::render::vulkan::HardwareBuffer;
}

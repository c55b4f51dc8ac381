//! Engine variants
//!
//! An engine decides what a session does with incoming hardware buffers.
//! Variants are described by capability records rather than a type
//! hierarchy; only the camera preview engine is implemented.

pub mod camera_hwb;

use serde::{Deserialize, Serialize};

use crate::render::vulkan::{VulkanError, VulkanResult};

pub use camera_hwb::{CameraFeed, CameraHwbEngine, CameraUniforms};

/// What an engine variant can do
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineCapabilities {
    /// Draws into the window surface
    pub presents_to_window: bool,
    /// Consumes imported hardware buffers
    pub imports_hardware_buffer: bool,
    /// Writes NV21 bytes back to host memory
    pub produces_nv21: bool,
    /// Has a working implementation
    pub implemented: bool,
}

/// Selectable engine variants
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum EngineKind {
    /// Sample the camera buffer through a YCbCr conversion and draw it full screen
    #[default]
    CameraHardwareBuffer,
    /// Convert a hardware buffer into an NV21 host buffer
    HwbToNv21,
}

impl EngineKind {
    /// Every known variant
    pub const ALL: [Self; 2] = [Self::CameraHardwareBuffer, Self::HwbToNv21];

    /// Capability record of the variant
    pub const fn capabilities(self) -> EngineCapabilities {
        match self {
            Self::CameraHardwareBuffer => EngineCapabilities {
                presents_to_window: true,
                imports_hardware_buffer: true,
                produces_nv21: false,
                implemented: true,
            },
            Self::HwbToNv21 => EngineCapabilities {
                presents_to_window: false,
                imports_hardware_buffer: true,
                produces_nv21: true,
                implemented: false,
            },
        }
    }

    /// Human readable name
    pub const fn name(self) -> &'static str {
        match self {
            Self::CameraHardwareBuffer => "camera hardware buffer",
            Self::HwbToNv21 => "hardware buffer to NV21",
        }
    }

    /// Fail with [`VulkanError::Unsupported`] unless the variant is implemented
    pub fn ensure_implemented(self) -> VulkanResult<()> {
        if self.capabilities().implemented {
            Ok(())
        } else {
            Err(VulkanError::Unsupported(format!("{} engine is not implemented", self.name())))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_camera_engine_is_implemented() {
        assert!(EngineKind::CameraHardwareBuffer.ensure_implemented().is_ok());
        assert!(matches!(
            EngineKind::HwbToNv21.ensure_implemented(),
            Err(VulkanError::Unsupported(_))
        ));
        assert_eq!(EngineKind::default(), EngineKind::CameraHardwareBuffer);
    }

    #[test]
    fn test_capabilities() {
        for kind in EngineKind::ALL {
            assert!(kind.capabilities().imports_hardware_buffer);
        }
        assert!(EngineKind::CameraHardwareBuffer.capabilities().presents_to_window);
        assert!(!EngineKind::HwbToNv21.capabilities().presents_to_window);
        assert!(EngineKind::HwbToNv21.capabilities().produces_nv21);
    }
}

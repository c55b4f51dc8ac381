//! # Renderer Configuration
//!
//! Settings consumed by the device context, the swapchain and the frame loop.
//! Validation, vsync and depth are per-renderer settings handed to the
//! components that need them.
//!
//! Files can be loaded through the [`Config`] trait in either TOML or RON form:
//!
//! ```toml
//! application_name = "camera-preview"
//! vsync = false
//! use_depth = false
//! engine = "CameraHardwareBuffer"
//!
//! [shaders]
//! vertex_shader_path = "shaders/shader_13_camerahwb.vert.spv"
//! fragment_shader_path = "shaders/shader_13_camerahwb.frag.spv"
//! ```

use serde::{Deserialize, Serialize};

pub use crate::config::{Config, ConfigError};
use crate::render::engines::EngineKind;

/// Default bound for a per-frame fence wait (one second)
pub const DEFAULT_FENCE_TIMEOUT_NS: u64 = 1_000_000_000;

/// Default bound for one-shot command submissions (100 seconds)
pub const DEFAULT_SINGLE_TIME_COMMAND_TIMEOUT_NS: u64 = 100_000_000_000;

/// # Shader Configuration
///
/// Asset-relative paths of the pre-compiled SPIR-V blobs for the active engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShaderConfig {
    /// Path to the vertex shader SPIR-V asset
    pub vertex_shader_path: String,
    /// Path to the fragment shader SPIR-V asset
    pub fragment_shader_path: String,
}

impl ShaderConfig {
    /// Create a new shader configuration
    pub fn new(vertex_path: impl Into<String>, fragment_path: impl Into<String>) -> Self {
        Self {
            vertex_shader_path: vertex_path.into(),
            fragment_shader_path: fragment_path.into(),
        }
    }

    /// Shaders used by the camera hardware-buffer engine
    pub fn camera_hardware_buffer() -> Self {
        Self::new(
            "shaders/shader_13_camerahwb.vert.spv",
            "shaders/shader_13_camerahwb.frag.spv",
        )
    }

    /// Check that both paths are usable asset names
    pub fn validate(&self) -> Result<(), String> {
        for (stage, path) in [
            ("Vertex", &self.vertex_shader_path),
            ("Fragment", &self.fragment_shader_path),
        ] {
            if path.trim().is_empty() {
                return Err(format!("{} shader path cannot be empty", stage));
            }
            if !path.ends_with(".spv") {
                return Err(format!("{} shader must be a SPIR-V blob: {}", stage, path));
            }
        }
        Ok(())
    }
}

impl Default for ShaderConfig {
    fn default() -> Self {
        Self::camera_hardware_buffer()
    }
}

/// # Vulkan Renderer Configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RendererConfig {
    /// Application name for Vulkan instance creation
    pub application_name: String,
    /// Validation layers, debug messenger and object naming. `None` follows the build type
    pub enable_validation: Option<bool>,
    /// Force FIFO presentation
    pub vsync: bool,
    /// Attach a depth/stencil target to the render pass
    pub use_depth: bool,
    /// Upper bound for waiting on a frame fence
    pub fence_timeout_ns: u64,
    /// Upper bound for waiting on a one-shot command buffer
    pub single_time_command_timeout_ns: u64,
    /// Clear color of the color attachment
    pub clear_color: [f32; 4],
    /// Active engine variant
    pub engine: EngineKind,
    /// Shader blobs for the active engine
    pub shaders: ShaderConfig,
}

impl RendererConfig {
    /// Create a new renderer configuration
    pub fn new(app_name: impl Into<String>) -> Self {
        Self {
            application_name: app_name.into(),
            enable_validation: None,
            vsync: false,
            use_depth: false,
            fence_timeout_ns: DEFAULT_FENCE_TIMEOUT_NS,
            single_time_command_timeout_ns: DEFAULT_SINGLE_TIME_COMMAND_TIMEOUT_NS,
            clear_color: [0.0, 0.0, 0.2, 1.0],
            engine: EngineKind::CameraHardwareBuffer,
            shaders: ShaderConfig::default(),
        }
    }

    /// Enable or disable validation layers and debug naming
    pub fn with_validation(mut self, enabled: bool) -> Self {
        self.enable_validation = Some(enabled);
        self
    }

    /// Set vsync
    pub fn with_vsync(mut self, vsync: bool) -> Self {
        self.vsync = vsync;
        self
    }

    /// Enable the depth attachment
    pub fn with_depth(mut self, use_depth: bool) -> Self {
        self.use_depth = use_depth;
        self
    }

    /// Set the frame fence timeout
    pub fn with_fence_timeout_ns(mut self, timeout_ns: u64) -> Self {
        self.fence_timeout_ns = timeout_ns;
        self
    }

    /// Select the engine variant
    pub fn with_engine(mut self, engine: EngineKind) -> Self {
        self.engine = engine;
        self
    }

    /// Set custom shader configuration
    pub fn with_shaders(mut self, shaders: ShaderConfig) -> Self {
        self.shaders = shaders;
        self
    }

    /// Whether validation, the debug messenger and object naming are on
    pub fn debug_enabled(&self) -> bool {
        self.enable_validation.unwrap_or(cfg!(debug_assertions))
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.application_name.is_empty() {
            return Err("Application name cannot be empty".to_string());
        }

        if self.fence_timeout_ns == 0 {
            return Err("Fence timeout must be non-zero".to_string());
        }

        if self.single_time_command_timeout_ns == 0 {
            return Err("Single-time command timeout must be non-zero".to_string());
        }

        if self.clear_color.iter().any(|c| !(0.0..=1.0).contains(c)) {
            return Err(format!("Clear color out of range: {:?}", self.clear_color));
        }

        self.shaders.validate()
    }
}

impl Default for RendererConfig {
    fn default() -> Self {
        Self::new("hwb-renderer")
    }
}

impl Config for RendererConfig {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigFormat;

    #[test]
    fn test_defaults_match_camera_engine() {
        let config = RendererConfig::default();
        assert!(!config.vsync);
        assert!(!config.use_depth);
        assert_eq!(config.engine, EngineKind::CameraHardwareBuffer);
        assert_eq!(config.clear_color, [0.0, 0.0, 0.2, 1.0]);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        assert!(RendererConfig::new("").validate().is_err());
        assert!(RendererConfig::default().with_fence_timeout_ns(0).validate().is_err());

        let shaders = ShaderConfig::new("shaders/quad.vert", "shaders/quad.frag.spv");
        assert!(RendererConfig::default().with_shaders(shaders).validate().is_err());
    }

    #[test]
    fn test_explicit_validation_flag_wins() {
        assert!(RendererConfig::default().with_validation(true).debug_enabled());
        assert!(!RendererConfig::default().with_validation(false).debug_enabled());
    }

    #[test]
    fn test_toml_and_ron_round_trip() {
        let config = RendererConfig::new("preview")
            .with_vsync(true)
            .with_depth(true)
            .with_validation(false);

        for format in [ConfigFormat::Toml, ConfigFormat::Ron] {
            let text = config.to_config_string(format).unwrap();
            let parsed = RendererConfig::from_config_str(&text, format).unwrap();
            assert_eq!(parsed, config);
        }
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let parsed = RendererConfig::from_config_str("vsync = true\n", ConfigFormat::Toml).unwrap();
        assert!(parsed.vsync);
        assert_eq!(parsed.shaders, ShaderConfig::camera_hardware_buffer());
        assert_eq!(parsed.fence_timeout_ns, DEFAULT_FENCE_TIMEOUT_NS);
    }
}

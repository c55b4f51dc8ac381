//! Vulkan backend
//!
//! RAII wrappers over ash. Every object that needs the device holds an
//! `Arc<DeviceContext>` or a cloned `ash::Device` created from it.

pub mod buffer;
pub mod commands;
pub mod context;
pub mod descriptor_set;
pub mod framebuffer;
pub mod hardware_buffer;
pub mod image;
pub mod memory;
pub mod render_pass;
pub mod shader;
pub mod surface;
pub mod swapchain;
pub mod sync;
pub mod vertex_layout;

pub use buffer::{BufferResource, UniformSink};
pub use commands::CommandPool;
pub use context::{DeviceContext, ImportError, PhysicalDeviceInfo, VulkanError, VulkanResult};
pub use descriptor_set::{DescriptorPool, DescriptorSetLayout, DescriptorSetLayoutBuilder, DescriptorSetWriter};
pub use framebuffer::{DepthBuffer, Framebuffer};
pub use hardware_buffer::{ExternalBuffer, HardwareBufferDesc};
pub use image::{ImageBasicInfo, ImageResource, LayoutTransition};
pub use render_pass::RenderPass;
pub use shader::{GraphicsPipeline, ShaderModule};
pub use surface::NativeWindow;
pub use swapchain::PresentationSurface;
pub use sync::{Fence, FrameSync, Semaphore};
pub use vertex_layout::{VertexUv, VulkanVertexLayout, QUAD_VERTICES};

#[cfg(target_os = "android")]
pub use hardware_buffer::HardwareBuffer;

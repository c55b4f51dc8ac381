//! Framebuffer and depth target management

use std::sync::Arc;

use ash::{vk, Device};

use crate::render::vulkan::image::format::depth_aspect;
use crate::render::vulkan::{DeviceContext, VulkanError, VulkanResult};

/// Framebuffer wrapper with RAII cleanup
pub struct Framebuffer {
    device: Device,
    framebuffer: vk::Framebuffer,
}

impl Framebuffer {
    /// Create a new framebuffer
    pub fn new(
        device: Device,
        render_pass: vk::RenderPass,
        attachments: &[vk::ImageView],
        extent: vk::Extent2D,
    ) -> VulkanResult<Self> {
        let framebuffer_create_info = vk::FramebufferCreateInfo::builder()
            .render_pass(render_pass)
            .attachments(attachments)
            .width(extent.width)
            .height(extent.height)
            .layers(1);

        let framebuffer = unsafe {
            device
                .create_framebuffer(&framebuffer_create_info, None)
                .map_err(VulkanError::Api)?
        };

        Ok(Self { device, framebuffer })
    }

    /// Get the framebuffer handle
    pub fn handle(&self) -> vk::Framebuffer {
        self.framebuffer
    }
}

impl Drop for Framebuffer {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_framebuffer(self.framebuffer, None);
        }
    }
}

/// Attachment list for swapchain image `color`, shared depth view last
pub fn framebuffer_attachments(color: vk::ImageView, depth: Option<vk::ImageView>) -> Vec<vk::ImageView> {
    std::iter::once(color).chain(depth).collect()
}

/// Depth/stencil target sized to the swapchain
pub struct DepthBuffer {
    context: Arc<DeviceContext>,
    image: vk::Image,
    memory: vk::DeviceMemory,
    image_view: vk::ImageView,
    format: vk::Format,
}

impl DepthBuffer {
    /// Create a depth buffer in device-local memory
    ///
    /// Stencil formats get a view over both the depth and stencil aspects.
    pub fn new(context: &Arc<DeviceContext>, format: vk::Format, extent: vk::Extent2D) -> VulkanResult<Self> {
        let device = context.device();

        let image_create_info = vk::ImageCreateInfo::builder()
            .image_type(vk::ImageType::TYPE_2D)
            .extent(vk::Extent3D {
                width: extent.width,
                height: extent.height,
                depth: 1,
            })
            .mip_levels(1)
            .array_layers(1)
            .format(format)
            .tiling(vk::ImageTiling::OPTIMAL)
            .initial_layout(vk::ImageLayout::UNDEFINED)
            .usage(vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .samples(vk::SampleCountFlags::TYPE_1);

        let image = unsafe { device.create_image(&image_create_info, None).map_err(VulkanError::Api)? };
        let mut depth = Self {
            context: Arc::clone(context),
            image,
            memory: vk::DeviceMemory::null(),
            image_view: vk::ImageView::null(),
            format,
        };

        let memory_requirements = unsafe { device.get_image_memory_requirements(image) };
        let memory_type_index = context.memory_type_index(
            memory_requirements.memory_type_bits,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
            false,
        )?;

        let alloc_info = vk::MemoryAllocateInfo::builder()
            .allocation_size(memory_requirements.size)
            .memory_type_index(memory_type_index);

        depth.memory = unsafe { device.allocate_memory(&alloc_info, None).map_err(VulkanError::Api)? };
        unsafe { device.bind_image_memory(image, depth.memory, 0).map_err(VulkanError::Api)? };

        let image_view_create_info = vk::ImageViewCreateInfo::builder()
            .image(image)
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(format)
            .subresource_range(vk::ImageSubresourceRange {
                aspect_mask: depth_aspect(format),
                base_mip_level: 0,
                level_count: 1,
                base_array_layer: 0,
                layer_count: 1,
            });

        depth.image_view = unsafe {
            device
                .create_image_view(&image_view_create_info, None)
                .map_err(VulkanError::Api)?
        };
        context.set_object_name(depth.image, "depth-stencil");

        Ok(depth)
    }

    /// Get the image view handle
    pub fn image_view(&self) -> vk::ImageView {
        self.image_view
    }

    /// Depth format in use
    pub fn format(&self) -> vk::Format {
        self.format
    }
}

impl Drop for DepthBuffer {
    fn drop(&mut self) {
        let device = self.context.device();
        unsafe {
            if self.image_view != vk::ImageView::null() {
                device.destroy_image_view(self.image_view, None);
            }
            device.destroy_image(self.image, None);
            if self.memory != vk::DeviceMemory::null() {
                device.free_memory(self.memory, None);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use ash::vk::Handle;

    use super::*;

    #[test]
    fn test_attachment_order() {
        let color = vk::ImageView::from_raw(1);
        let depth = vk::ImageView::from_raw(2);
        assert_eq!(framebuffer_attachments(color, Some(depth)), vec![color, depth]);
        assert_eq!(framebuffer_attachments(color, None), vec![color]);
    }

    #[test]
    fn test_depth_views_cover_stencil() {
        assert_eq!(
            depth_aspect(vk::Format::D24_UNORM_S8_UINT),
            vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
        );
        assert_eq!(depth_aspect(vk::Format::D32_SFLOAT), vk::ImageAspectFlags::DEPTH);
    }
}

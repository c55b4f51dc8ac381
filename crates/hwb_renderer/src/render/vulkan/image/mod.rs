//! Image resources
//!
//! An [`ImageResource`] is built one of two ways: allocated device-local by
//! the renderer, or imported from an external hardware buffer. Both end up as
//! the same pieces (an image/view/memory triple, an optional sampler and YCbCr
//! conversion, and for imports the retained buffer) and share one teardown that
//! frees whatever subset was populated.

pub mod format;
pub mod layout;
pub mod sampler;

mod device_local;
mod import;
mod plan;

use std::sync::Arc;

use ash::{vk, Device};

use crate::render::vulkan::hardware_buffer::ExternalBuffer;
use crate::render::vulkan::{DeviceContext, VulkanError, VulkanResult};

pub use import::{check_dedicated_requirements, HardwareBufferProperties, ImportBackend};
pub use layout::{BarrierRecorder, CommandBufferBarriers, LayoutTransition};
pub use plan::ImagePlan;

use layout::transition_image_layout;

/// Requested shape and usage of an image
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageBasicInfo {
    /// Dimensionality
    pub image_type: vk::ImageType,
    /// Pixel format
    pub format: vk::Format,
    /// Number of mip levels
    pub mip_levels: u32,
    /// Layout the image should be in once created
    pub layout: vk::ImageLayout,
    /// Size in texels
    pub extent: vk::Extent3D,
    /// Number of array layers (6 makes a cube)
    pub array_layers: u32,
    /// Usage flags
    pub usage: vk::ImageUsageFlags,
    /// Whether samplers address texels directly instead of in [0, 1]
    pub unnormalized_coordinates: bool,
}

impl Default for ImageBasicInfo {
    fn default() -> Self {
        Self {
            image_type: vk::ImageType::TYPE_2D,
            format: vk::Format::R8G8B8A8_UNORM,
            mip_levels: 1,
            layout: vk::ImageLayout::UNDEFINED,
            extent: vk::Extent3D::default(),
            array_layers: 1,
            usage: vk::ImageUsageFlags::SAMPLED,
            unnormalized_coordinates: false,
        }
    }
}

impl ImageBasicInfo {
    /// Set the pixel format
    pub fn with_format(mut self, format: vk::Format) -> Self {
        self.format = format;
        self
    }

    /// Set a 2D extent
    pub fn with_extent(mut self, width: u32, height: u32) -> Self {
        self.extent = vk::Extent3D { width, height, depth: 1 };
        self
    }

    /// Set the target layout
    pub fn with_layout(mut self, layout: vk::ImageLayout) -> Self {
        self.layout = layout;
        self
    }

    /// Set usage flags
    pub fn with_usage(mut self, usage: vk::ImageUsageFlags) -> Self {
        self.usage = usage;
        self
    }

    /// Set the number of mip levels
    pub fn with_mip_levels(mut self, mip_levels: u32) -> Self {
        self.mip_levels = mip_levels;
        self
    }

    /// Set the number of array layers
    pub fn with_array_layers(mut self, array_layers: u32) -> Self {
        self.array_layers = array_layers;
        self
    }

    /// Set the image type
    pub fn with_image_type(mut self, image_type: vk::ImageType) -> Self {
        self.image_type = image_type;
        self
    }

    /// Use unnormalized sampler coordinates
    pub fn with_unnormalized_coordinates(mut self, unnormalized: bool) -> Self {
        self.unnormalized_coordinates = unnormalized;
        self
    }
}

/// Image, view and backing memory that are replaced together
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageContent {
    /// Image handle
    pub image: vk::Image,
    /// View handle, null until created
    pub view: vk::ImageView,
    /// One allocation, or one per plane for disjoint images
    pub memories: Vec<vk::DeviceMemory>,
}

impl ImageContent {
    /// Content with only the image created so far
    pub fn new(image: vk::Image) -> Self {
        Self {
            image,
            view: vk::ImageView::null(),
            memories: Vec::new(),
        }
    }
}

/// Sampler and conversion, created once per resource
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Sampling {
    /// Sampler, immutable in descriptor layouts for YCbCr images
    pub sampler: Option<vk::Sampler>,
    /// YCbCr conversion for planar and external formats
    pub conversion: Option<vk::SamplerYcbcrConversion>,
}

/// Device-facing operations shared by both construction paths
pub trait ImageBackend {
    /// Record and submit a layout transition for `image`
    fn transition(
        &self,
        image: vk::Image,
        subresource_range: vk::ImageSubresourceRange,
        recorded_layout: &mut vk::ImageLayout,
        transition: LayoutTransition,
    ) -> VulkanResult<()>;

    /// Destroy view, image and memory, skipping null handles
    fn destroy_content(&self, content: ImageContent);

    /// Destroy sampler and conversion if present
    fn destroy_sampling(&self, sampling: Sampling);
}

/// Everything an image resource owns, independent of the device
pub(crate) struct ImageState {
    pub(crate) info: ImageBasicInfo,
    pub(crate) layout: vk::ImageLayout,
    pub(crate) content: Option<ImageContent>,
    pub(crate) sampling: Sampling,
    pub(crate) external: Option<Arc<dyn ExternalBuffer>>,
}

impl ImageState {
    pub(crate) fn new(info: ImageBasicInfo) -> Self {
        Self {
            info,
            layout: vk::ImageLayout::UNDEFINED,
            content: None,
            sampling: Sampling::default(),
            external: None,
        }
    }
}

/// Free everything `state` holds: view, image, memory, sampler, conversion, buffer
pub(crate) fn release_state<B: ImageBackend>(backend: &B, state: &mut ImageState) {
    if let Some(content) = state.content.take() {
        backend.destroy_content(content);
    }
    backend.destroy_sampling(std::mem::take(&mut state.sampling));
    state.external = None;
}

/// [`ImageBackend`] that talks to the real device
pub(crate) struct DeviceImageBackend<'a> {
    pub(crate) context: &'a DeviceContext,
    pub(crate) queue: vk::Queue,
}

impl<'a> DeviceImageBackend<'a> {
    pub(crate) fn new(context: &'a DeviceContext, queue: vk::Queue) -> Self {
        Self { context, queue }
    }

    pub(crate) fn device(&self) -> &Device {
        self.context.device()
    }
}

impl ImageBackend for DeviceImageBackend<'_> {
    fn transition(
        &self,
        image: vk::Image,
        subresource_range: vk::ImageSubresourceRange,
        recorded_layout: &mut vk::ImageLayout,
        transition: LayoutTransition,
    ) -> VulkanResult<()> {
        let command_buffer = self.context.begin_single_time_command()?;
        let mut recorder = CommandBufferBarriers::new(self.device(), command_buffer);
        transition_image_layout(&mut recorder, image, subresource_range, recorded_layout, transition);
        self.context
            .end_and_submit_single_time_command(command_buffer, self.queue, true)
    }

    fn destroy_content(&self, content: ImageContent) {
        let device = self.device();
        unsafe {
            if content.view != vk::ImageView::null() {
                device.destroy_image_view(content.view, None);
            }
            if content.image != vk::Image::null() {
                device.destroy_image(content.image, None);
            }
            for memory in content.memories {
                device.free_memory(memory, None);
            }
        }
    }

    fn destroy_sampling(&self, sampling: Sampling) {
        let device = self.device();
        unsafe {
            if let Some(sampler) = sampling.sampler {
                device.destroy_sampler(sampler, None);
            }
            if let Some(conversion) = sampling.conversion {
                device.destroy_sampler_ycbcr_conversion(conversion, None);
            }
        }
    }
}

/// GPU image with its view, optional sampler and optional YCbCr conversion
pub struct ImageResource {
    context: Arc<DeviceContext>,
    queue: vk::Queue,
    state: ImageState,
}

impl ImageResource {
    fn empty(context: &Arc<DeviceContext>, queue: vk::Queue, info: ImageBasicInfo) -> Self {
        Self {
            context: Arc::clone(context),
            queue,
            state: ImageState::new(info),
        }
    }

    /// Record a layout transition into `command_buffer`
    ///
    /// A no-op when the target layout is UNDEFINED or PREINITIALIZED.
    pub fn set_image_layout(&mut self, command_buffer: vk::CommandBuffer, transition: LayoutTransition) -> VulkanResult<()> {
        let image = self.image()?;
        let range = layout::color_range(self.state.info.mip_levels, self.state.info.array_layers);
        let mut recorder = CommandBufferBarriers::new(self.context.device(), command_buffer);
        transition_image_layout(&mut recorder, image, range, &mut self.state.layout, transition);
        Ok(())
    }

    /// Descriptor for a combined image sampler binding
    pub fn descriptor(&self) -> vk::DescriptorImageInfo {
        vk::DescriptorImageInfo {
            sampler: self.state.sampling.sampler.unwrap_or_default(),
            image_view: self
                .state
                .content
                .as_ref()
                .map_or_else(vk::ImageView::null, |content| content.view),
            image_layout: self.state.layout,
        }
    }

    /// Image handle
    pub fn image(&self) -> VulkanResult<vk::Image> {
        self.state
            .content
            .as_ref()
            .map(|content| content.image)
            .ok_or_else(|| VulkanError::InvalidState {
                operation: "use image",
                state: "no content".to_string(),
            })
    }

    /// View handle
    pub fn view(&self) -> Option<vk::ImageView> {
        self.state.content.as_ref().map(|content| content.view)
    }

    /// Sampler, if the image is sampled
    pub fn sampler(&self) -> Option<vk::Sampler> {
        self.state.sampling.sampler
    }

    /// YCbCr conversion, if any
    pub fn conversion(&self) -> Option<vk::SamplerYcbcrConversion> {
        self.state.sampling.conversion
    }

    /// Number of memory allocations backing the image
    pub fn memory_count(&self) -> usize {
        self.state.content.as_ref().map_or(0, |content| content.memories.len())
    }

    /// Current recorded layout
    pub fn layout(&self) -> vk::ImageLayout {
        self.state.layout
    }

    /// Format; UNDEFINED for driver-private imported formats
    pub fn format(&self) -> vk::Format {
        self.state.info.format
    }

    /// Extent in texels
    pub fn extent(&self) -> vk::Extent3D {
        self.state.info.extent
    }

    /// Width in texels
    pub fn width(&self) -> u32 {
        self.state.info.extent.width
    }

    /// Height in texels
    pub fn height(&self) -> u32 {
        self.state.info.extent.height
    }

    /// Hardware buffer this image currently shows, if imported
    pub fn hardware_buffer(&self) -> Option<&Arc<dyn ExternalBuffer>> {
        self.state.external.as_ref()
    }
}

impl Drop for ImageResource {
    fn drop(&mut self) {
        let backend = DeviceImageBackend::new(&self.context, self.queue);
        release_state(&backend, &mut self.state);
    }
}

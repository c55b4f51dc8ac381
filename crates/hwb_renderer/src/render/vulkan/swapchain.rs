//! Vulkan swapchain management
//!
//! Negotiation is a pure function of the surface capabilities so it can be
//! checked without a device. Recreation hands the old swapchain to the driver,
//! and destroys the old views and the old swapchain only once the new one
//! exists.

use std::sync::Arc;

use ash::extensions::khr::Swapchain as SwapchainLoader;
use ash::{prelude::VkResult, vk};
use raw_window_handle::{HasRawDisplayHandle, HasRawWindowHandle};

use crate::render::vulkan::surface::Surface;
use crate::render::vulkan::{DeviceContext, VulkanError, VulkanResult};

/// Negotiated swapchain parameters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SwapchainSettings {
    /// Minimum number of images requested from the driver
    pub image_count: u32,
    /// Presentation mode
    pub present_mode: vk::PresentModeKHR,
    /// Transform applied by the compositor
    pub pre_transform: vk::SurfaceTransformFlagsKHR,
    /// Alpha compositing mode
    pub composite_alpha: vk::CompositeAlphaFlagsKHR,
    /// Image usage
    pub usage: vk::ImageUsageFlags,
    /// Image size
    pub extent: vk::Extent2D,
}

/// FIFO when vsync is requested, else the lowest-latency reported mode
pub fn choose_present_mode(modes: &[vk::PresentModeKHR], vsync: bool) -> vk::PresentModeKHR {
    if vsync {
        return vk::PresentModeKHR::FIFO;
    }
    [vk::PresentModeKHR::MAILBOX, vk::PresentModeKHR::IMMEDIATE]
        .into_iter()
        .find(|mode| modes.contains(mode))
        .unwrap_or(vk::PresentModeKHR::FIFO)
}

/// One more than the minimum, capped by the maximum when there is one
pub fn choose_image_count(caps: &vk::SurfaceCapabilitiesKHR) -> u32 {
    let desired = caps.min_image_count + 1;
    if caps.max_image_count > 0 {
        desired.min(caps.max_image_count)
    } else {
        desired
    }
}

/// IDENTITY when supported, else whatever the surface currently uses
pub fn choose_pre_transform(caps: &vk::SurfaceCapabilitiesKHR) -> vk::SurfaceTransformFlagsKHR {
    if caps
        .supported_transforms
        .contains(vk::SurfaceTransformFlagsKHR::IDENTITY)
    {
        vk::SurfaceTransformFlagsKHR::IDENTITY
    } else {
        caps.current_transform
    }
}

/// First supported of OPAQUE, PRE_MULTIPLIED, POST_MULTIPLIED, INHERIT
pub fn choose_composite_alpha(caps: &vk::SurfaceCapabilitiesKHR) -> vk::CompositeAlphaFlagsKHR {
    [
        vk::CompositeAlphaFlagsKHR::OPAQUE,
        vk::CompositeAlphaFlagsKHR::PRE_MULTIPLIED,
        vk::CompositeAlphaFlagsKHR::POST_MULTIPLIED,
        vk::CompositeAlphaFlagsKHR::INHERIT,
    ]
    .into_iter()
    .find(|&flag| caps.supported_composite_alpha.contains(flag))
    .unwrap_or(vk::CompositeAlphaFlagsKHR::OPAQUE)
}

/// Color attachment, plus transfer source/destination when supported
pub fn choose_usage(caps: &vk::SurfaceCapabilitiesKHR) -> vk::ImageUsageFlags {
    let mut usage = vk::ImageUsageFlags::COLOR_ATTACHMENT;
    for extra in [vk::ImageUsageFlags::TRANSFER_SRC, vk::ImageUsageFlags::TRANSFER_DST] {
        if caps.supported_usage_flags.contains(extra) {
            usage |= extra;
        }
    }
    usage
}

/// Surface extent, or the window size clamped to the limits when undefined
pub fn choose_extent(caps: &vk::SurfaceCapabilitiesKHR, width: u32, height: u32) -> vk::Extent2D {
    if caps.current_extent.width != u32::MAX {
        return caps.current_extent;
    }
    vk::Extent2D {
        width: width.clamp(caps.min_image_extent.width, caps.max_image_extent.width),
        height: height.clamp(caps.min_image_extent.height, caps.max_image_extent.height),
    }
}

impl SwapchainSettings {
    /// Negotiate every parameter against the surface
    pub fn negotiate(
        caps: &vk::SurfaceCapabilitiesKHR,
        present_modes: &[vk::PresentModeKHR],
        width: u32,
        height: u32,
        vsync: bool,
    ) -> VulkanResult<Self> {
        let extent = choose_extent(caps, width, height);
        if extent.width == 0 || extent.height == 0 {
            return Err(VulkanError::InvalidOperation {
                reason: format!("swapchain extent {}x{} is empty", extent.width, extent.height),
            });
        }

        Ok(Self {
            image_count: choose_image_count(caps),
            present_mode: choose_present_mode(present_modes, vsync),
            pre_transform: choose_pre_transform(caps),
            composite_alpha: choose_composite_alpha(caps),
            usage: choose_usage(caps),
            extent,
        })
    }
}

/// Map an acquire result; SUBOPTIMAL still yields an index
pub fn acquire_result(result: VkResult<(u32, bool)>, timeout_ns: u64) -> VulkanResult<u32> {
    match result {
        Ok((index, suboptimal)) => {
            if suboptimal {
                log::debug!("Swapchain suboptimal on acquire");
            }
            Ok(index)
        }
        Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Err(VulkanError::SwapchainOutOfDate),
        Err(vk::Result::TIMEOUT | vk::Result::NOT_READY) => Err(VulkanError::Timeout {
            what: "swapchain image",
            timeout_ns,
        }),
        Err(err) => Err(VulkanError::Api(err)),
    }
}

/// Map a present result; SUBOPTIMAL is success
pub fn present_result(result: VkResult<bool>) -> VulkanResult<()> {
    match result {
        Ok(suboptimal) => {
            if suboptimal {
                log::debug!("Swapchain suboptimal on present");
            }
            Ok(())
        }
        Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Err(VulkanError::SwapchainOutOfDate),
        Err(err) => Err(VulkanError::Api(err)),
    }
}

/// One presentable image with its view
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwapchainBuffer {
    /// Image owned by the swapchain
    pub image: vk::Image,
    /// View owned by us
    pub view: vk::ImageView,
}

/// Device operations used to (re)build a swapchain
pub trait SwapchainBackend {
    /// Current surface capabilities
    fn surface_capabilities(&self) -> VulkanResult<vk::SurfaceCapabilitiesKHR>;

    /// Present modes the surface supports
    fn present_modes(&self) -> VulkanResult<Vec<vk::PresentModeKHR>>;

    /// Create a swapchain, retiring `old` when it is not null
    fn create_swapchain(
        &self,
        settings: &SwapchainSettings,
        format: vk::SurfaceFormatKHR,
        old: vk::SwapchainKHR,
    ) -> VulkanResult<vk::SwapchainKHR>;

    /// Images owned by `swapchain`
    fn swapchain_images(&self, swapchain: vk::SwapchainKHR) -> VulkanResult<Vec<vk::Image>>;

    /// 2D color view with RGBA identity swizzle
    fn create_view(&self, image: vk::Image, format: vk::Format) -> VulkanResult<vk::ImageView>;

    /// Destroy a view
    fn destroy_view(&self, view: vk::ImageView);

    /// Destroy a swapchain
    fn destroy_swapchain(&self, swapchain: vk::SwapchainKHR);
}

/// Swapchain handle and the ordered image/view ring
#[derive(Debug, Default)]
pub struct SwapchainState {
    /// Current swapchain, null before the first build
    pub handle: vk::SwapchainKHR,
    /// Images in presentation-engine order
    pub buffers: Vec<SwapchainBuffer>,
    /// Parameters the current swapchain was built with
    pub settings: SwapchainSettings,
}

/// Build or rebuild `state` for a `width` x `height` window
pub fn rebuild_swapchain<B: SwapchainBackend>(
    backend: &B,
    state: &mut SwapchainState,
    format: vk::SurfaceFormatKHR,
    width: u32,
    height: u32,
    vsync: bool,
) -> VulkanResult<()> {
    let caps = backend.surface_capabilities()?;
    let present_modes = backend.present_modes()?;
    let settings = SwapchainSettings::negotiate(&caps, &present_modes, width, height, vsync)?;

    let old = state.handle;
    let swapchain = backend.create_swapchain(&settings, format, old)?;

    for buffer in state.buffers.drain(..) {
        backend.destroy_view(buffer.view);
    }
    if old != vk::SwapchainKHR::null() {
        backend.destroy_swapchain(old);
    }
    state.handle = swapchain;
    state.settings = settings;

    for image in backend.swapchain_images(swapchain)? {
        let view = backend.create_view(image, format.format)?;
        state.buffers.push(SwapchainBuffer { image, view });
    }

    log::info!(
        "Swapchain {}x{}: {} images, {:?}, transform {:?}",
        settings.extent.width,
        settings.extent.height,
        state.buffers.len(),
        settings.present_mode,
        settings.pre_transform
    );
    Ok(())
}

/// Destroy views and swapchain
pub fn release_swapchain<B: SwapchainBackend>(backend: &B, state: &mut SwapchainState) {
    for buffer in state.buffers.drain(..) {
        backend.destroy_view(buffer.view);
    }
    if state.handle != vk::SwapchainKHR::null() {
        backend.destroy_swapchain(state.handle);
        state.handle = vk::SwapchainKHR::null();
    }
}

struct DeviceSwapchainBackend<'a> {
    context: &'a DeviceContext,
    surface: &'a Surface,
    loader: &'a SwapchainLoader,
}

impl SwapchainBackend for DeviceSwapchainBackend<'_> {
    fn surface_capabilities(&self) -> VulkanResult<vk::SurfaceCapabilitiesKHR> {
        self.surface.capabilities(self.context.physical_device().device)
    }

    fn present_modes(&self) -> VulkanResult<Vec<vk::PresentModeKHR>> {
        self.surface.present_modes(self.context.physical_device().device)
    }

    fn create_swapchain(
        &self,
        settings: &SwapchainSettings,
        format: vk::SurfaceFormatKHR,
        old: vk::SwapchainKHR,
    ) -> VulkanResult<vk::SwapchainKHR> {
        let swapchain_create_info = vk::SwapchainCreateInfoKHR::builder()
            .surface(self.surface.handle())
            .min_image_count(settings.image_count)
            .image_format(format.format)
            .image_color_space(format.color_space)
            .image_extent(settings.extent)
            .image_array_layers(1)
            .image_usage(settings.usage)
            .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
            .pre_transform(settings.pre_transform)
            .composite_alpha(settings.composite_alpha)
            .present_mode(settings.present_mode)
            .clipped(true)
            .old_swapchain(old);

        unsafe {
            self.loader
                .create_swapchain(&swapchain_create_info, None)
                .map_err(VulkanError::Api)
        }
    }

    fn swapchain_images(&self, swapchain: vk::SwapchainKHR) -> VulkanResult<Vec<vk::Image>> {
        unsafe { self.loader.get_swapchain_images(swapchain).map_err(VulkanError::Api) }
    }

    fn create_view(&self, image: vk::Image, format: vk::Format) -> VulkanResult<vk::ImageView> {
        let create_info = vk::ImageViewCreateInfo::builder()
            .image(image)
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(format)
            .components(vk::ComponentMapping {
                r: vk::ComponentSwizzle::R,
                g: vk::ComponentSwizzle::G,
                b: vk::ComponentSwizzle::B,
                a: vk::ComponentSwizzle::A,
            })
            .subresource_range(vk::ImageSubresourceRange {
                aspect_mask: vk::ImageAspectFlags::COLOR,
                base_mip_level: 0,
                level_count: 1,
                base_array_layer: 0,
                layer_count: 1,
            });

        let view = unsafe {
            self.context
                .device()
                .create_image_view(&create_info, None)
                .map_err(VulkanError::Api)?
        };
        self.context.set_object_name(view, "swapchain-view");
        Ok(view)
    }

    fn destroy_view(&self, view: vk::ImageView) {
        unsafe { self.context.device().destroy_image_view(view, None) };
    }

    fn destroy_swapchain(&self, swapchain: vk::SwapchainKHR) {
        unsafe { self.loader.destroy_swapchain(swapchain, None) };
    }
}

/// Window surface plus its swapchain
pub struct PresentationSurface {
    state: SwapchainState,
    format: vk::SurfaceFormatKHR,
    loader: SwapchainLoader,
    surface: Surface,
    context: Arc<DeviceContext>,
}

impl PresentationSurface {
    /// Create the surface for `window` and negotiate queue family and format
    ///
    /// No swapchain exists until [`create`](Self::create) is called.
    pub fn init_surface<W>(context: &Arc<DeviceContext>, window: &W) -> VulkanResult<Self>
    where
        W: HasRawWindowHandle + HasRawDisplayHandle,
    {
        let surface = Surface::new(context, window)?;
        let format = surface.negotiate(context)?;
        let loader = SwapchainLoader::new(context.instance(), context.device());

        Ok(Self {
            state: SwapchainState::default(),
            format,
            loader,
            surface,
            context: Arc::clone(context),
        })
    }

    /// Create the swapchain, or recreate it for a new size
    pub fn create(&mut self, width: u32, height: u32, vsync: bool) -> VulkanResult<()> {
        let backend = DeviceSwapchainBackend {
            context: &self.context,
            surface: &self.surface,
            loader: &self.loader,
        };
        rebuild_swapchain(&backend, &mut self.state, self.format, width, height, vsync)
    }

    /// Acquire the next image, signalling `semaphore` when it is ready
    pub fn acquire_next_image(&self, semaphore: vk::Semaphore, timeout_ns: u64) -> VulkanResult<u32> {
        self.require_swapchain("acquire swapchain image")?;
        let result = unsafe {
            self.loader
                .acquire_next_image(self.state.handle, timeout_ns, semaphore, vk::Fence::null())
        };
        acquire_result(result, timeout_ns)
    }

    /// Queue image `index` for presentation once `wait_semaphore` signals
    pub fn queue_present(&self, queue: vk::Queue, index: u32, wait_semaphore: vk::Semaphore) -> VulkanResult<()> {
        self.require_swapchain("present")?;
        let swapchains = [self.state.handle];
        let indices = [index];
        let wait_semaphores = [wait_semaphore];
        let present_info = vk::PresentInfoKHR::builder()
            .wait_semaphores(&wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&indices);

        present_result(unsafe { self.loader.queue_present(queue, &present_info) })
    }

    fn require_swapchain(&self, operation: &'static str) -> VulkanResult<()> {
        if self.state.handle == vk::SwapchainKHR::null() {
            return Err(VulkanError::InvalidState {
                operation,
                state: "no swapchain has been created".to_string(),
            });
        }
        Ok(())
    }

    /// Negotiated surface format
    pub fn format(&self) -> vk::SurfaceFormatKHR {
        self.format
    }

    /// Current swapchain extent
    pub fn extent(&self) -> vk::Extent2D {
        self.state.settings.extent
    }

    /// Current present mode
    pub fn present_mode(&self) -> vk::PresentModeKHR {
        self.state.settings.present_mode
    }

    /// Image/view pairs in presentation order
    pub fn buffers(&self) -> &[SwapchainBuffer] {
        &self.state.buffers
    }

    /// Number of swapchain images
    pub fn image_count(&self) -> usize {
        self.state.buffers.len()
    }

    /// Swapchain handle
    pub fn handle(&self) -> vk::SwapchainKHR {
        self.state.handle
    }
}

impl Drop for PresentationSurface {
    fn drop(&mut self) {
        let backend = DeviceSwapchainBackend {
            context: &self.context,
            surface: &self.surface,
            loader: &self.loader,
        };
        release_swapchain(&backend, &mut self.state);
        // The surface is destroyed when its field drops
    }
}

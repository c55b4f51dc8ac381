//! Hardware buffer import
//!
//! The sampler and YCbCr conversion are created once from the first buffer.
//! Every later buffer only replaces the image, view and memory; the sampler
//! stays valid because it is baked into descriptor set layouts as an
//! immutable sampler.

use std::sync::Arc;

use ash::vk;

use super::layout::{color_range, LayoutTransition};
use super::sampler::{hardware_buffer_sampler_info, ConversionParams};
use super::{DeviceImageBackend, ImageBackend, ImageBasicInfo, ImageContent, ImageResource, ImageState, Sampling};
use crate::render::vulkan::hardware_buffer::{ExternalBuffer, HardwareBufferDesc};
use crate::render::vulkan::{DeviceContext, ImportError, VulkanError, VulkanResult};

/// Import properties the driver reports for one hardware buffer
#[derive(Debug, Clone, Copy)]
pub struct HardwareBufferProperties {
    /// Size of the dedicated allocation
    pub allocation_size: vk::DeviceSize,
    /// Memory types the buffer may be imported into
    pub memory_type_bits: u32,
    /// Image format, UNDEFINED for driver-private formats
    pub format: vk::Format,
    /// Suggested conversion
    pub conversion: ConversionParams,
}

/// Imported memory must be a dedicated allocation
///
/// Fails only when the driver neither prefers nor requires one.
pub fn check_dedicated_requirements(prefers: bool, requires: bool) -> Result<(), ImportError> {
    if prefers || requires {
        Ok(())
    } else {
        Err(ImportError::Unsupported(
            "driver does not support a dedicated allocation for this buffer".to_string(),
        ))
    }
}

/// Device operations specific to hardware buffer import
pub trait ImportBackend: ImageBackend {
    /// Query allocation size, memory types, format and suggested conversion
    fn query_hardware_buffer(&self, buffer: &dyn ExternalBuffer) -> VulkanResult<HardwareBufferProperties>;

    /// Create the YCbCr conversion and the immutable sampler that uses it
    fn create_sampling(&self, conversion: &ConversionParams) -> VulkanResult<Sampling>;

    /// Create an image over the buffer's memory plus a view through `sampling`
    ///
    /// On error nothing created by this call is left alive.
    fn create_imported_content(
        &self,
        buffer: &dyn ExternalBuffer,
        desc: &HardwareBufferDesc,
        properties: &HardwareBufferProperties,
        sampling: &Sampling,
    ) -> VulkanResult<ImageContent>;
}

/// First import: sampling objects, then content
pub(crate) fn import_initial<B: ImportBackend>(
    backend: &B,
    state: &mut ImageState,
    buffer: Arc<dyn ExternalBuffer>,
) -> VulkanResult<()> {
    check_desc(&buffer.describe())?;
    let properties = backend.query_hardware_buffer(buffer.as_ref())?;
    state.sampling = backend.create_sampling(&properties.conversion)?;
    import_content(backend, state, buffer)
}

/// Replace image, view and memory with ones backed by `buffer`
///
/// The previous triple is destroyed before the new one is created, so the
/// caller must make sure no in-flight work still references it.
pub(crate) fn import_content<B: ImportBackend>(
    backend: &B,
    state: &mut ImageState,
    buffer: Arc<dyn ExternalBuffer>,
) -> VulkanResult<()> {
    let desc = buffer.describe();
    check_desc(&desc)?;
    let properties = backend.query_hardware_buffer(buffer.as_ref())?;

    if let Some(previous) = state.content.take() {
        backend.destroy_content(previous);
    }
    state.external = None;
    state.layout = vk::ImageLayout::UNDEFINED;
    state.info.extent = vk::Extent3D {
        width: desc.width,
        height: desc.height,
        depth: 1,
    };
    state.info.array_layers = desc.layers;
    state.info.mip_levels = 1;
    state.info.format = properties.format;

    let content = backend.create_imported_content(buffer.as_ref(), &desc, &properties, &state.sampling)?;
    let image = content.image;
    state.content = Some(content);
    state.external = Some(buffer);

    let target = state.info.layout;
    if target != vk::ImageLayout::UNDEFINED && target != vk::ImageLayout::PREINITIALIZED {
        backend.transition(
            image,
            color_range(1, desc.layers),
            &mut state.layout,
            LayoutTransition::to(target).from_layout(vk::ImageLayout::UNDEFINED),
        )?;
    }
    Ok(())
}

fn check_desc(desc: &HardwareBufferDesc) -> Result<(), ImportError> {
    if desc.is_empty() {
        return Err(ImportError::Unsupported(format!(
            "hardware buffer {}x{}x{} has no pixels",
            desc.width, desc.height, desc.layers
        )));
    }
    Ok(())
}

impl ImportBackend for DeviceImageBackend<'_> {
    fn query_hardware_buffer(&self, buffer: &dyn ExternalBuffer) -> VulkanResult<HardwareBufferProperties> {
        let mut format_properties = vk::AndroidHardwareBufferFormatPropertiesANDROID::default();
        let mut properties = vk::AndroidHardwareBufferPropertiesANDROID::builder()
            .push_next(&mut format_properties)
            .build();

        unsafe { self.context.hardware_buffer_properties(buffer.as_raw(), &mut properties)? };

        if properties.allocation_size == 0 {
            return Err(ImportError::Unsupported("driver reported a zero-sized allocation".to_string()).into());
        }

        log::debug!(
            "Hardware buffer properties: size={}, memory_type_bits={:#x}, format={:?}, external_format={:#x}",
            properties.allocation_size,
            properties.memory_type_bits,
            format_properties.format,
            format_properties.external_format
        );

        Ok(HardwareBufferProperties {
            allocation_size: properties.allocation_size,
            memory_type_bits: properties.memory_type_bits,
            format: format_properties.format,
            conversion: ConversionParams::from_hardware_buffer(&format_properties),
        })
    }

    fn create_sampling(&self, conversion: &ConversionParams) -> VulkanResult<Sampling> {
        let device = self.device();

        let external_format = conversion.external_format.map(|external_format| vk::ExternalFormatANDROID {
            external_format,
            ..Default::default()
        });
        let mut conversion_info = conversion.create_info();
        if let Some(external_format) = external_format.as_ref() {
            conversion_info.p_next = (external_format as *const vk::ExternalFormatANDROID).cast();
        }

        let ycbcr_conversion = unsafe {
            device
                .create_sampler_ycbcr_conversion(&conversion_info, None)
                .map_err(|err| ImportError::from_result("vkCreateSamplerYcbcrConversion", err))?
        };

        let sampler_conversion = vk::SamplerYcbcrConversionInfo::builder()
            .conversion(ycbcr_conversion)
            .build();
        let mut sampler_info = hardware_buffer_sampler_info();
        sampler_info.p_next = (&sampler_conversion as *const vk::SamplerYcbcrConversionInfo).cast();

        let sampler = match unsafe { device.create_sampler(&sampler_info, None) } {
            Ok(sampler) => sampler,
            Err(err) => {
                unsafe { device.destroy_sampler_ycbcr_conversion(ycbcr_conversion, None) };
                return Err(ImportError::from_result("vkCreateSampler", err).into());
            }
        };
        self.context.set_object_name(sampler, "hardware-buffer-sampler");
        self.context.set_object_name(ycbcr_conversion, "hardware-buffer-conversion");

        Ok(Sampling {
            sampler: Some(sampler),
            conversion: Some(ycbcr_conversion),
        })
    }

    fn create_imported_content(
        &self,
        buffer: &dyn ExternalBuffer,
        desc: &HardwareBufferDesc,
        properties: &HardwareBufferProperties,
        sampling: &Sampling,
    ) -> VulkanResult<ImageContent> {
        let conversion = sampling.conversion.ok_or_else(|| VulkanError::InvalidState {
            operation: "import hardware buffer",
            state: "no YCbCr conversion".to_string(),
        })?;

        let mut external_memory = vk::ExternalMemoryImageCreateInfo::builder()
            .handle_types(vk::ExternalMemoryHandleTypeFlags::ANDROID_HARDWARE_BUFFER_ANDROID)
            .build();
        let mut external_format = vk::ExternalFormatANDROID {
            external_format: properties.conversion.external_format.unwrap_or(0),
            ..Default::default()
        };

        let image_info = vk::ImageCreateInfo::builder()
            .push_next(&mut external_memory)
            .push_next(&mut external_format)
            .image_type(vk::ImageType::TYPE_2D)
            .format(properties.format)
            .extent(vk::Extent3D {
                width: desc.width,
                height: desc.height,
                depth: 1,
            })
            .mip_levels(1)
            .array_layers(desc.layers)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(vk::ImageUsageFlags::SAMPLED)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);

        let image = unsafe {
            self.device()
                .create_image(&image_info, None)
                .map_err(|err| ImportError::from_result("vkCreateImage", err))?
        };
        self.context.set_object_name(image, "hardware-buffer-image");

        let mut content = ImageContent::new(image);
        if let Err(err) = self.bind_and_view(buffer, properties, conversion, &mut content) {
            self.destroy_content(content);
            return Err(err);
        }
        Ok(content)
    }
}

impl DeviceImageBackend<'_> {
    fn bind_and_view(
        &self,
        buffer: &dyn ExternalBuffer,
        properties: &HardwareBufferProperties,
        conversion: vk::SamplerYcbcrConversion,
        content: &mut ImageContent,
    ) -> VulkanResult<()> {
        let device = self.device();

        let memory_type_index = self.context.memory_type_index(
            properties.memory_type_bits,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
            true,
        )?;

        let mut import_info = vk::ImportAndroidHardwareBufferInfoANDROID {
            buffer: buffer.as_raw().cast(),
            ..Default::default()
        };
        let mut dedicated_info = vk::MemoryDedicatedAllocateInfo::builder().image(content.image).build();
        let allocate_info = vk::MemoryAllocateInfo::builder()
            .push_next(&mut import_info)
            .push_next(&mut dedicated_info)
            .allocation_size(properties.allocation_size)
            .memory_type_index(memory_type_index);

        let memory = unsafe {
            device
                .allocate_memory(&allocate_info, None)
                .map_err(|err| ImportError::from_result("vkAllocateMemory", err))?
        };
        content.memories.push(memory);
        self.context.set_object_name(memory, "hardware-buffer-memory");

        let bind_info = vk::BindImageMemoryInfo::builder()
            .image(content.image)
            .memory(memory)
            .memory_offset(0)
            .build();
        unsafe {
            device
                .bind_image_memory2(&[bind_info])
                .map_err(|err| ImportError::from_result("vkBindImageMemory2", err))?;
        }

        let mut dedicated_requirements = vk::MemoryDedicatedRequirements::default();
        let mut requirements = vk::MemoryRequirements2::builder()
            .push_next(&mut dedicated_requirements)
            .build();
        let requirements_info = vk::ImageMemoryRequirementsInfo2::builder().image(content.image);
        unsafe { device.get_image_memory_requirements2(&requirements_info, &mut requirements) };
        check_dedicated_requirements(
            dedicated_requirements.prefers_dedicated_allocation == vk::TRUE,
            dedicated_requirements.requires_dedicated_allocation == vk::TRUE,
        )?;

        let conversion_info = vk::SamplerYcbcrConversionInfo::builder().conversion(conversion).build();
        let mut view_info = vk::ImageViewCreateInfo::builder()
            .image(content.image)
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(properties.format)
            .components(vk::ComponentMapping::default())
            .subresource_range(color_range(1, 1))
            .build();
        view_info.p_next = (&conversion_info as *const vk::SamplerYcbcrConversionInfo).cast();

        content.view = unsafe {
            device
                .create_image_view(&view_info, None)
                .map_err(|err| ImportError::from_result("vkCreateImageView", err))?
        };
        Ok(())
    }
}

impl ImageResource {
    /// Import an external hardware buffer as a sampled image
    ///
    /// Builds the YCbCr conversion and immutable sampler from the buffer's
    /// reported properties, then imports the buffer's memory. The resource
    /// keeps its own reference to `buffer` until the content is replaced or
    /// the resource is dropped.
    pub fn create_from_hardware_buffer(
        context: &Arc<DeviceContext>,
        queue: vk::Queue,
        buffer: Arc<dyn ExternalBuffer>,
        info: ImageBasicInfo,
    ) -> VulkanResult<Self> {
        let mut resource = Self::empty(context, queue, info);
        let backend = DeviceImageBackend::new(context, queue);
        import_initial(&backend, &mut resource.state, buffer)?;

        log::info!(
            "Imported hardware buffer {}x{} as {:?}",
            resource.width(),
            resource.height(),
            resource.format()
        );
        Ok(resource)
    }

    /// Point the image at a new hardware buffer
    ///
    /// Sampler and conversion are kept; image, view and memory are replaced.
    /// The device must be idle with respect to the previous content.
    pub fn set_content_from_hardware_buffer(&mut self, buffer: Arc<dyn ExternalBuffer>) -> VulkanResult<()> {
        let backend = DeviceImageBackend::new(&self.context, self.queue);
        import_content(&backend, &mut self.state, buffer)
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use ash::vk::Handle;

    use super::*;
    use crate::render::vulkan::hardware_buffer::testing::FakeHardwareBuffer;
    use crate::render::vulkan::hardware_buffer::{formats, HardwareBufferDesc};
    use crate::render::vulkan::image::release_state;
    use crate::render::vulkan::image::testing::FakeImageBackend;

    #[derive(Default)]
    struct FakeImport {
        base: FakeImageBackend,
        fail_content: Cell<bool>,
    }

    impl ImageBackend for FakeImport {
        fn transition(
            &self,
            image: vk::Image,
            subresource_range: vk::ImageSubresourceRange,
            recorded_layout: &mut vk::ImageLayout,
            transition: LayoutTransition,
        ) -> VulkanResult<()> {
            self.base.transition(image, subresource_range, recorded_layout, transition)
        }

        fn destroy_content(&self, content: ImageContent) {
            self.base.destroy_content(content);
        }

        fn destroy_sampling(&self, sampling: Sampling) {
            self.base.destroy_sampling(sampling);
        }
    }

    impl ImportBackend for FakeImport {
        fn query_hardware_buffer(&self, buffer: &dyn ExternalBuffer) -> VulkanResult<HardwareBufferProperties> {
            let desc = buffer.describe();
            let format = if desc.format == formats::R8G8B8A8_UNORM {
                vk::Format::R8G8B8A8_UNORM
            } else {
                vk::Format::UNDEFINED
            };
            Ok(HardwareBufferProperties {
                allocation_size: u64::from(desc.stride) * u64::from(desc.height) * 4,
                memory_type_bits: 0b1,
                format,
                conversion: ConversionParams::from_hardware_buffer(&vk::AndroidHardwareBufferFormatPropertiesANDROID {
                    format,
                    external_format: 0x77,
                    ..Default::default()
                }),
            })
        }

        fn create_sampling(&self, _conversion: &ConversionParams) -> VulkanResult<Sampling> {
            FakeImageBackend::bump(&self.base.live_samplers, 1);
            FakeImageBackend::bump(&self.base.live_conversions, 1);
            Ok(Sampling {
                sampler: Some(self.base.handle()),
                conversion: Some(self.base.handle()),
            })
        }

        fn create_imported_content(
            &self,
            _buffer: &dyn ExternalBuffer,
            _desc: &HardwareBufferDesc,
            _properties: &HardwareBufferProperties,
            sampling: &Sampling,
        ) -> VulkanResult<ImageContent> {
            assert!(sampling.conversion.is_some());
            FakeImageBackend::bump(&self.base.live_images, 1);
            let mut content = ImageContent::new(self.base.handle());

            if self.fail_content.get() {
                self.destroy_content(content);
                return Err(ImportError::Retryable("vkAllocateMemory: ERROR_OUT_OF_DEVICE_MEMORY".to_string()).into());
            }

            FakeImageBackend::bump(&self.base.live_memories, 1);
            content.memories.push(self.base.handle());
            FakeImageBackend::bump(&self.base.live_views, 1);
            content.view = self.base.handle();
            Ok(content)
        }
    }

    fn camera_info() -> ImageBasicInfo {
        ImageBasicInfo::default().with_layout(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL)
    }

    fn buffer(width: u32, height: u32, live: &Arc<AtomicUsize>) -> Arc<dyn ExternalBuffer> {
        Arc::new(FakeHardwareBuffer::tracked(
            HardwareBufferDesc::new(width, height, formats::Y8CB8CR8_420),
            Arc::clone(live),
        ))
    }

    #[test]
    fn test_import_extent_matches_buffer() {
        let backend = FakeImport::default();
        let live = Arc::new(AtomicUsize::new(0));
        let mut state = ImageState::new(camera_info());

        import_initial(&backend, &mut state, buffer(4032, 3024, &live)).unwrap();

        assert_eq!(state.info.extent, vk::Extent3D { width: 4032, height: 3024, depth: 1 });
        assert_eq!(state.info.format, vk::Format::UNDEFINED);
        assert_eq!(state.layout, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL);
        assert_eq!(state.content.as_ref().map(|c| c.memories.len()), Some(1));
        assert!(state.external.is_some());
        assert_eq!(live.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_reimport_keeps_sampler_and_conversion() {
        let backend = FakeImport::default();
        let live = Arc::new(AtomicUsize::new(0));
        let mut state = ImageState::new(camera_info());

        import_initial(&backend, &mut state, buffer(1920, 1080, &live)).unwrap();
        let sampling = state.sampling;
        let mut images = vec![state.content.as_ref().map(|c| c.image).unwrap()];

        for (width, height) in [(1280, 720), (4032, 3024), (640, 480)] {
            import_content(&backend, &mut state, buffer(width, height, &live)).unwrap();

            assert_eq!(state.sampling, sampling);
            assert_eq!(state.info.extent.width, width);
            assert_eq!(state.info.extent.height, height);
            images.push(state.content.as_ref().map(|c| c.image).unwrap());
        }

        images.dedup();
        assert_eq!(images.len(), 4);
        assert_eq!(backend.base.live_images.get(), 1);
        assert_eq!(backend.base.live_views.get(), 1);
        assert_eq!(backend.base.live_memories.get(), 1);
        assert_eq!(backend.base.live_samplers.get(), 1);
        assert_eq!(backend.base.live_conversions.get(), 1);
        // Only the current buffer is still retained
        assert_eq!(live.load(Ordering::SeqCst), 1);
        assert_eq!(backend.base.barriers.borrow().len(), 4);
    }

    #[test]
    fn test_empty_buffer_is_never_importable() {
        let backend = FakeImport::default();
        let live = Arc::new(AtomicUsize::new(0));
        let mut state = ImageState::new(camera_info());
        import_initial(&backend, &mut state, buffer(640, 480, &live)).unwrap();
        let before = state.content.clone();

        let err = import_content(&backend, &mut state, buffer(0, 480, &live)).unwrap_err();

        match err {
            VulkanError::Import(import) => assert!(!import.is_retryable()),
            other => panic!("unexpected error {other:?}"),
        }
        assert_eq!(state.content, before);
        assert_eq!(state.info.extent.width, 640);
    }

    #[test]
    fn test_failed_content_leaves_nothing_behind() {
        let backend = FakeImport::default();
        let live = Arc::new(AtomicUsize::new(0));
        let mut state = ImageState::new(camera_info());
        import_initial(&backend, &mut state, buffer(640, 480, &live)).unwrap();

        backend.fail_content.set(true);
        let err = import_content(&backend, &mut state, buffer(1280, 720, &live)).unwrap_err();

        assert!(matches!(err, VulkanError::Import(ref e) if e.is_retryable()));
        assert!(state.content.is_none());
        assert!(state.external.is_none());
        assert_eq!(backend.base.live_images.get(), 0);
        assert_eq!(backend.base.live_samplers.get(), 1);
        assert_eq!(live.load(Ordering::SeqCst), 0);

        backend.fail_content.set(false);
        import_content(&backend, &mut state, buffer(1280, 720, &live)).unwrap();
        release_state(&backend, &mut state);
        assert_eq!(backend.base.live_images.get(), 0);
        assert_eq!(backend.base.live_views.get(), 0);
        assert_eq!(backend.base.live_memories.get(), 0);
        assert_eq!(backend.base.live_samplers.get(), 0);
        assert_eq!(backend.base.live_conversions.get(), 0);
        assert_eq!(live.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_dedicated_requirement_check() {
        assert!(check_dedicated_requirements(true, true).is_ok());
        assert!(check_dedicated_requirements(true, false).is_ok());
        assert!(check_dedicated_requirements(false, true).is_ok());
        let err = check_dedicated_requirements(false, false).unwrap_err();
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_fake_handles_are_distinct() {
        let backend = FakeImageBackend::default();
        let a: vk::Image = backend.handle();
        let b: vk::Image = backend.handle();
        assert_ne!(a.as_raw(), b.as_raw());
    }
}

//! Device-local image creation

use std::sync::Arc;

use ash::vk;

use super::layout::{color_range, LayoutTransition};
use super::sampler::{sampler_create_info, ConversionParams};
use super::{DeviceImageBackend, ImageBackend, ImageBasicInfo, ImageContent, ImagePlan, ImageResource};
use crate::render::vulkan::{DeviceContext, VulkanError, VulkanResult};

impl ImageResource {
    /// Allocate an image in device-local memory
    ///
    /// The image is transitioned to `info.layout` before returning. Planar YUV
    /// formats get one allocation per plane, bound in a single call, plus a
    /// YCbCr conversion chained into the view and sampler. A sampler is only
    /// created for SAMPLED usage.
    pub fn create_device_local(
        context: &Arc<DeviceContext>,
        queue: vk::Queue,
        info: ImageBasicInfo,
    ) -> VulkanResult<Self> {
        if info.extent.width == 0 || info.extent.height == 0 || info.extent.depth == 0 {
            return Err(VulkanError::InvalidOperation {
                reason: format!("image extent {:?} is empty", info.extent),
            });
        }

        let plan = ImagePlan::for_info(&info);
        // Dropping `resource` on any early return frees what was built so far
        let mut resource = Self::empty(context, queue, info);

        resource.create_image(&plan)?;
        resource.bind_memory(&plan)?;
        if plan.needs_conversion {
            resource.create_conversion()?;
        }
        resource.transition_to_requested_layout()?;
        resource.create_view(&plan)?;
        if plan.needs_sampler {
            resource.create_sampler()?;
        }

        log::debug!(
            "Created device-local image {}x{} {:?} ({} allocation(s))",
            info.extent.width,
            info.extent.height,
            info.format,
            plan.allocation_count()
        );
        Ok(resource)
    }

    fn create_image(&mut self, plan: &ImagePlan) -> VulkanResult<()> {
        let info = &self.state.info;
        let create_info = vk::ImageCreateInfo::builder()
            .flags(plan.flags)
            .image_type(info.image_type)
            .format(info.format)
            .extent(info.extent)
            .mip_levels(info.mip_levels)
            .array_layers(info.array_layers)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(info.usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);

        let image = unsafe {
            self.context
                .device()
                .create_image(&create_info, None)
                .map_err(VulkanError::Api)?
        };
        self.context.set_object_name(image, "device-local-image");
        self.state.content = Some(ImageContent::new(image));
        self.state.layout = vk::ImageLayout::UNDEFINED;
        Ok(())
    }

    fn bind_memory(&mut self, plan: &ImagePlan) -> VulkanResult<()> {
        let image = self.image()?;
        let device = self.context.device().clone();
        let aspects = plan.plane_aspects();

        if aspects.is_empty() {
            let requirements = unsafe { device.get_image_memory_requirements(image) };
            let memory = self.allocate(requirements)?;
            unsafe { device.bind_image_memory(image, memory, 0).map_err(VulkanError::Api)? };
            return Ok(());
        }

        let mut memories = Vec::with_capacity(aspects.len());
        for &aspect in &aspects {
            let mut plane_info = vk::ImagePlaneMemoryRequirementsInfo::builder()
                .plane_aspect(aspect)
                .build();
            let requirements_info = vk::ImageMemoryRequirementsInfo2::builder()
                .image(image)
                .push_next(&mut plane_info);
            let mut requirements = vk::MemoryRequirements2::default();
            unsafe { device.get_image_memory_requirements2(&requirements_info, &mut requirements) };
            memories.push(self.allocate(requirements.memory_requirements)?);
        }

        let plane_infos: Vec<vk::BindImagePlaneMemoryInfo> = aspects
            .iter()
            .map(|&aspect| vk::BindImagePlaneMemoryInfo::builder().plane_aspect(aspect).build())
            .collect();
        let bind_infos: Vec<vk::BindImageMemoryInfo> = plane_infos
            .iter()
            .zip(&memories)
            .map(|(plane_info, &memory)| vk::BindImageMemoryInfo {
                p_next: (plane_info as *const vk::BindImagePlaneMemoryInfo).cast(),
                image,
                memory,
                memory_offset: 0,
                ..Default::default()
            })
            .collect();

        unsafe { device.bind_image_memory2(&bind_infos).map_err(VulkanError::Api) }
    }

    fn allocate(&mut self, requirements: vk::MemoryRequirements) -> VulkanResult<vk::DeviceMemory> {
        let memory_type_index = self.context.memory_type_index(
            requirements.memory_type_bits,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
            false,
        )?;
        let allocate_info = vk::MemoryAllocateInfo::builder()
            .allocation_size(requirements.size)
            .memory_type_index(memory_type_index);

        let memory = unsafe {
            self.context
                .device()
                .allocate_memory(&allocate_info, None)
                .map_err(|err| match err {
                    vk::Result::ERROR_OUT_OF_DEVICE_MEMORY | vk::Result::ERROR_OUT_OF_HOST_MEMORY => {
                        VulkanError::OutOfMemory {
                            requested: requirements.size,
                        }
                    }
                    other => VulkanError::Api(other),
                })?
        };
        self.context.set_object_name(memory, "device-local-image-memory");

        if let Some(content) = self.state.content.as_mut() {
            content.memories.push(memory);
        }
        Ok(memory)
    }

    fn create_conversion(&mut self) -> VulkanResult<()> {
        let create_info = ConversionParams::device_local(self.state.info.format).create_info();
        let conversion = unsafe {
            self.context
                .device()
                .create_sampler_ycbcr_conversion(&create_info, None)
                .map_err(VulkanError::Api)?
        };
        self.state.sampling.conversion = Some(conversion);
        Ok(())
    }

    fn transition_to_requested_layout(&mut self) -> VulkanResult<()> {
        let target = self.state.info.layout;
        if target == vk::ImageLayout::UNDEFINED || target == vk::ImageLayout::PREINITIALIZED {
            return Ok(());
        }
        let image = self.image()?;
        let range = color_range(self.state.info.mip_levels, self.state.info.array_layers);
        let backend = DeviceImageBackend::new(&self.context, self.queue);
        backend.transition(
            image,
            range,
            &mut self.state.layout,
            LayoutTransition::to(target).from_layout(vk::ImageLayout::UNDEFINED),
        )
    }

    fn create_view(&mut self, plan: &ImagePlan) -> VulkanResult<()> {
        let image = self.image()?;
        let info = self.state.info;
        let conversion_info = self
            .state
            .sampling
            .conversion
            .map(|conversion| vk::SamplerYcbcrConversionInfo::builder().conversion(conversion).build());

        let mut view_info = vk::ImageViewCreateInfo::builder()
            .image(image)
            .view_type(plan.view_type)
            .format(info.format)
            .subresource_range(color_range(info.mip_levels, info.array_layers))
            .build();
        if let Some(conversion_info) = conversion_info.as_ref() {
            view_info.p_next = (conversion_info as *const vk::SamplerYcbcrConversionInfo).cast();
        }

        let view = unsafe {
            self.context
                .device()
                .create_image_view(&view_info, None)
                .map_err(VulkanError::Api)?
        };
        if let Some(content) = self.state.content.as_mut() {
            content.view = view;
        }
        Ok(())
    }

    fn create_sampler(&mut self) -> VulkanResult<()> {
        let info = self.state.info;
        let conversion_info = self
            .state
            .sampling
            .conversion
            .map(|conversion| vk::SamplerYcbcrConversionInfo::builder().conversion(conversion).build());

        let mut sampler_info = sampler_create_info(info.mip_levels, info.unnormalized_coordinates);
        if let Some(conversion_info) = conversion_info.as_ref() {
            sampler_info.p_next = (conversion_info as *const vk::SamplerYcbcrConversionInfo).cast();
        }

        let sampler = unsafe {
            self.context
                .device()
                .create_sampler(&sampler_info, None)
                .map_err(VulkanError::Api)?
        };
        self.context.set_object_name(sampler, "device-local-sampler");
        self.state.sampling.sampler = Some(sampler);
        Ok(())
    }
}

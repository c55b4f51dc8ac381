//! Creation parameters derived from an [`ImageBasicInfo`]

use ash::vk;

use super::format::{is_yuv, plane_aspect, plane_count};
use super::ImageBasicInfo;

/// What a device-local image needs: flags, allocations, view and sampling
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImagePlan {
    /// Image create flags
    pub flags: vk::ImageCreateFlags,
    /// View type matching the image type and layer count
    pub view_type: vk::ImageViewType,
    /// Number of memory planes in the format
    pub plane_count: u32,
    /// Whether every plane gets its own allocation
    pub disjoint: bool,
    /// Whether a YCbCr conversion is chained into view and sampler
    pub needs_conversion: bool,
    /// Whether a sampler is created
    pub needs_sampler: bool,
}

impl ImagePlan {
    /// Derive the plan for `info`
    pub fn for_info(info: &ImageBasicInfo) -> Self {
        let yuv = is_yuv(info.format);

        let mut flags = vk::ImageCreateFlags::empty();
        if info.array_layers == 6 {
            flags |= vk::ImageCreateFlags::CUBE_COMPATIBLE;
        }
        if yuv {
            flags |= vk::ImageCreateFlags::DISJOINT;
        }

        let view_type = match info.image_type {
            vk::ImageType::TYPE_3D => vk::ImageViewType::TYPE_3D,
            vk::ImageType::TYPE_1D if info.array_layers > 1 => vk::ImageViewType::TYPE_1D_ARRAY,
            vk::ImageType::TYPE_1D => vk::ImageViewType::TYPE_1D,
            _ if info.array_layers == 6 => vk::ImageViewType::CUBE,
            _ if info.array_layers > 1 => vk::ImageViewType::TYPE_2D_ARRAY,
            _ => vk::ImageViewType::TYPE_2D,
        };

        Self {
            flags,
            view_type,
            plane_count: plane_count(info.format),
            disjoint: yuv,
            needs_conversion: yuv,
            needs_sampler: info.usage.contains(vk::ImageUsageFlags::SAMPLED),
        }
    }

    /// Number of memory allocations the image owns
    pub fn allocation_count(&self) -> u32 {
        if self.disjoint {
            self.plane_count
        } else {
            1
        }
    }

    /// Plane aspects to allocate and bind separately; empty for a single allocation
    pub fn plane_aspects(&self) -> Vec<vk::ImageAspectFlags> {
        if self.disjoint {
            (0..self.plane_count).map(plane_aspect).collect()
        } else {
            Vec::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::vulkan::image::format::{is_three_plane_420, YUV_FORMATS};

    #[test]
    fn test_single_plane_formats_get_one_allocation() {
        for format in [
            vk::Format::R8G8B8A8_UNORM,
            vk::Format::B8G8R8A8_UNORM,
            vk::Format::R16G16B16A16_SFLOAT,
            vk::Format::R8_UNORM,
        ] {
            let plan = ImagePlan::for_info(&ImageBasicInfo::default().with_format(format));
            assert_eq!(plan.allocation_count(), 1);
            assert!(plan.plane_aspects().is_empty());
            assert!(!plan.flags.contains(vk::ImageCreateFlags::DISJOINT));
            assert!(!plan.needs_conversion);
            assert_eq!(plan.view_type, vk::ImageViewType::TYPE_2D);
        }
    }

    #[test]
    fn test_three_plane_420_gets_three_bound_planes() {
        for format in YUV_FORMATS.into_iter().filter(|&f| is_three_plane_420(f)) {
            let plan = ImagePlan::for_info(&ImageBasicInfo::default().with_format(format));
            assert_eq!(plan.allocation_count(), 3);
            assert_eq!(
                plan.plane_aspects(),
                vec![
                    vk::ImageAspectFlags::PLANE_0,
                    vk::ImageAspectFlags::PLANE_1,
                    vk::ImageAspectFlags::PLANE_2
                ]
            );
            assert!(plan.flags.contains(vk::ImageCreateFlags::DISJOINT));
            assert!(plan.needs_conversion);
        }
    }

    #[test]
    fn test_two_plane_formats_bind_both_planes() {
        let plan = ImagePlan::for_info(&ImageBasicInfo::default().with_format(vk::Format::G8_B8R8_2PLANE_420_UNORM));
        assert_eq!(plan.allocation_count(), 2);
        assert!(plan.flags.contains(vk::ImageCreateFlags::DISJOINT));
    }

    #[test]
    fn test_view_types() {
        let cube = ImagePlan::for_info(&ImageBasicInfo::default().with_array_layers(6));
        assert_eq!(cube.view_type, vk::ImageViewType::CUBE);
        assert!(cube.flags.contains(vk::ImageCreateFlags::CUBE_COMPATIBLE));

        let array = ImagePlan::for_info(&ImageBasicInfo::default().with_array_layers(4));
        assert_eq!(array.view_type, vk::ImageViewType::TYPE_2D_ARRAY);
        assert!(array.flags.is_empty());

        let volume = ImagePlan::for_info(&ImageBasicInfo::default().with_image_type(vk::ImageType::TYPE_3D));
        assert_eq!(volume.view_type, vk::ImageViewType::TYPE_3D);
    }

    #[test]
    fn test_sampler_only_for_sampled_usage() {
        let sampled = ImagePlan::for_info(&ImageBasicInfo::default());
        assert!(sampled.needs_sampler);

        let storage = ImagePlan::for_info(&ImageBasicInfo::default().with_usage(vk::ImageUsageFlags::STORAGE));
        assert!(!storage.needs_sampler);
    }
}

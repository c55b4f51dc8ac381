//! Pixel format classification

use ash::vk;

/// Multi-planar YCbCr formats that need a sampler conversion
pub const YUV_FORMATS: [vk::Format; 20] = [
    vk::Format::G8_B8R8_2PLANE_420_UNORM,
    vk::Format::G8_B8R8_2PLANE_422_UNORM,
    vk::Format::G16_B16R16_2PLANE_420_UNORM,
    vk::Format::G16_B16R16_2PLANE_422_UNORM,
    vk::Format::G10X6_B10X6R10X6_2PLANE_420_UNORM_3PACK16,
    vk::Format::G10X6_B10X6R10X6_2PLANE_422_UNORM_3PACK16,
    vk::Format::G12X4_B12X4R12X4_2PLANE_420_UNORM_3PACK16,
    vk::Format::G12X4_B12X4R12X4_2PLANE_422_UNORM_3PACK16,
    vk::Format::G8_B8_R8_3PLANE_420_UNORM,
    vk::Format::G8_B8_R8_3PLANE_422_UNORM,
    vk::Format::G8_B8_R8_3PLANE_444_UNORM,
    vk::Format::G16_B16_R16_3PLANE_420_UNORM,
    vk::Format::G16_B16_R16_3PLANE_422_UNORM,
    vk::Format::G16_B16_R16_3PLANE_444_UNORM,
    vk::Format::G10X6_B10X6_R10X6_3PLANE_420_UNORM_3PACK16,
    vk::Format::G10X6_B10X6_R10X6_3PLANE_422_UNORM_3PACK16,
    vk::Format::G10X6_B10X6_R10X6_3PLANE_444_UNORM_3PACK16,
    vk::Format::G12X4_B12X4_R12X4_3PLANE_420_UNORM_3PACK16,
    vk::Format::G12X4_B12X4_R12X4_3PLANE_422_UNORM_3PACK16,
    vk::Format::G12X4_B12X4_R12X4_3PLANE_444_UNORM_3PACK16,
];

const THREE_PLANE_420: [vk::Format; 4] = [
    vk::Format::G8_B8_R8_3PLANE_420_UNORM,
    vk::Format::G16_B16_R16_3PLANE_420_UNORM,
    vk::Format::G10X6_B10X6_R10X6_3PLANE_420_UNORM_3PACK16,
    vk::Format::G12X4_B12X4_R12X4_3PLANE_420_UNORM_3PACK16,
];

/// Whether `format` is one of the multi-planar YCbCr formats
pub fn is_yuv(format: vk::Format) -> bool {
    YUV_FORMATS.contains(&format)
}

/// Whether `format` stores Y, U and V in three separate 4:2:0 planes
pub fn is_three_plane_420(format: vk::Format) -> bool {
    THREE_PLANE_420.contains(&format)
}

/// Number of memory planes of `format`
pub fn plane_count(format: vk::Format) -> u32 {
    match YUV_FORMATS.iter().position(|&f| f == format) {
        Some(index) if index < 8 => 2,
        Some(_) => 3,
        None => 1,
    }
}

/// Aspect flag selecting plane `index`
pub fn plane_aspect(index: u32) -> vk::ImageAspectFlags {
    match index {
        0 => vk::ImageAspectFlags::PLANE_0,
        1 => vk::ImageAspectFlags::PLANE_1,
        _ => vk::ImageAspectFlags::PLANE_2,
    }
}

/// Whether a depth format also carries stencil
pub fn has_stencil(format: vk::Format) -> bool {
    matches!(
        format,
        vk::Format::S8_UINT
            | vk::Format::D16_UNORM_S8_UINT
            | vk::Format::D24_UNORM_S8_UINT
            | vk::Format::D32_SFLOAT_S8_UINT
    )
}

/// Aspects covered by a depth attachment view of `format`
pub fn depth_aspect(format: vk::Format) -> vk::ImageAspectFlags {
    if has_stencil(format) {
        vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
    } else {
        vk::ImageAspectFlags::DEPTH
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_yuv_classification() {
        for format in YUV_FORMATS {
            assert!(is_yuv(format));
            assert!(plane_count(format) >= 2);
        }
        for format in [
            vk::Format::R8G8B8A8_UNORM,
            vk::Format::B8G8R8A8_SRGB,
            vk::Format::G8B8G8R8_422_UNORM,
            vk::Format::UNDEFINED,
        ] {
            assert!(!is_yuv(format));
            assert_eq!(plane_count(format), 1);
        }
    }

    #[test]
    fn test_plane_counts() {
        assert_eq!(plane_count(vk::Format::G8_B8R8_2PLANE_420_UNORM), 2);
        assert_eq!(plane_count(vk::Format::G12X4_B12X4R12X4_2PLANE_422_UNORM_3PACK16), 2);
        assert_eq!(plane_count(vk::Format::G8_B8_R8_3PLANE_420_UNORM), 3);
        assert_eq!(plane_count(vk::Format::G16_B16_R16_3PLANE_444_UNORM), 3);

        for format in THREE_PLANE_420 {
            assert!(is_three_plane_420(format));
            assert_eq!(plane_count(format), 3);
        }
        assert!(!is_three_plane_420(vk::Format::G8_B8_R8_3PLANE_422_UNORM));
    }

    #[test]
    fn test_depth_aspects() {
        assert_eq!(depth_aspect(vk::Format::D32_SFLOAT), vk::ImageAspectFlags::DEPTH);
        assert_eq!(
            depth_aspect(vk::Format::D24_UNORM_S8_UINT),
            vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
        );
    }
}

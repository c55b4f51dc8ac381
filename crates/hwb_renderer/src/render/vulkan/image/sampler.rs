//! Sampler and YCbCr conversion parameters
//!
//! Everything here is plain data; the image module chains the conversion info
//! and creates the objects.

use ash::vk;

/// Sampler for a device-local image
///
/// Normalized coordinates get trilinear filtering across all mips. Unnormalized
/// coordinates (compute-style texel fetch) require nearest filtering without
/// mips.
pub fn sampler_create_info(mip_levels: u32, unnormalized_coordinates: bool) -> vk::SamplerCreateInfo {
    let (filter, mipmap_mode, max_lod) = if unnormalized_coordinates {
        (vk::Filter::NEAREST, vk::SamplerMipmapMode::NEAREST, 0.0)
    } else {
        (vk::Filter::LINEAR, vk::SamplerMipmapMode::LINEAR, mip_levels as f32)
    };

    vk::SamplerCreateInfo {
        mag_filter: filter,
        min_filter: filter,
        mipmap_mode,
        address_mode_u: vk::SamplerAddressMode::CLAMP_TO_EDGE,
        address_mode_v: vk::SamplerAddressMode::CLAMP_TO_EDGE,
        address_mode_w: vk::SamplerAddressMode::CLAMP_TO_EDGE,
        mip_lod_bias: 0.0,
        anisotropy_enable: vk::FALSE,
        max_anisotropy: 1.0,
        compare_enable: vk::FALSE,
        compare_op: vk::CompareOp::NEVER,
        min_lod: 0.0,
        max_lod,
        border_color: vk::BorderColor::FLOAT_OPAQUE_WHITE,
        unnormalized_coordinates: if unnormalized_coordinates { vk::TRUE } else { vk::FALSE },
        ..Default::default()
    }
}

/// Immutable sampler used with an imported hardware buffer
pub fn hardware_buffer_sampler_info() -> vk::SamplerCreateInfo {
    vk::SamplerCreateInfo {
        mag_filter: vk::Filter::NEAREST,
        min_filter: vk::Filter::NEAREST,
        mipmap_mode: vk::SamplerMipmapMode::NEAREST,
        address_mode_u: vk::SamplerAddressMode::CLAMP_TO_EDGE,
        address_mode_v: vk::SamplerAddressMode::CLAMP_TO_EDGE,
        address_mode_w: vk::SamplerAddressMode::CLAMP_TO_EDGE,
        mip_lod_bias: 0.0,
        anisotropy_enable: vk::FALSE,
        max_anisotropy: 1.0,
        compare_enable: vk::FALSE,
        compare_op: vk::CompareOp::NEVER,
        min_lod: 0.0,
        max_lod: 0.0,
        border_color: vk::BorderColor::FLOAT_OPAQUE_WHITE,
        unnormalized_coordinates: vk::FALSE,
        ..Default::default()
    }
}

/// YCbCr conversion parameters
#[derive(Debug, Clone, Copy)]
pub struct ConversionParams {
    /// Image format, UNDEFINED for driver-private formats
    pub format: vk::Format,
    /// Driver-private format, chained as `VkExternalFormatANDROID`
    pub external_format: Option<u64>,
    /// Color model
    pub model: vk::SamplerYcbcrModelConversion,
    /// Narrow or full range
    pub range: vk::SamplerYcbcrRange,
    /// Component swizzle applied before conversion
    pub components: vk::ComponentMapping,
    /// Horizontal chroma siting
    pub x_chroma_offset: vk::ChromaLocation,
    /// Vertical chroma siting
    pub y_chroma_offset: vk::ChromaLocation,
    /// Chroma reconstruction filter
    pub chroma_filter: vk::Filter,
}

impl ConversionParams {
    /// BT.709 full-range conversion for a device-local YUV image
    pub fn device_local(format: vk::Format) -> Self {
        Self {
            format,
            external_format: None,
            model: vk::SamplerYcbcrModelConversion::YCBCR_709,
            range: vk::SamplerYcbcrRange::ITU_FULL,
            components: vk::ComponentMapping::default(),
            x_chroma_offset: vk::ChromaLocation::MIDPOINT,
            y_chroma_offset: vk::ChromaLocation::MIDPOINT,
            chroma_filter: vk::Filter::LINEAR,
        }
    }

    /// Conversion suggested by the driver for an imported hardware buffer
    ///
    /// Driver-private formats use the suggested model; known formats are
    /// treated as BT.601.
    pub fn from_hardware_buffer(properties: &vk::AndroidHardwareBufferFormatPropertiesANDROID) -> Self {
        let (external_format, model) = if properties.format == vk::Format::UNDEFINED {
            (Some(properties.external_format), properties.suggested_ycbcr_model)
        } else {
            (None, vk::SamplerYcbcrModelConversion::YCBCR_601)
        };

        Self {
            format: properties.format,
            external_format,
            model,
            range: properties.suggested_ycbcr_range,
            components: properties.sampler_ycbcr_conversion_components,
            x_chroma_offset: properties.suggested_x_chroma_offset,
            y_chroma_offset: properties.suggested_y_chroma_offset,
            chroma_filter: vk::Filter::NEAREST,
        }
    }

    /// Create info without any `p_next` chain
    pub fn create_info(&self) -> vk::SamplerYcbcrConversionCreateInfo {
        vk::SamplerYcbcrConversionCreateInfo {
            format: self.format,
            ycbcr_model: self.model,
            ycbcr_range: self.range,
            components: self.components,
            x_chroma_offset: self.x_chroma_offset,
            y_chroma_offset: self.y_chroma_offset,
            chroma_filter: self.chroma_filter,
            force_explicit_reconstruction: vk::FALSE,
            ..Default::default()
        }
    }
}

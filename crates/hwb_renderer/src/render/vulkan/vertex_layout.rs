//! Vertex layout of the textured quad
//!
//! Position is a homogeneous `vec4`, followed by a `vec2` texture coordinate.

use ash::vk;
use bytemuck::{Pod, Zeroable};

/// Textured vertex as consumed by the camera shaders
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct VertexUv {
    /// Clip-space position, w = 1
    pub position: [f32; 4],
    /// Texture coordinate
    pub uv: [f32; 2],
}

impl VertexUv {
    const fn new(x: f32, y: f32, u: f32, v: f32) -> Self {
        Self {
            position: [x, y, 0.0, 1.0],
            uv: [u, v],
        }
    }
}

/// Full-screen quad as two triangles
pub const QUAD_VERTICES: [VertexUv; 6] = [
    VertexUv::new(-1.0, -1.0, 0.0, 0.0),
    VertexUv::new(-1.0, 1.0, 0.0, 1.0),
    VertexUv::new(1.0, -1.0, 1.0, 0.0),
    VertexUv::new(1.0, -1.0, 1.0, 0.0),
    VertexUv::new(-1.0, 1.0, 0.0, 1.0),
    VertexUv::new(1.0, 1.0, 1.0, 1.0),
];

/// Vulkan vertex input description for [`VertexUv`]
pub struct VulkanVertexLayout;

impl VulkanVertexLayout {
    /// Single per-vertex binding at slot 0
    pub fn binding_description() -> vk::VertexInputBindingDescription {
        vk::VertexInputBindingDescription {
            binding: 0,
            stride: std::mem::size_of::<VertexUv>() as u32,
            input_rate: vk::VertexInputRate::VERTEX,
        }
    }

    /// Position at location 0, uv at location 1
    pub fn attribute_descriptions() -> [vk::VertexInputAttributeDescription; 2] {
        [
            vk::VertexInputAttributeDescription {
                binding: 0,
                location: 0,
                format: vk::Format::R32G32B32A32_SFLOAT,
                offset: 0,
            },
            vk::VertexInputAttributeDescription {
                binding: 0,
                location: 1,
                format: vk::Format::R32G32_SFLOAT,
                offset: std::mem::size_of::<[f32; 4]>() as u32,
            },
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    const EPSILON: f32 = 1e-6;

    #[test]
    fn test_layout_matches_struct() {
        assert_eq!(std::mem::size_of::<VertexUv>(), 24);
        assert_eq!(VulkanVertexLayout::binding_description().stride, 24);
        let attributes = VulkanVertexLayout::attribute_descriptions();
        assert_eq!(attributes[1].offset, 16);
        assert_eq!(bytemuck::cast_slice::<VertexUv, u8>(&QUAD_VERTICES).len(), 6 * 24);
    }

    #[test]
    fn test_quad_covers_clip_space() {
        for vertex in &QUAD_VERTICES {
            assert_relative_eq!(vertex.position[0].abs(), 1.0, epsilon = EPSILON);
            assert_relative_eq!(vertex.position[1].abs(), 1.0, epsilon = EPSILON);
            assert_relative_eq!(vertex.position[3], 1.0, epsilon = EPSILON);
            // uv follows position
            assert_relative_eq!(vertex.uv[0], (vertex.position[0] + 1.0) / 2.0, epsilon = EPSILON);
            assert_relative_eq!(vertex.uv[1], (vertex.position[1] + 1.0) / 2.0, epsilon = EPSILON);
        }
    }
}

//! Memory type resolution

use ash::vk;

use crate::render::vulkan::{VulkanError, VulkanResult};

/// Find a memory type index for an allocation
///
/// Normal mode walks the device's memory types and returns the first one that
/// is allowed by `type_bits` and carries every flag in `properties`.
///
/// External mode is for imported memory: the import already reported which
/// type bits are valid, so the first allowed index wins and `properties` is
/// ignored.
pub fn find_memory_type(
    memory_properties: &vk::PhysicalDeviceMemoryProperties,
    type_bits: u32,
    properties: vk::MemoryPropertyFlags,
    external: bool,
) -> VulkanResult<u32> {
    let count = memory_properties.memory_type_count.min(vk::MAX_MEMORY_TYPES as u32);

    (0..count)
        .find(|&index| {
            if type_bits & (1 << index) == 0 {
                return false;
            }
            external
                || memory_properties.memory_types[index as usize]
                    .property_flags
                    .contains(properties)
        })
        .ok_or(VulkanError::NoSuitableMemoryType { type_bits, properties })
}

/// Whether writes through a mapping of this memory type need an explicit flush
pub fn needs_flush(memory_properties: &vk::PhysicalDeviceMemoryProperties, type_index: u32) -> bool {
    memory_properties
        .memory_types
        .get(type_index as usize)
        .map_or(true, |memory_type| {
            !memory_type
                .property_flags
                .contains(vk::MemoryPropertyFlags::HOST_COHERENT)
        })
}

#[cfg(test)]
pub(crate) fn test_memory_properties(types: &[vk::MemoryPropertyFlags]) -> vk::PhysicalDeviceMemoryProperties {
    let mut props = vk::PhysicalDeviceMemoryProperties {
        memory_type_count: types.len() as u32,
        memory_heap_count: 1,
        ..Default::default()
    };
    for (slot, flags) in props.memory_types.iter_mut().zip(types) {
        slot.property_flags = *flags;
        slot.heap_index = 0;
    }
    props
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_properties() -> vk::PhysicalDeviceMemoryProperties {
        test_memory_properties(&[
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
            vk::MemoryPropertyFlags::HOST_VISIBLE,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
            vk::MemoryPropertyFlags::DEVICE_LOCAL | vk::MemoryPropertyFlags::HOST_VISIBLE,
        ])
    }

    #[test]
    fn test_requires_every_requested_flag() {
        let props = sample_properties();
        let coherent = vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT;

        assert_eq!(find_memory_type(&props, 0b1111, coherent, false).unwrap(), 2);
        assert_eq!(
            find_memory_type(&props, 0b1111, vk::MemoryPropertyFlags::DEVICE_LOCAL, false).unwrap(),
            0
        );
    }

    #[test]
    fn test_honors_type_bits() {
        let props = sample_properties();
        let index = find_memory_type(&props, 0b1000, vk::MemoryPropertyFlags::DEVICE_LOCAL, false).unwrap();
        assert_eq!(index, 3);

        let err = find_memory_type(&props, 0b0001, vk::MemoryPropertyFlags::HOST_VISIBLE, false);
        assert!(matches!(err, Err(VulkanError::NoSuitableMemoryType { type_bits: 0b0001, .. })));
    }

    #[test]
    fn test_external_mode_ignores_properties() {
        let props = sample_properties();
        let index = find_memory_type(&props, 0b0100, vk::MemoryPropertyFlags::DEVICE_LOCAL, true).unwrap();
        assert_eq!(index, 2);

        // Bits beyond the reported type count never match
        assert!(find_memory_type(&props, 1 << 7, vk::MemoryPropertyFlags::empty(), true).is_err());
    }

    #[test]
    fn test_needs_flush() {
        let props = sample_properties();
        assert!(needs_flush(&props, 1));
        assert!(!needs_flush(&props, 2));
        assert!(needs_flush(&props, 31));
    }
}

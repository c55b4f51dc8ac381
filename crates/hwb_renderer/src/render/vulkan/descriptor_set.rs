//! Descriptor set layouts, pools and writes
//!
//! YCbCr samplers can only be used as immutable samplers, so the layout
//! builder accepts a sampler per binding and keeps it alive until the layout
//! is created.

use ash::{vk, Device};

use crate::render::vulkan::{VulkanError, VulkanResult};

/// One binding before it becomes a `vk::DescriptorSetLayoutBinding`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BindingSpec {
    /// Binding slot
    pub binding: u32,
    /// Descriptor type
    pub descriptor_type: vk::DescriptorType,
    /// Stages that read the binding
    pub stage_flags: vk::ShaderStageFlags,
    /// Sampler baked into the layout
    pub immutable_sampler: Option<vk::Sampler>,
}

/// Descriptor set layout builder for creating reusable layouts
#[derive(Debug, Clone, Default)]
pub struct DescriptorSetLayoutBuilder {
    bindings: Vec<BindingSpec>,
}

impl DescriptorSetLayoutBuilder {
    /// Create a new descriptor set layout builder
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a uniform buffer binding
    pub fn add_uniform_buffer(mut self, binding: u32, stage_flags: vk::ShaderStageFlags) -> Self {
        self.bindings.push(BindingSpec {
            binding,
            descriptor_type: vk::DescriptorType::UNIFORM_BUFFER,
            stage_flags,
            immutable_sampler: None,
        });
        self
    }

    /// Add a combined image sampler binding, optionally with an immutable sampler
    pub fn add_combined_image_sampler(
        mut self,
        binding: u32,
        stage_flags: vk::ShaderStageFlags,
        immutable_sampler: Option<vk::Sampler>,
    ) -> Self {
        self.bindings.push(BindingSpec {
            binding,
            descriptor_type: vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
            stage_flags,
            immutable_sampler,
        });
        self
    }

    /// Bindings added so far
    pub fn bindings(&self) -> &[BindingSpec] {
        &self.bindings
    }

    /// Build the descriptor set layout
    pub fn build(self, device: &Device) -> VulkanResult<DescriptorSetLayout> {
        let samplers: Vec<[vk::Sampler; 1]> = self
            .bindings
            .iter()
            .map(|spec| [spec.immutable_sampler.unwrap_or_default()])
            .collect();

        let bindings: Vec<vk::DescriptorSetLayoutBinding> = self
            .bindings
            .iter()
            .zip(&samplers)
            .map(|(spec, sampler)| {
                let binding = vk::DescriptorSetLayoutBinding::builder()
                    .binding(spec.binding)
                    .descriptor_type(spec.descriptor_type)
                    .descriptor_count(1)
                    .stage_flags(spec.stage_flags);
                if spec.immutable_sampler.is_some() {
                    binding.immutable_samplers(sampler).build()
                } else {
                    binding.build()
                }
            })
            .collect();

        let layout_info = vk::DescriptorSetLayoutCreateInfo::builder().bindings(&bindings);

        let layout = unsafe { device.create_descriptor_set_layout(&layout_info, None) }.map_err(VulkanError::Api)?;

        Ok(DescriptorSetLayout {
            layout,
            device: device.clone(),
            bindings: self.bindings,
        })
    }
}

/// Descriptor set layout wrapper with automatic cleanup
pub struct DescriptorSetLayout {
    layout: vk::DescriptorSetLayout,
    device: Device,
    bindings: Vec<BindingSpec>,
}

impl DescriptorSetLayout {
    /// Get the Vulkan descriptor set layout handle
    pub fn handle(&self) -> vk::DescriptorSetLayout {
        self.layout
    }

    /// Get the bindings used in this layout
    pub fn bindings(&self) -> &[BindingSpec] {
        &self.bindings
    }
}

impl Drop for DescriptorSetLayout {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_descriptor_set_layout(self.layout, None);
        }
    }
}

/// Pool sizes for the camera engine: one uniform buffer, two samplers
pub fn camera_pool_sizes() -> [vk::DescriptorPoolSize; 2] {
    [
        vk::DescriptorPoolSize {
            ty: vk::DescriptorType::UNIFORM_BUFFER,
            descriptor_count: 1,
        },
        vk::DescriptorPoolSize {
            ty: vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
            descriptor_count: 2,
        },
    ]
}

/// Maximum sets the camera pool hands out
pub const CAMERA_POOL_MAX_SETS: u32 = 2;

/// Descriptor pool for allocating descriptor sets
pub struct DescriptorPool {
    pool: vk::DescriptorPool,
    device: Device,
}

impl DescriptorPool {
    /// Create a new descriptor pool
    pub fn new(device: Device, pool_sizes: &[vk::DescriptorPoolSize], max_sets: u32) -> VulkanResult<Self> {
        let pool_info = vk::DescriptorPoolCreateInfo::builder()
            .max_sets(max_sets)
            .pool_sizes(pool_sizes);

        let pool = unsafe { device.create_descriptor_pool(&pool_info, None) }.map_err(VulkanError::Api)?;

        Ok(Self { pool, device })
    }

    /// Allocate one set per layout
    pub fn allocate_descriptor_sets(&self, layouts: &[vk::DescriptorSetLayout]) -> VulkanResult<Vec<vk::DescriptorSet>> {
        let alloc_info = vk::DescriptorSetAllocateInfo::builder()
            .descriptor_pool(self.pool)
            .set_layouts(layouts);

        unsafe { self.device.allocate_descriptor_sets(&alloc_info) }.map_err(VulkanError::Api)
    }

    /// Get the pool handle
    pub fn handle(&self) -> vk::DescriptorPool {
        self.pool
    }
}

impl Drop for DescriptorPool {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_descriptor_pool(self.pool, None);
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum PendingWrite {
    Buffer {
        set: vk::DescriptorSet,
        binding: u32,
        info: vk::DescriptorBufferInfo,
    },
    Image {
        set: vk::DescriptorSet,
        binding: u32,
        info: vk::DescriptorImageInfo,
    },
}

/// Descriptor set writer for updating descriptor sets
///
/// Infos are stored by value and only turned into `vk::WriteDescriptorSet`
/// inside [`update`](Self::update), so no pointer outlives its target.
#[derive(Debug, Clone, Default)]
pub struct DescriptorSetWriter {
    writes: Vec<PendingWrite>,
}

impl DescriptorSetWriter {
    /// Create a new descriptor set writer
    pub fn new() -> Self {
        Self::default()
    }

    /// Write a uniform buffer to a descriptor set
    pub fn write_buffer(mut self, set: vk::DescriptorSet, binding: u32, info: vk::DescriptorBufferInfo) -> Self {
        self.writes.push(PendingWrite::Buffer { set, binding, info });
        self
    }

    /// Write a combined image sampler to a descriptor set
    pub fn write_image(mut self, set: vk::DescriptorSet, binding: u32, info: vk::DescriptorImageInfo) -> Self {
        self.writes.push(PendingWrite::Image { set, binding, info });
        self
    }

    /// Number of queued writes
    pub fn len(&self) -> usize {
        self.writes.len()
    }

    /// Whether nothing is queued
    pub fn is_empty(&self) -> bool {
        self.writes.is_empty()
    }

    /// Execute all write operations
    pub fn update(self, device: &Device) {
        let writes: Vec<vk::WriteDescriptorSet> = self
            .writes
            .iter()
            .map(|write| match write {
                PendingWrite::Buffer { set, binding, info } => vk::WriteDescriptorSet::builder()
                    .dst_set(*set)
                    .dst_binding(*binding)
                    .dst_array_element(0)
                    .descriptor_type(vk::DescriptorType::UNIFORM_BUFFER)
                    .buffer_info(std::slice::from_ref(info))
                    .build(),
                PendingWrite::Image { set, binding, info } => vk::WriteDescriptorSet::builder()
                    .dst_set(*set)
                    .dst_binding(*binding)
                    .dst_array_element(0)
                    .descriptor_type(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
                    .image_info(std::slice::from_ref(info))
                    .build(),
            })
            .collect();

        unsafe {
            device.update_descriptor_sets(&writes, &[]);
        }
    }
}
